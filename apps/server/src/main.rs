use anyhow::{anyhow, Result};
use rce_protocol::{MemoryBus, PlcClient, RegisterBus};
use rce_server::alarm::{AlarmFlag, AlarmMonitor};
use rce_server::alerts::AlertLayer;
use rce_server::config::ControllerConfig;
use rce_server::control::{supervise, ControlLoop, RandomEfficiency};
use rce_server::doors::DoorSequencer;
use rce_server::forecast::HttpForecastClient;
use rce_server::modes::ModeController;
use rce_server::records::FileRecorder;
use rce_server::web::{create_web_server, SharedStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

async fn serve<B: RegisterBus>(bus: Arc<B>, config: ControllerConfig) -> Result<()> {
    let alarm = AlarmFlag::default();
    let doors = Arc::new(DoorSequencer::new(bus.clone(), alarm.clone(), config.test_mode));
    let modes = Arc::new(ModeController::new(bus.clone(), doors.clone()));
    let status = SharedStatus::default();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = AlarmMonitor::new(bus.clone(), doors, alarm.clone(), config.alarm_poll())
        .spawn(shutdown_rx.clone());

    if let Some(bind) = config.status_bind.clone() {
        let status = status.clone();
        tokio::spawn(async move {
            if let Err(e) = create_web_server(&bind, status).await {
                error!("{:#}", e);
            }
        });
    }

    let forecasts = HttpForecastClient::new(&config.predict_url, &config.forecast)?;
    let recorder = FileRecorder::new(&config.paths.output_csv, &config.paths.heartbeat);
    let control = ControlLoop::new(
        bus,
        modes.clone(),
        forecasts,
        Box::new(RandomEfficiency::new()),
        Box::new(recorder),
        alarm,
        status,
        config,
    );
    let mut control = tokio::spawn(control.run(shutdown_rx));

    let res = tokio::select! {
        res = supervise(&mut control, &modes) => match res {
            Ok(()) => Err(anyhow!("control loop stopped unexpectedly")),
            Err(e) => Err(e),
        },
        sig = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            sig.map_err(Into::into)
        }
    };
    let _ = shutdown_tx.send(true);
    if let Err(e) = monitor.await {
        warn!("alarm monitor ended abnormally: {}", e);
    }
    // On interrupt the control task is left detached; a door sequence in flight is not awaited.
    drop(control);
    res
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(ControllerConfig::default_path);
    let config = ControllerConfig::load(&path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let alerts = config.alerts.as_ref().map(AlertLayer::spawn).transpose()?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(alerts)
        .init();
    info!(config = %path.display(), test_mode = config.test_mode, "starting controller");

    if config.test_mode {
        warn!("test mode: running against the in-memory bench plant");
        return serve(Arc::new(MemoryBus::with_door_mechanics()), config).await;
    }

    let plc = Arc::new(PlcClient::new(
        &config.plc.ip,
        config.plc.port,
        config.plc.rack,
        config.plc.slot,
    ));
    if let Err(e) = plc.connect().await {
        warn!("{:#}; retrying on first access", e);
    }
    let res = serve(plc.clone(), config).await;
    plc.disconnect().await;
    res
}
