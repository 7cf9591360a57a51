use anyhow::{bail, Context, Result};
use rce_protocol::PlcClient;
use rce_server::actuators::{decode, ActuatorBits, ACTUATOR_BIT_COUNT};
use rce_server::alarm::{read_alarms, AlarmFlag};
use rce_server::config::ControllerConfig;
use rce_server::doors::DoorSequencer;
use rce_server::modes::{ModeController, PlantMode};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const USAGE: &str =
    "Usage: rce-mode [-c config.json] (status|heat|cold|stop|automatic|raw <14 bits of 0/1>)";

#[derive(Debug, PartialEq)]
enum Command {
    Status,
    Mode(PlantMode),
    Raw(ActuatorBits),
}

fn parse_bits(raw: &str) -> Result<ActuatorBits> {
    if raw.len() != ACTUATOR_BIT_COUNT {
        bail!("expected {} bits, got {:?}", ACTUATOR_BIT_COUNT, raw);
    }
    let mut bits = [false; ACTUATOR_BIT_COUNT];
    for (bit, c) in bits.iter_mut().zip(raw.chars()) {
        *bit = match c {
            '0' => false,
            '1' => true,
            _ => bail!("bad bit {:?} in {:?}", c, raw),
        };
    }
    Ok(bits)
}

fn parse_args(args: &[String]) -> Result<(Option<PathBuf>, Command)> {
    let mut config = None;
    let mut command = None;
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        let next = match arg.as_str() {
            "-c" | "--config" => {
                config = Some(PathBuf::from(it.next().context(USAGE)?));
                continue;
            }
            "status" => Command::Status,
            "heat" => Command::Mode(PlantMode::Heat),
            "cold" => Command::Mode(PlantMode::Cold),
            "stop" => Command::Mode(PlantMode::Stop),
            "automatic" => Command::Mode(PlantMode::Automatic),
            "raw" => Command::Raw(parse_bits(it.next().context(USAGE)?)?),
            other => bail!("Unknown arg: {}\n{}", other, USAGE),
        };
        if command.replace(next).is_some() {
            bail!("only one command at a time\n{}", USAGE);
        }
    }
    match command {
        Some(command) => Ok((config, command)),
        None => bail!(USAGE),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (path, command) = parse_args(&args)?;
    let config = ControllerConfig::load(&path.unwrap_or_else(ControllerConfig::default_path))?;

    let plc = Arc::new(PlcClient::new(
        &config.plc.ip,
        config.plc.port,
        config.plc.rack,
        config.plc.slot,
    ));
    plc.connect().await?;

    let alarm = AlarmFlag::default();
    alarm.set(read_alarms(plc.as_ref()).await?.active());
    let doors = Arc::new(DoorSequencer::new(plc.clone(), alarm, false));
    let modes = ModeController::new(plc.clone(), doors.clone());

    let res = match command {
        Command::Status => Ok(()),
        Command::Mode(mode) => modes.apply(mode, &modes.read_bits().await?).await,
        Command::Raw(bits) => modes.write_raw(&bits).await,
    };

    let bits = modes.read_bits().await?;
    let (state, symbols) = decode(&bits);
    println!("state: {} ({})", state, state.simple_mode());
    println!("actuators (B1 B2 EV1 EV2 TH TV): {:?}", symbols);
    println!("doors: {:?}", doors.position().await?);
    plc.disconnect().await;
    res
}
