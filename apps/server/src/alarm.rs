//! Weather alarm polling and the open interlock flag.

use crate::doors::DoorSequencer;
use anyhow::Result;
use rce_protocol::registers::{RAIN_ALARM, WIND_ALARM};
use rce_protocol::RegisterBus;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Shared "alarm active" flag. Set and cleared only by the monitor;
/// read by the open sequence before every attempt.
#[derive(Debug, Clone, Default)]
pub struct AlarmFlag(Arc<AtomicBool>);

impl AlarmFlag {
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, active: bool) {
        self.0.store(active, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlarmSet {
    pub rain: bool,
    pub wind: bool,
}

impl AlarmSet {
    pub fn active(&self) -> bool {
        self.rain || self.wind
    }
}

pub async fn read_alarms<B: RegisterBus>(bus: &B) -> Result<AlarmSet> {
    Ok(AlarmSet {
        rain: bus.read_bit(RAIN_ALARM).await?,
        wind: bus.read_bit(WIND_ALARM).await?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmTransition {
    Raised,
    Cleared,
}

/// Edge detector over successive polls.
#[derive(Debug, Default)]
pub struct AlarmEdge {
    active: bool,
}

impl AlarmEdge {
    pub fn observe(&mut self, active: bool) -> Option<AlarmTransition> {
        let transition = match (self.active, active) {
            (false, true) => Some(AlarmTransition::Raised),
            (true, false) => Some(AlarmTransition::Cleared),
            _ => None,
        };
        self.active = active;
        transition
    }
}

pub struct AlarmMonitor<B> {
    bus: Arc<B>,
    doors: Arc<DoorSequencer<B>>,
    flag: AlarmFlag,
    poll: Duration,
    launches: Arc<AtomicUsize>,
}

impl<B: RegisterBus> AlarmMonitor<B> {
    pub fn new(
        bus: Arc<B>,
        doors: Arc<DoorSequencer<B>>,
        flag: AlarmFlag,
        poll: Duration,
    ) -> AlarmMonitor<B> {
        AlarmMonitor {
            bus,
            doors,
            flag,
            poll,
            launches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of close sequences launched so far.
    pub fn launches(&self) -> Arc<AtomicUsize> {
        self.launches.clone()
    }

    /// Polls until `shutdown` turns true or its sender is dropped.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(poll = ?self.poll, "alarm monitor started");
        let mut edge = AlarmEdge::default();
        loop {
            match read_alarms(self.bus.as_ref()).await {
                Ok(alarms) => self.on_poll(&mut edge, alarms),
                Err(e) => warn!("alarm poll failed: {:#}", e),
            }
            tokio::select! {
                _ = sleep(self.poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("alarm monitor stopped");
    }

    fn on_poll(&self, edge: &mut AlarmEdge, alarms: AlarmSet) {
        debug!(rain = alarms.rain, wind = alarms.wind, "alarm poll");
        match edge.observe(alarms.active()) {
            Some(AlarmTransition::Raised) => {
                warn!(
                    rain = alarms.rain,
                    wind = alarms.wind,
                    "weather alarm raised, closing doors"
                );
                self.flag.set(true);
                self.launches.fetch_add(1, Ordering::SeqCst);
                let doors = self.doors.clone();
                tokio::spawn(async move {
                    if let Err(e) = doors.close().await {
                        error!(error = %e, "alarm close sequence failed");
                    }
                });
            }
            Some(AlarmTransition::Cleared) => {
                info!("weather alarm cleared");
                self.flag.set(false);
            }
            None => {}
        }
    }
}
