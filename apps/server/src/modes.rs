use crate::actuators::{ActuatorBits, SystemState};
use crate::doors::DoorSequencer;
use anyhow::{Context, Result};
use rce_protocol::registers::{BitAddress, ACTUATOR_BITS};
use rce_protocol::RegisterBus;
use std::sync::Arc;
use tracing::{info, warn};

// Pump/valve patterns, indices into ACTUATOR_BITS.
const HEAT_PATTERN: &[(usize, bool)] = &[
    // B1 automatic
    (0, false),
    (1, false),
    // B2 manual stop
    (2, true),
    (3, false),
    // EV1 manual stop
    (4, true),
    (5, false),
    (6, true),
    // EV2 manual run
    (7, true),
    (8, true),
    (9, false),
];

const COLD_PATTERN: &[(usize, bool)] = &[
    // B1 automatic
    (0, false),
    (1, false),
    // B2 manual run
    (2, true),
    (3, true),
    // EV1 manual run
    (4, true),
    (5, true),
    (6, false),
    // EV2 manual stop
    (7, true),
    (8, false),
    (9, true),
];

const STOP_PATTERN: &[(usize, bool)] = &[
    // B1 manual stop
    (0, true),
    (1, false),
    // B2 manual stop
    (2, true),
    (3, false),
    // EV1 manual stop
    (4, true),
    (5, false),
    (6, true),
    // EV2 manual run
    (7, true),
    (8, true),
    (9, false),
    // TH manual stop
    (10, true),
    (11, false),
    // TV manual stop
    (12, true),
    (13, false),
];

/// Closed set of named operating modes the controller can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlantMode {
    Heat,
    Cold,
    Stop,
    Automatic,
    /// No canonical mode; the raw bits are written back as they are.
    Unknown,
}

impl From<SystemState> for PlantMode {
    fn from(state: SystemState) -> PlantMode {
        match state {
            SystemState::HeatMode1 => PlantMode::Heat,
            SystemState::ColdMode1 => PlantMode::Cold,
            SystemState::Parada => PlantMode::Stop,
            SystemState::AutomaticMode => PlantMode::Automatic,
            SystemState::HeatMode2 | SystemState::ColdMode2 | SystemState::Unknown => {
                PlantMode::Unknown
            }
        }
    }
}

fn pattern_writes(pattern: &[(usize, bool)]) -> Vec<(BitAddress, bool)> {
    pattern
        .iter()
        .map(|&(i, value)| (ACTUATOR_BITS[i], value))
        .collect()
}

pub struct ModeController<B> {
    bus: Arc<B>,
    doors: Arc<DoorSequencer<B>>,
}

impl<B: RegisterBus> ModeController<B> {
    pub fn new(bus: Arc<B>, doors: Arc<DoorSequencer<B>>) -> ModeController<B> {
        ModeController { bus, doors }
    }

    pub async fn set_heat(&self) -> Result<()> {
        info!("switching to heat");
        self.bus.write_bits(&pattern_writes(HEAT_PATTERN)).await?;
        self.doors.close().await.context("heat: close sequence")
    }

    pub async fn set_cold(&self) -> Result<()> {
        info!("switching to cold");
        self.bus.write_bits(&pattern_writes(COLD_PATTERN)).await?;
        self.doors.open().await.context("cold: open sequence")
    }

    pub async fn set_stop(&self) -> Result<()> {
        info!("stopping plant");
        self.bus.write_bits(&pattern_writes(STOP_PATTERN)).await?;
        self.doors.close().await.context("stop: close sequence")
    }

    /// Hands every actuator back to the PLC program. No door sequence.
    pub async fn set_automatic(&self) -> Result<()> {
        info!("switching to automatic");
        let writes: Vec<_> = ACTUATOR_BITS.iter().map(|&a| (a, false)).collect();
        self.bus.write_bits(&writes).await
    }

    /// Writes all 14 bits verbatim, with no door sequencing.
    pub async fn write_raw(&self, bits: &ActuatorBits) -> Result<()> {
        warn!(?bits, "writing raw actuator combination");
        let writes: Vec<_> = ACTUATOR_BITS.iter().copied().zip(bits.iter().copied()).collect();
        self.bus.write_bits(&writes).await
    }

    /// Drives the plant into `mode`; `current` is written back for
    /// [`PlantMode::Unknown`].
    pub async fn apply(&self, mode: PlantMode, current: &ActuatorBits) -> Result<()> {
        match mode {
            PlantMode::Heat => self.set_heat().await,
            PlantMode::Cold => self.set_cold().await,
            PlantMode::Stop => self.set_stop().await,
            PlantMode::Automatic => self.set_automatic().await,
            PlantMode::Unknown => self.write_raw(current).await,
        }
    }

    pub async fn read_bits(&self) -> Result<ActuatorBits> {
        let raw = self.bus.read_bits(&ACTUATOR_BITS).await?;
        crate::actuators::bits_from_slice(&raw).context("short actuator read")
    }
}
