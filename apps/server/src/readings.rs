use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// One sample of the 12 model inputs sent to the forecast service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlantSample {
    pub cold: f64,
    pub hot: f64,
    pub wind_vel_m_s: f64,
    pub solar_rad_w_m2: f64,
    pub ir_rad_w_m2: f64,
    pub reset_cold: f64,
    pub reset_hot: f64,
    pub mode: f64,
    pub day_sin: f64,
    pub day_cos: f64,
    pub year_sin: f64,
    pub year_cos: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlantReadings {
    pub data: Vec<PlantSample>,
}

impl PlantReadings {
    /// Loads the latest snapshot. A missing file yields an empty snapshot.
    pub fn load(path: &Path) -> Result<PlantReadings> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "readings file missing, sending empty snapshot");
                return Ok(PlantReadings::default());
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}
