//! Controller configuration, read from `config.<SC_ENV>.json`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_VAR: &str = "SC_ENV";
const DEFAULT_ENV: &str = "test";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlcConfig {
    pub ip: String,
    #[serde(default)]
    pub rack: u8,
    #[serde(default = "default_slot")]
    pub slot: u8,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpConfig {
    pub power_watts: f64,
    #[serde(default = "default_step")]
    pub min_time_step_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_csv")]
    pub output_csv: PathBuf,
    #[serde(default = "default_heartbeat")]
    pub heartbeat: PathBuf,
    #[serde(default = "default_readings")]
    pub readings: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff")]
    pub backoff_secs: u64,
}

/// Forwarding of warnings and errors to an operator webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    pub webhook_url: String,
    #[serde(default = "default_alert_level")]
    pub min_level: String,
    /// At most one alert per interval; later events are dropped.
    #[serde(default = "default_alert_interval")]
    pub min_interval_secs: u64,
    #[serde(default = "default_alert_subject")]
    pub subject: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub predict_url: String,
    pub plc: PlcConfig,
    pub pump: PumpConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_step")]
    pub iteration_time_in_minutes: u32,
    #[serde(default = "default_cop_min")]
    pub cop_min: f64,
    #[serde(default = "default_heat_hour")]
    pub heat_planning_hour: u32,
    #[serde(default = "default_cold_hour")]
    pub cold_planning_hour: u32,
    #[serde(default)]
    pub forecast: ForecastConfig,
    /// Alarm poll period; 30 s when unset in test mode, 1 s otherwise.
    #[serde(default)]
    pub alarm_poll_secs: Option<u64>,
    /// Address for the read-only status endpoint, e.g. `0.0.0.0:8080`.
    #[serde(default)]
    pub status_bind: Option<String>,
    #[serde(default)]
    pub alerts: Option<AlertConfig>,
}

fn default_slot() -> u8 {
    1
}

fn default_port() -> u16 {
    rce_protocol::s7::DEFAULT_PORT
}

fn default_step() -> u32 {
    15
}

fn default_csv() -> PathBuf {
    PathBuf::from("dades.csv")
}

fn default_heartbeat() -> PathBuf {
    PathBuf::from("heartbeat_sc.txt")
}

fn default_readings() -> PathBuf {
    PathBuf::from("readings.json")
}

fn default_timeout() -> u64 {
    30
}

fn default_retries() -> u32 {
    3
}

fn default_backoff() -> u64 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cop_min() -> f64 {
    1.0
}

fn default_heat_hour() -> u32 {
    7
}

fn default_cold_hour() -> u32 {
    19
}

fn default_alert_level() -> String {
    "warn".to_string()
}

fn default_alert_interval() -> u64 {
    300
}

fn default_alert_subject() -> String {
    "ALERTA sistema RCE".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            output_csv: default_csv(),
            heartbeat: default_heartbeat(),
            readings: default_readings(),
        }
    }
}

impl Default for ForecastConfig {
    fn default() -> Self {
        ForecastConfig {
            timeout_secs: default_timeout(),
            retries: default_retries(),
            backoff_secs: default_backoff(),
        }
    }
}

impl ControllerConfig {
    pub fn from_json(text: &str) -> Result<ControllerConfig> {
        let config: ControllerConfig =
            serde_json::from_str(text).context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<ControllerConfig> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("configuration file {} not found", path.display()))?;
        Self::from_json(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// `config.<SC_ENV>.json` in the working directory.
    pub fn default_path() -> PathBuf {
        let env = std::env::var(ENV_VAR).unwrap_or_else(|_| DEFAULT_ENV.to_string());
        PathBuf::from(format!("config.{env}.json"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.predict_url.trim().is_empty() {
            bail!("predict_url must be set");
        }
        if self.plc.ip.trim().is_empty() {
            bail!("plc.ip must be set");
        }
        if !(self.pump.power_watts > 0.0) {
            bail!("pump.power_watts must be positive, got {}", self.pump.power_watts);
        }
        if self.pump.min_time_step_minutes == 0 {
            bail!("pump.min_time_step_minutes must be positive");
        }
        if self.iteration_time_in_minutes == 0 {
            bail!("iteration_time_in_minutes must be positive");
        }
        for (name, hour) in [
            ("heat_planning_hour", self.heat_planning_hour),
            ("cold_planning_hour", self.cold_planning_hour),
        ] {
            if hour >= 24 {
                bail!("{name} must be within 0..24, got {hour}");
            }
        }
        if let Some(alerts) = &self.alerts {
            if alerts.webhook_url.trim().is_empty() {
                bail!("alerts.webhook_url must be set");
            }
            if alerts.min_level.parse::<tracing::Level>().is_err() {
                bail!("alerts.min_level {:?} is not a log level", alerts.min_level);
            }
        }
        Ok(())
    }

    pub fn iteration(&self) -> Duration {
        Duration::from_secs(self.iteration_time_in_minutes as u64 * 60)
    }

    pub fn alarm_poll(&self) -> Duration {
        let secs = self
            .alarm_poll_secs
            .unwrap_or(if self.test_mode { 30 } else { 1 });
        Duration::from_secs(secs.max(1))
    }

    /// Energy one pump step consumes, in Wh.
    pub fn step_energy_wh(&self) -> f64 {
        self.pump.power_watts * self.pump.min_time_step_minutes as f64 / 60.0
    }
}
