//! Per-cycle CSV rows and the watchdog heartbeat.

use crate::control::Action;
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::fs::{rename, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const CSV_HEADER: &str =
    "timestamp,in_time_frame,current_dem_target,action,mode,hot_prod,cold_prod,hot_dem,cold_dem";

pub const HEARTBEAT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlCycleRecord {
    pub timestamp: NaiveDateTime,
    pub in_time_frame: bool,
    pub current_dem_target: f64,
    pub action: Action,
    pub mode: &'static str,
    pub hot_prod: f64,
    pub cold_prod: f64,
    pub hot_dem: f64,
    pub cold_dem: f64,
}

impl ControlCycleRecord {
    pub fn csv_row(&self) -> String {
        format!(
            "{},{},{:.2},{},{},{},{},{},{}",
            self.timestamp.format(HEARTBEAT_FORMAT),
            self.in_time_frame,
            self.current_dem_target,
            self.action.as_str(),
            self.mode,
            self.hot_prod,
            self.cold_prod,
            self.hot_dem,
            self.cold_dem
        )
    }
}

pub trait Recorder: Send + Sync {
    fn record(&mut self, record: &ControlCycleRecord) -> Result<()>;

    fn heartbeat(&mut self, at: NaiveDateTime) -> Result<()>;
}

pub struct FileRecorder {
    csv: PathBuf,
    heartbeat: PathBuf,
}

impl FileRecorder {
    pub fn new(csv: impl Into<PathBuf>, heartbeat: impl Into<PathBuf>) -> FileRecorder {
        FileRecorder {
            csv: csv.into(),
            heartbeat: heartbeat.into(),
        }
    }
}

fn is_new_or_empty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true)
}

impl Recorder for FileRecorder {
    fn record(&mut self, record: &ControlCycleRecord) -> Result<()> {
        let write_header = is_new_or_empty(&self.csv);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.csv)
            .with_context(|| format!("opening {}", self.csv.display()))?;
        if write_header {
            writeln!(file, "{}", CSV_HEADER)?;
        }
        writeln!(file, "{}", record.csv_row())?;
        Ok(())
    }

    /// Written to a temporary file first so readers never see a partial line.
    fn heartbeat(&mut self, at: NaiveDateTime) -> Result<()> {
        let tmp = self.heartbeat.with_extension("tmp");
        let mut file =
            File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        writeln!(file, "{}", at.format(HEARTBEAT_FORMAT))?;
        drop(file);
        rename(&tmp, &self.heartbeat)
            .with_context(|| format!("renaming {} to {}", tmp.display(), self.heartbeat.display()))
    }
}
