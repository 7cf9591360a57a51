//! Demand aggregation and greedy production planning.

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Accumulated production reported for a plan that cannot cover its target.
pub const INFEASIBLE: f64 = -1.0;

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
}

/// Energy values keyed by timestamp, in chronological order.
///
/// Deserialises from a JSON object whose values may be numbers or numeric
/// strings; entries that do not parse are skipped.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(from = "BTreeMap<String, Value>")]
pub struct EnergySeries(pub BTreeMap<NaiveDateTime, f64>);

impl From<BTreeMap<String, Value>> for EnergySeries {
    fn from(raw: BTreeMap<String, Value>) -> EnergySeries {
        let mut series = BTreeMap::new();
        for (key, value) in raw {
            let Some(at) = parse_timestamp(&key) else {
                warn!(key = %key, "skipping series entry with bad timestamp");
                continue;
            };
            let energy = match &value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            match energy {
                Some(e) if e.is_finite() => {
                    series.insert(at, e);
                }
                _ => warn!(key = %key, %value, "skipping series entry with bad value"),
            }
        }
        EnergySeries(series)
    }
}

impl FromIterator<(NaiveDateTime, f64)> for EnergySeries {
    fn from_iter<I: IntoIterator<Item = (NaiveDateTime, f64)>>(iter: I) -> Self {
        EnergySeries(iter.into_iter().collect())
    }
}

impl EnergySeries {
    pub fn get(&self, at: NaiveDateTime) -> Option<f64> {
        self.0.get(&at).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModeFlag {
    Cold = 0,
    Hot = 1,
}

impl ModeFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            ModeFlag::Hot => "hot",
            ModeFlag::Cold => "cold",
        }
    }
}

/// Frame start -> mode. Replaced wholesale by every planning run.
pub type PlannedSchedule = BTreeMap<NaiveDateTime, ModeFlag>;

/// Sum of the entries at every whole minute in `[start, end)`.
/// Minutes without an entry add nothing.
pub fn aggregate_demand(series: &EnergySeries, start: NaiveDateTime, end: NaiveDateTime) -> f64 {
    let mut total = 0.0;
    let mut t = start;
    while t < end {
        total += series.get(t).unwrap_or(0.0);
        t += Duration::minutes(1);
    }
    total
}

/// Picks the smallest slots first until their sum covers `target`.
///
/// Returns an empty schedule and [`INFEASIBLE`] when the whole series
/// does not reach the target. Equal values keep chronological order.
pub fn plan(available: &EnergySeries, target: f64, flag: ModeFlag) -> (PlannedSchedule, f64) {
    let mut slots: Vec<(NaiveDateTime, f64)> = available.0.iter().map(|(t, e)| (*t, *e)).collect();
    slots.sort_by(|a, b| a.1.total_cmp(&b.1));

    let mut accumulated = 0.0;
    let mut schedule = PlannedSchedule::new();
    for (at, energy) in slots {
        accumulated += energy;
        schedule.insert(at, flag);
        if accumulated >= target {
            break;
        }
    }

    if accumulated < target {
        return (PlannedSchedule::new(), INFEASIBLE);
    }
    (schedule, accumulated)
}
