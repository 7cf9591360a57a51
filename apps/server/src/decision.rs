//! Next plant state from a verdict, with the weekday fallback table.

use crate::actuators::SystemState;
use anyhow::Result;
use chrono::{Datelike, NaiveDateTime, NaiveTime};
use rce_protocol::registers::{day_switch_addresses, DwordAddress};
use rce_protocol::RegisterBus;
use std::future::Future;
use tracing::debug;

const MS_PER_DAY: u32 = 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Yes,
    No,
    Stop,
    Other,
}

impl Verdict {
    pub fn parse(raw: &str) -> Verdict {
        match raw.trim().to_lowercase().as_str() {
            "yes" | "si" => Verdict::Yes,
            "no" => Verdict::No,
            "stop" | "parada" => Verdict::Stop,
            _ => Verdict::Other,
        }
    }
}

/// Switch times for one working day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaySwitchTimes {
    pub heat_from: NaiveTime,
    pub heat_until: NaiveTime,
    pub rest_until: NaiveTime,
}

impl DaySwitchTimes {
    fn state_at(&self, t: NaiveTime) -> SystemState {
        if self.heat_from < t && t < self.heat_until {
            SystemState::HeatMode1
        } else if self.heat_until < t && t < self.rest_until {
            SystemState::Parada
        } else {
            SystemState::ColdMode1
        }
    }
}

/// Source of the per-weekday switch times (0 = Monday .. 4 = Friday).
pub trait SwitchTimes {
    fn day(&self, weekday: u32) -> impl Future<Output = Result<Option<DaySwitchTimes>>> + Send;
}

/// Milliseconds since midnight, wrapped into one day.
pub fn time_from_ms(ms: u32) -> NaiveTime {
    let ms = ms % MS_PER_DAY;
    NaiveTime::from_num_seconds_from_midnight_opt(ms / 1000, (ms % 1000) * 1_000_000)
        .unwrap_or(NaiveTime::MIN)
}

/// Reads the switch times from the PLC, only when asked for a weekday.
pub struct PlcSwitchTimes<'a, B>(pub &'a B);

impl<B: RegisterBus> SwitchTimes for PlcSwitchTimes<'_, B> {
    async fn day(&self, weekday: u32) -> Result<Option<DaySwitchTimes>> {
        let Some(addrs) = day_switch_addresses(weekday) else {
            return Ok(None);
        };
        let read = |a: DwordAddress| async move { self.0.read_dword(a).await.map(time_from_ms) };
        Ok(Some(DaySwitchTimes {
            heat_from: read(addrs.heat_from).await?,
            heat_until: read(addrs.heat_until).await?,
            rest_until: read(addrs.rest_until).await?,
        }))
    }
}

/// Initial mode when the plant is stopped or undecodable.
pub async fn weekday_fallback<T: SwitchTimes>(
    now: NaiveDateTime,
    table: &T,
) -> Result<SystemState> {
    let weekday = now.weekday().num_days_from_monday();
    let state = match table.day(weekday).await? {
        Some(times) => times.state_at(now.time()),
        None => SystemState::Parada,
    };
    debug!(weekday, ?state, "weekday fallback");
    Ok(state)
}

/// The only fallible path is the switch-time read under `Yes` from
/// `Unknown`/`Parada`.
pub async fn next_state<T: SwitchTimes>(
    verdict: Verdict,
    current: SystemState,
    now: NaiveDateTime,
    table: &T,
) -> Result<SystemState> {
    use SystemState::*;
    Ok(match verdict {
        Verdict::Yes => match current {
            ColdMode1 | ColdMode2 => HeatMode1,
            HeatMode1 | HeatMode2 => ColdMode1,
            AutomaticMode => AutomaticMode,
            Unknown | Parada => weekday_fallback(now, table).await?,
        },
        Verdict::No => current,
        Verdict::Stop | Verdict::Other => Parada,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rce_protocol::MemoryBus;

    struct FixedTable(DaySwitchTimes);

    impl SwitchTimes for FixedTable {
        async fn day(&self, weekday: u32) -> Result<Option<DaySwitchTimes>> {
            Ok((weekday < 5).then_some(self.0))
        }
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn table() -> FixedTable {
        FixedTable(DaySwitchTimes {
            heat_from: hm(7, 0),
            heat_until: hm(15, 0),
            rest_until: hm(20, 0),
        })
    }

    // 2024-06-03 is a Monday.
    fn monday(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap().and_time(hm(h, m))
    }

    const ALL: [SystemState; 7] = [
        SystemState::ColdMode1,
        SystemState::ColdMode2,
        SystemState::HeatMode1,
        SystemState::HeatMode2,
        SystemState::AutomaticMode,
        SystemState::Parada,
        SystemState::Unknown,
    ];

    #[test]
    fn verdict_parsing() {
        assert_eq!(Verdict::parse(" Yes "), Verdict::Yes);
        assert_eq!(Verdict::parse("si"), Verdict::Yes);
        assert_eq!(Verdict::parse("NO"), Verdict::No);
        assert_eq!(Verdict::parse("Parada"), Verdict::Stop);
        assert_eq!(Verdict::parse("rain"), Verdict::Other);
        assert_eq!(Verdict::parse(""), Verdict::Other);
    }

    #[tokio::test]
    async fn yes_toggles_heat_and_cold() {
        let t = table();
        let now = monday(10, 0);
        let next = |s| next_state(Verdict::Yes, s, now, &t);
        assert_eq!(next(SystemState::ColdMode1).await.unwrap(), SystemState::HeatMode1);
        assert_eq!(next(SystemState::ColdMode2).await.unwrap(), SystemState::HeatMode1);
        assert_eq!(next(SystemState::HeatMode1).await.unwrap(), SystemState::ColdMode1);
        assert_eq!(next(SystemState::HeatMode2).await.unwrap(), SystemState::ColdMode1);
        assert_eq!(next(SystemState::AutomaticMode).await.unwrap(), SystemState::AutomaticMode);
    }

    #[tokio::test]
    async fn no_is_identity_and_others_stop() {
        let t = table();
        let now = monday(10, 0);
        for s in ALL {
            assert_eq!(next_state(Verdict::No, s, now, &t).await.unwrap(), s);
            assert_eq!(next_state(Verdict::Stop, s, now, &t).await.unwrap(), SystemState::Parada);
            assert_eq!(next_state(Verdict::Other, s, now, &t).await.unwrap(), SystemState::Parada);
        }
    }

    #[tokio::test]
    async fn fallback_follows_the_weekday_table() {
        let t = table();
        for (now, expected) in [
            (monday(10, 0), SystemState::HeatMode1),
            (monday(17, 0), SystemState::Parada),
            (monday(6, 0), SystemState::ColdMode1),
            (monday(22, 0), SystemState::ColdMode1),
            // Boundaries are exclusive.
            (monday(7, 0), SystemState::ColdMode1),
            (monday(15, 0), SystemState::ColdMode1),
        ] {
            let next = next_state(Verdict::Yes, SystemState::Unknown, now, &t).await.unwrap();
            assert_eq!(next, expected, "at {now}");
        }
        let saturday = monday(10, 0) + chrono::Duration::days(5);
        let next = next_state(Verdict::Yes, SystemState::Parada, saturday, &t).await.unwrap();
        assert_eq!(next, SystemState::Parada);
    }

    #[tokio::test]
    async fn reads_switch_times_from_plc() {
        let bus = MemoryBus::new();
        // Wednesday: weekday 2.
        let addrs = day_switch_addresses(2).unwrap();
        bus.set_dword(addrs.heat_from, 8 * 3_600_000);
        bus.set_dword(addrs.heat_until, 14 * 3_600_000 + 30 * 60_000);
        bus.set_dword(addrs.rest_until, MS_PER_DAY + 21 * 3_600_000);

        let plc = PlcSwitchTimes(&bus);
        let times = plc.day(2).await.unwrap().unwrap();
        assert_eq!(times.heat_from, hm(8, 0));
        assert_eq!(times.heat_until, hm(14, 30));
        assert_eq!(times.rest_until, hm(21, 0));
        assert!(plc.day(6).await.unwrap().is_none());

        let wednesday = monday(9, 0) + chrono::Duration::days(2);
        let next = next_state(Verdict::Yes, SystemState::Unknown, wednesday, &plc).await.unwrap();
        assert_eq!(next, SystemState::HeatMode1);
    }

    #[tokio::test]
    async fn unread_table_is_not_touched() {
        let bus = MemoryBus::new();
        bus.set_offline(true);
        let plc = PlcSwitchTimes(&bus);
        let next = next_state(Verdict::Yes, SystemState::ColdMode1, monday(9, 0), &plc).await;
        assert_eq!(next.unwrap(), SystemState::HeatMode1);
        assert!(next_state(Verdict::Yes, SystemState::Parada, monday(9, 0), &plc).await.is_err());
    }

    #[test]
    fn ms_wraps_into_a_day() {
        assert_eq!(time_from_ms(0), NaiveTime::MIN);
        assert_eq!(time_from_ms(MS_PER_DAY + 1000), NaiveTime::from_hms_opt(0, 0, 1).unwrap());
        assert_eq!(time_from_ms(45_296_789).to_string(), "12:34:56.789");
    }
}
