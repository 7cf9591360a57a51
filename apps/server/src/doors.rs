//! Timed open/close sequences for the horizontal (TH) and vertical (TV) doors.
//!
//! Both sequences verify the TH end-stops before and after moving it and abort
//! at the failing step. Only one sequence runs at a time; a second caller
//! waits for the first to finish. An open watches the alarm flag while it
//! settles and travels, and backs out to closed when the alarm is raised.

use crate::alarm::{read_alarms, AlarmFlag};
use rce_protocol::registers::{
    DoorBits, DOOR_HORIZONTAL, DOOR_VERTICAL, TH_CLOSED_END_STOP, TH_OPEN_END_STOP,
};
use rce_protocol::RegisterBus;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DoorPosition {
    Open,
    Closed,
    /// Neither end-stop made.
    Between,
    /// Both end-stops made at once, a sensor fault.
    Both,
}

impl DoorPosition {
    pub fn from_end_stops(open: bool, closed: bool) -> DoorPosition {
        match (open, closed) {
            (true, false) => DoorPosition::Open,
            (false, true) => DoorPosition::Closed,
            (false, false) => DoorPosition::Between,
            (true, true) => DoorPosition::Both,
        }
    }
}

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("open refused or aborted: weather alarm active")]
    AlarmActive,
    #[error("{step}: door not {expected:?} after {timeout:?}, last seen {last:?}")]
    EndStopTimeout {
        step: &'static str,
        expected: DoorPosition,
        last: DoorPosition,
        timeout: Duration,
    },
    #[error("{step}: register access failed")]
    Bus {
        step: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl SequenceError {
    fn bus(step: &'static str) -> impl FnOnce(anyhow::Error) -> SequenceError {
        move |e| SequenceError::Bus {
            step,
            source: e.into(),
        }
    }
}

/// Drive command as (manual, run, invert).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drive {
    Forward,
    Halt,
    Reverse,
}

impl Drive {
    pub fn bits(self) -> [bool; 3] {
        match self {
            Drive::Forward => [true, true, false],
            Drive::Halt => [true, false, false],
            Drive::Reverse => [true, false, true],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SequenceTiming {
    pub verify: Duration,
    pub settle: Duration,
    pub travel: Duration,
    pub pause: Duration,
    pub poll: Duration,
}

impl Default for SequenceTiming {
    fn default() -> Self {
        SequenceTiming {
            verify: Duration::from_secs(5),
            settle: Duration::from_secs(45),
            travel: Duration::from_secs(200),
            pause: Duration::from_secs(5),
            poll: Duration::from_millis(500),
        }
    }
}

pub struct DoorSequencer<B> {
    bus: Arc<B>,
    alarm: AlarmFlag,
    timing: SequenceTiming,
    /// Skips every wait; end-stop checks pass without reading.
    bench: bool,
    running: Mutex<()>,
}

impl<B: RegisterBus> DoorSequencer<B> {
    pub fn new(bus: Arc<B>, alarm: AlarmFlag, bench: bool) -> DoorSequencer<B> {
        DoorSequencer {
            bus,
            alarm,
            timing: SequenceTiming::default(),
            bench,
            running: Mutex::new(()),
        }
    }

    pub fn with_timing(mut self, timing: SequenceTiming) -> DoorSequencer<B> {
        self.timing = timing;
        self
    }

    pub async fn position(&self) -> anyhow::Result<DoorPosition> {
        let open = self.bus.read_bit(TH_OPEN_END_STOP).await?;
        let closed = self.bus.read_bit(TH_CLOSED_END_STOP).await?;
        Ok(DoorPosition::from_end_stops(open, closed))
    }

    async fn drive(
        &self,
        door: DoorBits,
        drive: Drive,
        step: &'static str,
    ) -> Result<(), SequenceError> {
        let [manual, run, invert] = drive.bits();
        self.bus
            .write_bits(&[(door.manual, manual), (door.run, run), (door.invert, invert)])
            .await
            .map_err(SequenceError::bus(step))?;
        info!(step, ?drive, "door drive");
        Ok(())
    }

    async fn delay(&self, duration: Duration) {
        if !self.bench {
            sleep(duration).await;
        }
    }

    /// Sleeps for `duration` unless the alarm is raised first. Returns whether it was.
    async fn delay_unless_alarm(&self, duration: Duration) -> bool {
        if self.bench {
            return self.alarm.is_active();
        }
        let deadline = Instant::now() + duration;
        loop {
            if self.alarm.is_active() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(self.timing.poll.min(deadline - now)).await;
        }
    }

    /// Polls the TH end-stops until `expected`. With `interlock`, a raised
    /// alarm ends the wait with [`SequenceError::AlarmActive`].
    async fn wait_for(
        &self,
        expected: DoorPosition,
        timeout: Duration,
        step: &'static str,
        interlock: bool,
    ) -> Result<(), SequenceError> {
        if self.bench {
            return Ok(());
        }
        let started = Instant::now();
        loop {
            if interlock && self.alarm.is_active() {
                return Err(SequenceError::AlarmActive);
            }
            let last = self.position().await.map_err(SequenceError::bus(step))?;
            if last == expected {
                debug!(step, waited = ?started.elapsed(), "end-stop reached");
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(SequenceError::EndStopTimeout {
                    step,
                    expected,
                    last,
                    timeout,
                });
            }
            sleep(self.timing.poll).await;
        }
    }

    /// Closes the doors. A TH travel timeout leaves TV where it is.
    pub async fn close(&self) -> Result<(), SequenceError> {
        let _guard = self.running.lock().await;
        info!("close sequence started");
        let t = self.timing;

        self.wait_for(DoorPosition::Open, t.verify, "verify open", false).await?;
        self.drive(DOOR_VERTICAL, Drive::Forward, "tv drive").await?;
        self.delay(t.settle).await;
        self.drive(DOOR_HORIZONTAL, Drive::Reverse, "th invert").await?;
        self.wait_for(DoorPosition::Closed, t.travel, "wait closed", false).await?;
        self.drive(DOOR_HORIZONTAL, Drive::Halt, "th stop").await?;
        self.delay(t.pause).await;
        self.drive(DOOR_VERTICAL, Drive::Reverse, "tv invert").await?;

        info!("close sequence finished");
        Ok(())
    }

    /// Opens the doors unless a weather alarm is active. A TH travel
    /// timeout leaves TH driving.
    pub async fn open(&self) -> Result<(), SequenceError> {
        let _guard = self.running.lock().await;
        if self.alarm.is_active() {
            return Err(SequenceError::AlarmActive);
        }
        let live = read_alarms(self.bus.as_ref())
            .await
            .map_err(SequenceError::bus("alarm check"))?;
        if live.active() {
            return Err(SequenceError::AlarmActive);
        }

        info!("open sequence started");
        let t = self.timing;

        self.wait_for(DoorPosition::Closed, t.verify, "verify closed", false).await?;
        self.drive(DOOR_VERTICAL, Drive::Forward, "tv drive").await?;
        if self.delay_unless_alarm(t.settle).await {
            return self.back_out(false).await;
        }
        self.drive(DOOR_HORIZONTAL, Drive::Forward, "th drive").await?;
        match self.wait_for(DoorPosition::Open, t.travel, "wait open", true).await {
            Err(SequenceError::AlarmActive) => return self.back_out(true).await,
            res => res?,
        }
        self.drive(DOOR_HORIZONTAL, Drive::Halt, "th stop").await?;
        self.delay(t.pause).await;
        self.drive(DOOR_VERTICAL, Drive::Reverse, "tv invert").await?;

        info!("open sequence finished");
        Ok(())
    }

    /// Returns an interrupted open to the closed arrangement: TH back to its
    /// closed end-stop if it left it, then TV reversed. Always ends in
    /// [`SequenceError::AlarmActive`] unless a step of its own fails.
    async fn back_out(&self, th_moved: bool) -> Result<(), SequenceError> {
        warn!(th_moved, "weather alarm during open, backing out");
        let t = self.timing;
        if th_moved {
            self.drive(DOOR_HORIZONTAL, Drive::Reverse, "back out th invert").await?;
            self.wait_for(DoorPosition::Closed, t.travel, "back out wait closed", false)
                .await?;
            self.drive(DOOR_HORIZONTAL, Drive::Halt, "back out th stop").await?;
            self.delay(t.pause).await;
        }
        self.drive(DOOR_VERTICAL, Drive::Reverse, "back out tv invert").await?;
        Err(SequenceError::AlarmActive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rce_protocol::registers::{BitAddress, RAIN_ALARM, WIND_ALARM};
    use rce_protocol::MemoryBus;

    fn drive_writes(door: DoorBits, drive: Drive) -> Vec<(BitAddress, bool)> {
        let [m, r, i] = drive.bits();
        vec![(door.manual, m), (door.run, r), (door.invert, i)]
    }

    fn sequencer(bus: &Arc<MemoryBus>) -> DoorSequencer<MemoryBus> {
        DoorSequencer::new(bus.clone(), AlarmFlag::default(), false)
    }

    #[test]
    fn positions_from_end_stops() {
        assert_eq!(DoorPosition::from_end_stops(true, false), DoorPosition::Open);
        assert_eq!(DoorPosition::from_end_stops(false, true), DoorPosition::Closed);
        assert_eq!(DoorPosition::from_end_stops(false, false), DoorPosition::Between);
        assert_eq!(DoorPosition::from_end_stops(true, true), DoorPosition::Both);
    }

    #[tokio::test(start_paused = true)]
    async fn close_runs_every_step_in_order() {
        let bus = Arc::new(MemoryBus::with_door_mechanics());
        bus.set_bit(TH_OPEN_END_STOP, true);
        let started = Instant::now();

        sequencer(&bus).close().await.unwrap();

        let mut expected = drive_writes(DOOR_VERTICAL, Drive::Forward);
        expected.extend(drive_writes(DOOR_HORIZONTAL, Drive::Reverse));
        expected.extend(drive_writes(DOOR_HORIZONTAL, Drive::Halt));
        expected.extend(drive_writes(DOOR_VERTICAL, Drive::Reverse));
        assert_eq!(bus.writes(), expected);
        assert!(bus.bit(TH_CLOSED_END_STOP));
        assert!(started.elapsed() >= Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn open_runs_every_step_in_order() {
        let bus = Arc::new(MemoryBus::with_door_mechanics());
        bus.set_bit(TH_CLOSED_END_STOP, true);

        sequencer(&bus).open().await.unwrap();

        let mut expected = drive_writes(DOOR_VERTICAL, Drive::Forward);
        expected.extend(drive_writes(DOOR_HORIZONTAL, Drive::Forward));
        expected.extend(drive_writes(DOOR_HORIZONTAL, Drive::Halt));
        expected.extend(drive_writes(DOOR_VERTICAL, Drive::Reverse));
        assert_eq!(bus.writes(), expected);
        assert!(bus.bit(TH_OPEN_END_STOP));
    }

    #[tokio::test(start_paused = true)]
    async fn close_aborts_when_not_open() {
        let bus = Arc::new(MemoryBus::new());
        bus.set_bit(TH_CLOSED_END_STOP, true);
        let started = Instant::now();

        let err = sequencer(&bus).close().await.unwrap_err();
        assert!(matches!(
            err,
            SequenceError::EndStopTimeout {
                step: "verify open",
                last: DoorPosition::Closed,
                ..
            }
        ));
        assert!(bus.writes().is_empty());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn travel_timeout_leaves_tv_alone() {
        // No mechanics: TH never reaches the closed end-stop.
        let bus = Arc::new(MemoryBus::new());
        bus.set_bit(TH_OPEN_END_STOP, true);
        let started = Instant::now();

        let err = sequencer(&bus).close().await.unwrap_err();
        match err {
            SequenceError::EndStopTimeout {
                step,
                expected,
                last,
                timeout,
            } => {
                assert_eq!(step, "wait closed");
                assert_eq!(expected, DoorPosition::Closed);
                assert_eq!(last, DoorPosition::Open);
                assert_eq!(timeout, Duration::from_secs(200));
            }
            other => panic!("unexpected {other:?}"),
        }
        let mut expected = drive_writes(DOOR_VERTICAL, Drive::Forward);
        expected.extend(drive_writes(DOOR_HORIZONTAL, Drive::Reverse));
        assert_eq!(bus.writes(), expected);
        assert!(started.elapsed() >= Duration::from_secs(245));
    }

    #[tokio::test(start_paused = true)]
    async fn open_travel_timeout_leaves_th_driving() {
        let bus = Arc::new(MemoryBus::new());
        bus.set_bit(TH_CLOSED_END_STOP, true);

        let err = sequencer(&bus).open().await.unwrap_err();
        assert!(matches!(err, SequenceError::EndStopTimeout { step: "wait open", .. }));
        let writes = bus.writes();
        assert_eq!(&writes[3..], drive_writes(DOOR_HORIZONTAL, Drive::Forward).as_slice());
        assert!(bus.bit(DOOR_HORIZONTAL.run));
    }

    #[tokio::test(start_paused = true)]
    async fn open_refused_on_alarm() {
        let bus = Arc::new(MemoryBus::with_door_mechanics());
        bus.set_bit(TH_CLOSED_END_STOP, true);

        let flag = AlarmFlag::default();
        flag.set(true);
        let seq = DoorSequencer::new(bus.clone(), flag.clone(), false);
        assert!(matches!(seq.open().await, Err(SequenceError::AlarmActive)));

        // Cached flag clear but the live read still shows wind.
        flag.set(false);
        bus.set_bit(WIND_ALARM, true);
        assert!(matches!(seq.open().await, Err(SequenceError::AlarmActive)));

        bus.set_bit(WIND_ALARM, false);
        bus.set_bit(RAIN_ALARM, false);
        seq.open().await.unwrap();
        assert!(bus.bit(TH_OPEN_END_STOP));
    }

    #[tokio::test(start_paused = true)]
    async fn alarm_during_settle_backs_out() {
        let bus = Arc::new(MemoryBus::with_door_mechanics());
        bus.set_bit(TH_CLOSED_END_STOP, true);
        let flag = AlarmFlag::default();
        let seq = Arc::new(DoorSequencer::new(bus.clone(), flag.clone(), false));
        let started = Instant::now();

        let open = tokio::spawn({
            let seq = seq.clone();
            async move { seq.open().await }
        });
        sleep(Duration::from_secs(10)).await;
        flag.set(true);

        let res = open.await.unwrap();
        assert!(matches!(res, Err(SequenceError::AlarmActive)));
        assert!(started.elapsed() < Duration::from_secs(12));
        assert!(!bus.bit(TH_OPEN_END_STOP));
        assert!(bus.bit(TH_CLOSED_END_STOP));

        let mut expected = drive_writes(DOOR_VERTICAL, Drive::Forward);
        expected.extend(drive_writes(DOOR_VERTICAL, Drive::Reverse));
        assert_eq!(bus.writes(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn alarm_during_travel_returns_th_to_closed() {
        // No mechanics: TH stays on the closed end-stop while driving.
        let bus = Arc::new(MemoryBus::new());
        bus.set_bit(TH_CLOSED_END_STOP, true);
        let flag = AlarmFlag::default();
        let seq = Arc::new(DoorSequencer::new(bus.clone(), flag.clone(), false));

        let open = tokio::spawn({
            let seq = seq.clone();
            async move { seq.open().await }
        });
        sleep(Duration::from_secs(60)).await;
        flag.set(true);

        let res = open.await.unwrap();
        assert!(matches!(res, Err(SequenceError::AlarmActive)));
        let mut expected = drive_writes(DOOR_VERTICAL, Drive::Forward);
        expected.extend(drive_writes(DOOR_HORIZONTAL, Drive::Forward));
        expected.extend(drive_writes(DOOR_HORIZONTAL, Drive::Reverse));
        expected.extend(drive_writes(DOOR_HORIZONTAL, Drive::Halt));
        expected.extend(drive_writes(DOOR_VERTICAL, Drive::Reverse));
        assert_eq!(bus.writes(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_close_runs_after_aborted_open() {
        let bus = Arc::new(MemoryBus::with_door_mechanics());
        bus.set_bit(TH_CLOSED_END_STOP, true);
        let flag = AlarmFlag::default();
        let seq = Arc::new(DoorSequencer::new(bus.clone(), flag.clone(), false));
        let started = Instant::now();

        let open = tokio::spawn({
            let seq = seq.clone();
            async move { seq.open().await }
        });
        sleep(Duration::from_secs(10)).await;
        flag.set(true);
        let close = tokio::spawn({
            let seq = seq.clone();
            async move { seq.close().await }
        });

        assert!(open.await.unwrap().is_err());
        // The doors are already closed, so the close stops at its first check.
        assert!(matches!(
            close.await.unwrap(),
            Err(SequenceError::EndStopTimeout { step: "verify open", .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(20));
        assert!(!bus.bit(TH_OPEN_END_STOP));
    }

    #[tokio::test(start_paused = true)]
    async fn bus_failure_names_the_step() {
        let bus = Arc::new(MemoryBus::new());
        bus.set_offline(true);
        let err = DoorSequencer::new(bus.clone(), AlarmFlag::default(), true)
            .close()
            .await
            .unwrap_err();
        assert!(matches!(err, SequenceError::Bus { step: "tv drive", .. }));
    }

    #[tokio::test]
    async fn bench_mode_skips_waits() {
        let bus = Arc::new(MemoryBus::new());
        let seq = DoorSequencer::new(bus.clone(), AlarmFlag::default(), true);
        let started = std::time::Instant::now();
        seq.close().await.unwrap();
        seq.open().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(bus.writes().len(), 24);
    }

    #[tokio::test(start_paused = true)]
    async fn sequences_do_not_interleave() {
        let bus = Arc::new(MemoryBus::with_door_mechanics());
        bus.set_bit(TH_OPEN_END_STOP, true);
        let seq = Arc::new(sequencer(&bus));

        let first = tokio::spawn({
            let seq = seq.clone();
            async move { seq.close().await }
        });
        let second = tokio::spawn({
            let seq = seq.clone();
            async move { seq.close().await }
        });
        let (a, b) = (first.await.unwrap(), second.await.unwrap());

        // One close succeeds; the other runs after it and finds the door already closed.
        assert!(a.is_ok() != b.is_ok());
        let writes = bus.writes();
        assert_eq!(writes.len(), 12);
        assert_eq!(&writes[..3], drive_writes(DOOR_VERTICAL, Drive::Forward).as_slice());
        assert_eq!(&writes[9..], drive_writes(DOOR_VERTICAL, Drive::Reverse).as_slice());
    }
}
