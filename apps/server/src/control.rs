//! One decision cycle per tick: forecasts, planning windows, the COP gate,
//! residual demand and actuation.

use crate::actuators::{decode, ActuatorBits, SystemState};
use crate::alarm::AlarmFlag;
use crate::config::ControllerConfig;
use crate::decision::{next_state, PlcSwitchTimes, Verdict};
use crate::forecast::{ForecastSource, Forecasts};
use crate::modes::{ModeController, PlantMode};
use crate::planner::{aggregate_demand, plan, EnergySeries, ModeFlag, PlannedSchedule, INFEASIBLE};
use crate::readings::PlantReadings;
use crate::records::{ControlCycleRecord, Recorder};
use crate::web::{ScheduledFrame, SharedStatus};
use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rce_protocol::RegisterBus;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Verdict the loop hands to the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    /// Switch the plant to the frame's mode.
    #[serde(rename = "yes")]
    Switch,
    /// Keep the current mode.
    #[serde(rename = "no")]
    Hold,
    #[serde(rename = "stop")]
    Stop,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Switch => "yes",
            Action::Hold => "no",
            Action::Stop => "stop",
        }
    }

    /// Only a switch turns the pump on for the step; energy is credited
    /// against the residual demand for that step alone.
    pub fn pump_running(self) -> bool {
        matches!(self, Action::Switch)
    }
}

/// Energy actually delivered while the pump ran for one step.
pub trait DeliveryEstimator: Send + Sync {
    fn delivered(&mut self, nominal_wh: f64) -> f64;
}

/// Nominal energy scaled by a uniform factor in [0.8, 1.2].
pub struct RandomEfficiency(StdRng);

impl RandomEfficiency {
    pub fn new() -> RandomEfficiency {
        RandomEfficiency(StdRng::from_entropy())
    }
}

impl Default for RandomEfficiency {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryEstimator for RandomEfficiency {
    fn delivered(&mut self, nominal_wh: f64) -> f64 {
        nominal_wh * self.0.gen_range(0.8..=1.2)
    }
}

/// Fixed efficiency factor.
pub struct FixedEfficiency(pub f64);

impl DeliveryEstimator for FixedEfficiency {
    fn delivered(&mut self, nominal_wh: f64) -> f64 {
        nominal_wh * self.0
    }
}

/// Scheduling state owned by the loop. Only [`ControlLoop::tick`] writes it.
#[derive(Debug, Clone)]
pub struct ControllerState {
    pub schedule: PlannedSchedule,
    pub dem_target: f64,
    pub total_predicted: f64,
    pub system_state: SystemState,
    /// Mode of the last frame the loop acted on, or the plant's mode at start.
    pub mode: &'static str,
    pub forecasts: Forecasts,
    pub last_refresh_date: Option<NaiveDate>,
    pub last_heat_plan_date: Option<NaiveDate>,
    pub last_cold_plan_date: Option<NaiveDate>,
}

impl Default for ControllerState {
    fn default() -> Self {
        ControllerState {
            schedule: PlannedSchedule::new(),
            dem_target: 0.0,
            total_predicted: 0.0,
            system_state: SystemState::Unknown,
            mode: SystemState::Unknown.simple_mode(),
            forecasts: Forecasts::default(),
            last_refresh_date: None,
            last_heat_plan_date: None,
            last_cold_plan_date: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub in_time_frame: bool,
}

impl Decision {
    const STOP: Decision = Decision {
        action: Action::Stop,
        in_time_frame: false,
    };
}

fn at(date: NaiveDate, hour: u32) -> NaiveDateTime {
    date.and_time(NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN))
}

/// Start of the 15-minute slot containing `t`.
fn quarter_floor(t: NaiveDateTime) -> NaiveDateTime {
    at(t.date(), t.hour()) + Duration::minutes((t.minute() / 15 * 15) as i64)
}

pub struct ControlLoop<B, F> {
    bus: Arc<B>,
    modes: Arc<ModeController<B>>,
    forecasts: F,
    estimator: Box<dyn DeliveryEstimator>,
    recorder: Box<dyn Recorder>,
    alarm: AlarmFlag,
    status: SharedStatus,
    config: ControllerConfig,
    state: ControllerState,
}

impl<B: RegisterBus, F: ForecastSource> ControlLoop<B, F> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<B>,
        modes: Arc<ModeController<B>>,
        forecasts: F,
        estimator: Box<dyn DeliveryEstimator>,
        recorder: Box<dyn Recorder>,
        alarm: AlarmFlag,
        status: SharedStatus,
        config: ControllerConfig,
    ) -> ControlLoop<B, F> {
        ControlLoop {
            bus,
            modes,
            forecasts,
            estimator,
            recorder,
            alarm,
            status,
            config,
            state: ControllerState::default(),
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    fn step(&self) -> Duration {
        Duration::minutes(self.config.pump.min_time_step_minutes as i64)
    }

    async fn read_plant(&mut self) -> Option<ActuatorBits> {
        match self.modes.read_bits().await {
            Ok(bits) => {
                let (state, symbols) = decode(&bits);
                debug!(?symbols, %state, "plant state");
                self.state.system_state = state;
                Some(bits)
            }
            Err(e) => {
                warn!("reading actuator bits failed: {:#}", e);
                self.state.system_state = SystemState::Unknown;
                None
            }
        }
    }

    /// Reloads readings and asks for new forecasts. Keeps the old ones on failure.
    async fn refresh(&mut self, now: NaiveDateTime) -> bool {
        let readings = PlantReadings::load(&self.config.paths.readings).unwrap_or_else(|e| {
            warn!("readings unavailable: {:#}", e);
            PlantReadings::default()
        });
        match self.forecasts.fetch(&readings).await {
            Ok(forecasts) => {
                self.state.forecasts = forecasts;
                self.state.last_refresh_date = Some(now.date());
                true
            }
            Err(e) => {
                error!("forecast refresh failed, keeping previous forecasts: {:#}", e);
                false
            }
        }
    }

    /// Heat demand from today 12:00 to tomorrow 12:00 against hot production.
    fn plan_heat(&self, now: NaiveDateTime) -> (PlannedSchedule, f64, f64) {
        let today = now.date();
        let start = at(today, 12);
        let end = start + Duration::days(1);
        let f = &self.state.forecasts;
        let target = aggregate_demand(&f.hot_demand, start, end);
        let (schedule, total) = plan(&f.hot_production, target, ModeFlag::Hot);
        (schedule, target, total)
    }

    /// Cold demand for the whole of tomorrow against cold production.
    fn plan_cold(&self, now: NaiveDateTime) -> (PlannedSchedule, f64, f64) {
        let start = at(now.date() + Duration::days(1), 0);
        let end = start + Duration::days(1);
        let f = &self.state.forecasts;
        let target = aggregate_demand(&f.cold_demand, start, end);
        let (schedule, total) = plan(&f.cold_production, target, ModeFlag::Cold);
        (schedule, target, total)
    }

    fn activate(&mut self, flag: ModeFlag, (schedule, target, total): (PlannedSchedule, f64, f64)) {
        if total == INFEASIBLE {
            warn!(mode = flag.as_str(), target, "production cannot cover demand");
        } else {
            info!(
                mode = flag.as_str(),
                target,
                total,
                frames = ?schedule.keys().collect::<Vec<_>>(),
                "new plan"
            );
        }
        self.state.schedule = schedule;
        self.state.dem_target = target;
        self.state.total_predicted = total;
    }

    fn in_window(&self, now: NaiveDateTime, hour: u32, last: Option<NaiveDate>) -> bool {
        now.hour() == hour && now.minute() < 15 && last != Some(now.date())
    }

    async fn update_plans(&mut self, now: NaiveDateTime) {
        if self.state.last_refresh_date != Some(now.date()) {
            info!("new day, refreshing forecasts");
            self.refresh(now).await;
        }

        if self.in_window(now, self.config.heat_planning_hour, self.state.last_heat_plan_date) {
            info!("planning heat demand");
            if self.refresh(now).await {
                let heat = self.plan_heat(now);
                self.activate(ModeFlag::Hot, heat);
                self.state.last_heat_plan_date = Some(now.date());
            }
        }

        if self.in_window(now, self.config.cold_planning_hour, self.state.last_cold_plan_date) {
            info!("planning cold demand");
            if self.refresh(now).await {
                let cold = self.plan_cold(now);
                self.activate(ModeFlag::Cold, cold);
                self.state.last_cold_plan_date = Some(now.date());
            }
        }
    }

    fn production(&self, flag: ModeFlag) -> &EnergySeries {
        match flag {
            ModeFlag::Hot => &self.state.forecasts.hot_production,
            ModeFlag::Cold => &self.state.forecasts.cold_production,
        }
    }

    /// Evaluates the active plan at `now` and burns down the residual target.
    pub fn evaluate(&mut self, now: NaiveDateTime) -> Decision {
        let state = &self.state;
        if state.total_predicted == INFEASIBLE && state.dem_target > 0.0 {
            warn!(target = state.dem_target, "plan infeasible, pump off");
            return Decision::STOP;
        }

        let step = self.step();
        let pump_wh = self.config.step_energy_wh();
        let frame = state
            .schedule
            .range(..=now)
            .next_back()
            .filter(|(start, _)| now < **start + step)
            .map(|(start, flag)| (*start, *flag));

        let mut decision = match frame {
            Some((start, flag)) => {
                let production = self.production(flag).get(start).unwrap_or_else(|| {
                    warn!(%start, mode = flag.as_str(), "no production forecast for active frame");
                    0.0
                });
                let cop = if pump_wh > 0.0 { production / pump_wh } else { 0.0 };
                let frame_mode = flag.as_str();
                let action = if self.alarm.is_active() {
                    warn!(%start, mode = frame_mode, "weather alarm active, pump off");
                    Action::Stop
                } else if cop >= self.config.cop_min && self.state.dem_target > 0.0 {
                    if self.state.mode != frame_mode {
                        Action::Switch
                    } else {
                        Action::Hold
                    }
                } else {
                    Action::Stop
                };
                info!(%start, mode = frame_mode, production, cop, ?action, "inside planned frame");
                // An alarm stop leaves the mode alone so the switch happens once it clears.
                if !self.alarm.is_active() {
                    self.state.mode = frame_mode;
                }
                Decision {
                    action,
                    in_time_frame: true,
                }
            }
            None => {
                info!("outside planned frames, pump off");
                Decision::STOP
            }
        };

        if self.state.dem_target > 0.0 {
            let delivered = if decision.action.pump_running() {
                self.estimator.delivered(pump_wh)
            } else {
                0.0
            };
            let before = self.state.dem_target;
            self.state.dem_target = (before - delivered).max(0.0);
            info!(before, after = self.state.dem_target, "residual demand");
            if self.state.dem_target <= 0.0 {
                info!("demand covered, clearing plan");
                self.state.schedule.clear();
                self.state.total_predicted = 0.0;
                self.state.dem_target = 0.0;
                decision.action = Action::Stop;
            }
        }
        decision
    }

    async fn decide(&mut self, now: NaiveDateTime) -> Decision {
        self.update_plans(now).await;
        self.evaluate(now)
    }

    async fn actuate(&self, next: SystemState, bits: Option<ActuatorBits>) -> Result<()> {
        let current = self.state.system_state;
        if next == current {
            debug!(%current, "plant already in requested state");
            return Ok(());
        }
        let Some(bits) = bits else {
            anyhow::bail!("actuator bits unknown, not writing {next}");
        };
        info!(from = %current, to = %next, "changing plant state");
        self.modes.apply(PlantMode::from(next), &bits).await
    }

    fn record(&mut self, now: NaiveDateTime, decision: Decision) {
        let f = &self.state.forecasts;
        let slot = quarter_floor(now);
        let hour = at(now.date(), now.hour());
        let record = ControlCycleRecord {
            timestamp: now,
            in_time_frame: decision.in_time_frame,
            current_dem_target: self.state.dem_target,
            action: decision.action,
            mode: self.state.mode,
            hot_prod: f.hot_production.get(slot).unwrap_or(0.0),
            cold_prod: f.cold_production.get(slot).unwrap_or(0.0),
            hot_dem: f.hot_demand.get(hour).unwrap_or(0.0),
            cold_dem: f.cold_demand.get(hour).unwrap_or(0.0),
        };
        if let Err(e) = self.recorder.record(&record) {
            error!("writing cycle record failed: {:#}", e);
        }
        if let Err(e) = self.recorder.heartbeat(now) {
            error!("writing heartbeat failed: {:#}", e);
        }
    }

    async fn publish(&self, now: NaiveDateTime, decision: Decision) {
        let mut status = self.status.write().await;
        status.updated = Some(now);
        status.system_state = Some(self.state.system_state);
        status.mode = self.state.mode.to_string();
        status.alarm_active = self.alarm.is_active();
        status.current_dem_target = self.state.dem_target;
        status.total_predicted = self.state.total_predicted;
        status.last_action = Some(decision.action);
        status.in_time_frame = decision.in_time_frame;
        status.schedule = self
            .state
            .schedule
            .iter()
            .map(|(start, flag)| ScheduledFrame {
                start: *start,
                mode: flag.as_str(),
            })
            .collect();
    }

    /// Runs one control cycle. Never fails; faults degrade to a stop.
    pub async fn tick(&mut self, now: NaiveDateTime) -> Decision {
        info!(%now, "control cycle");
        let bits = self.read_plant().await;
        let current = self.state.system_state;

        let decision = self.decide(now).await;
        let verdict = if self.alarm.is_active() {
            warn!("weather alarm active, overriding verdict");
            Verdict::Other
        } else {
            Verdict::parse(decision.action.as_str())
        };

        let table = PlcSwitchTimes(self.bus.as_ref());
        let next = match next_state(verdict, current, now, &table).await {
            Ok(next) => next,
            Err(e) => {
                error!("deciding next state failed, stopping: {:#}", e);
                SystemState::Parada
            }
        };
        if let Err(e) = self.actuate(next, bits).await {
            error!("actuation to {} failed: {:#}", next, e);
        }

        self.record(now, decision);
        self.publish(now, decision).await;
        decision
    }

    /// Initial forecasts and plans. The heat plan becomes active; the cold
    /// plan is only logged for reference.
    pub async fn bootstrap(&mut self, now: NaiveDateTime) {
        self.read_plant().await;
        self.state.mode = self.state.system_state.simple_mode();
        info!(state = %self.state.system_state, mode = self.state.mode, "controller starting");

        if !self.refresh(now).await {
            warn!("starting without forecasts");
            return;
        }
        let heat = self.plan_heat(now);
        self.activate(ModeFlag::Hot, heat);

        let (cold, target, total) = self.plan_cold(now);
        if total == INFEASIBLE {
            warn!(target, "reference cold plan infeasible");
        } else {
            info!(target, total, frames = ?cold.keys().collect::<Vec<_>>(), "reference cold plan");
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.bootstrap(chrono::Local::now().naive_local()).await;
        let mut ticker = interval(self.config.iteration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(chrono::Local::now().naive_local()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("control loop stopped");
    }
}

/// Waits for the spawned control loop. If it panicked or was cancelled the
/// plant is commanded to stop and the failure is returned.
pub async fn supervise<B: RegisterBus>(
    task: &mut JoinHandle<()>,
    modes: &ModeController<B>,
) -> Result<()> {
    match task.await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("control loop died: {}; stopping the plant", e);
            if let Err(stop) = modes.set_stop().await {
                error!("emergency stop failed: {:#}", stop);
            }
            Err(anyhow!("control loop died: {e}"))
        }
    }
}
