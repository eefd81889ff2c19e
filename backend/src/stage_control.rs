//! Stage sequencing.
//!
//! [`StageMachine`] owns the sequencing state and is driven one tick at a time from a
//! [`Snapshot`] of the registry and flag. It returns the [`Effect`]s of that tick instead
//! of performing them, so the transition logic can be exercised without any shared state.
//! [`StageControl`] is the shell that reads the snapshot, runs the machine and applies the
//! effects to the real stores.

use crate::clock::{Clock, elapsed_secs};
use crate::config::{ConfigError, StagesConfig};
use crate::flag::Flag;
use crate::registry::Registry;
use crate::store::LookupError;
use engine_control_shared::{
    ActuationRequest, ActuationType, LogEntry, LogPriority, SensorLocation, SensorType, Stage,
    ValveLocation, ValvePriority, ValveType,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Duration, MissedTickBehavior, interval};

/// Time after entering autosequence before the main propellant valve may open.
pub const AUTOSEQUENCE_DELAY_SECS: f64 = 5.0;

const COMPLETE: f64 = 100.0;
/// PT-2 at 490 psi reads as a fully pressurized tank.
const PSI_PER_PERCENT: f64 = 4.9;
/// Postburn venting is done once PT-2 is back down to this.
const DEPRESSURIZED_PSI: f64 = 20.0;
const POSTBURN_PSI_PER_PERCENT: f64 = 5.0;

const SEQUENCER_PRIORITY: ValvePriority = ValvePriority::Pi;
const SEQUENCER_VALVES: ValveType = ValveType::Solenoid;

const WAITING_CLOSED: [ValveLocation; 3] = [
    ValveLocation::Pressurization,
    ValveLocation::PressureRelief,
    ValveLocation::MainPropellantValve,
];

const POSTBURN_STATE: [(ValveLocation, ActuationType); 3] = [
    (ValveLocation::Pressurization, ActuationType::CloseVent),
    (ValveLocation::PressureRelief, ActuationType::OpenVent),
    (ValveLocation::MainPropellantValve, ActuationType::OpenVent),
];

#[derive(Debug, Error)]
pub enum StageControlError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("registry schema is missing a channel the sequencer needs: {0}")]
    Lookup(#[from] LookupError),
    #[error("registry holds no stage")]
    StageUnavailable,
    #[error("registry stage {found} diverged from sequencer stage {expected}")]
    StageDiverged { expected: Stage, found: Stage },
}

/// Observed (registry) and requested (flag) state of one valve.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ValveState {
    pub observed: Option<ActuationType>,
    pub requested: Option<ActuationRequest>,
}

/// Everything the sequencer reads in one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub now_ms: u64,
    pub stage: Option<Stage>,
    /// Normalized PT-2 pressure in psi.
    pub pt2_psi: Option<f64>,
    pub valves: HashMap<ValveLocation, ValveState>,
    pub progress_approved: bool,
}

impl Snapshot {
    pub fn valve(&self, location: ValveLocation) -> ValveState {
        self.valves.get(&location).copied().unwrap_or_default()
    }
}

/// A side effect requested by one machine tick, applied in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    PutStage(Stage),
    PutStatus(f64),
    ClearProgress,
    Actuate {
        valve_type: ValveType,
        location: ValveLocation,
        request: ActuationRequest,
    },
    Log(LogEntry),
}

#[derive(Debug, Clone)]
pub struct StageMachine {
    stages: Vec<Stage>,
    stage_idx: usize,
    curr_stage: Stage,
    status: f64,
    start_ms: u64,
    request_ms: Option<u64>,
    send_ms: Option<u64>,
    /// Postburn valves whose request has gone out since entering the stage.
    postburn_posted: HashSet<ValveLocation>,
    request_interval: f64,
    send_interval: f64,
    /// Stronger requests we already reported as blocking our own, per valve.
    suppressed: HashMap<ValveLocation, ActuationRequest>,
}

impl StageMachine {
    pub fn from_config(config: &StagesConfig, now_ms: u64) -> Result<Self, ConfigError> {
        let stages = config.resolve()?;
        let curr_stage = *stages.first().ok_or(ConfigError::EmptyStageList)?;
        Ok(Self {
            stages,
            stage_idx: 0,
            curr_stage,
            status: 0.0,
            start_ms: now_ms,
            request_ms: None,
            send_ms: None,
            postburn_posted: HashSet::new(),
            request_interval: config.request_interval,
            send_interval: config.send_interval,
            suppressed: HashMap::new(),
        })
    }

    pub fn stage(&self) -> Stage {
        self.curr_stage
    }

    pub fn stage_idx(&self) -> usize {
        self.stage_idx
    }

    pub fn status(&self) -> f64 {
        self.status
    }

    pub fn start_ms(&self) -> u64 {
        self.start_ms
    }

    fn next_stage(&self) -> Option<Stage> {
        self.stages.get(self.stage_idx + 1).copied()
    }

    /// Effects that publish the initial stage.
    pub fn begin_effects(&self) -> Vec<Effect> {
        vec![Effect::PutStage(self.curr_stage), Effect::PutStatus(self.status)]
    }

    /// One control tick.
    pub fn step(&mut self, snap: &Snapshot) -> Result<Vec<Effect>, StageControlError> {
        match snap.stage {
            None => return Err(StageControlError::StageUnavailable),
            Some(found) if found != self.curr_stage => {
                return Err(StageControlError::StageDiverged {
                    expected: self.curr_stage,
                    found,
                });
            }
            Some(_) => {}
        }

        let mut effects = Vec::new();
        let status = self.update_status(snap);
        effects.push(Effect::PutStatus(status));

        if snap.progress_approved {
            self.progress(snap, &mut effects);
            effects.push(Effect::ClearProgress);
        } else if is_complete(self.status) {
            self.send_progression_request(snap.now_ms, &mut effects);
        }

        self.stage_valve_control(snap, &mut effects);
        self.send_data(snap.now_ms, &mut effects);
        Ok(effects)
    }

    /// Recomputes and stores the status of the current stage.
    pub fn update_status(&mut self, snap: &Snapshot) -> f64 {
        self.status = self.calculate_status(snap);
        self.status
    }

    /// Completion of the current stage in percent, always within `[0, 100]`.
    pub fn calculate_status(&self, snap: &Snapshot) -> f64 {
        let pressure = snap.pt2_psi.filter(|p| p.is_finite());
        let status = match self.curr_stage {
            Stage::Waiting => COMPLETE,
            Stage::Pressurization => pressure.map_or(0.0, |p| (p / PSI_PER_PERCENT).min(COMPLETE)),
            Stage::Autosequence => {
                if snap.valve(ValveLocation::MainPropellantValve).observed
                    == Some(ActuationType::OpenVent)
                {
                    COMPLETE
                } else {
                    let elapsed = elapsed_secs(self.start_ms, snap.now_ms);
                    ((elapsed / AUTOSEQUENCE_DELAY_SECS) * 100.0).min(99.0)
                }
            }
            Stage::Postburn => pressure.map_or(0.0, |p| {
                (COMPLETE - (p - DEPRESSURIZED_PSI) / POSTBURN_PSI_PER_PERCENT).min(COMPLETE)
            }),
        };
        status.clamp(0.0, COMPLETE)
    }

    /// Advances one stage if the current one is complete.
    pub fn progress(&mut self, snap: &Snapshot, effects: &mut Vec<Effect>) {
        if !is_complete(self.status) {
            effects.push(log(
                snap.now_ms,
                "response",
                LogPriority::Crit,
                json!({
                    "header": "Stage progression failed",
                    "description": "Stage progression failed, rocket not yet ready",
                    "stage": self.curr_stage,
                    "status": self.status,
                }),
            ));
            return;
        }

        let Some(next) = self.next_stage() else {
            effects.push(log(
                snap.now_ms,
                "response",
                LogPriority::Crit,
                json!({
                    "header": "Stage progression failed",
                    "description": "Already at the final stage",
                    "stage": self.curr_stage,
                    "status": self.status,
                }),
            ));
            return;
        };

        let previous = self.curr_stage;
        self.stage_idx += 1;
        self.curr_stage = next;
        self.start_ms = snap.now_ms;
        self.send_ms = None;
        self.request_ms = None;
        self.postburn_posted.clear();
        self.suppressed.clear();
        self.update_status(snap);

        effects.push(Effect::PutStage(self.curr_stage));
        effects.push(Effect::PutStatus(self.status));
        effects.push(log(
            snap.now_ms,
            "response",
            LogPriority::Crit,
            json!({
                "header": "Stage progression successful",
                "description": "Stage progression was successful",
                "previous_stage": previous,
                "stage": self.curr_stage,
                "status": self.status,
            }),
        ));
    }

    /// Asks for approval to leave a completed stage, at most once per request interval.
    pub fn send_progression_request(&mut self, now_ms: u64, effects: &mut Vec<Effect>) {
        let Some(next) = self.next_stage() else {
            return;
        };
        if !interval_elapsed(self.request_ms, now_ms, self.request_interval) {
            return;
        }
        effects.push(log(
            now_ms,
            "response",
            LogPriority::Crit,
            json!({
                "header": "Stage progression request",
                "current_stage": self.curr_stage,
                "next_stage": next,
            }),
        ));
        self.request_ms = Some(now_ms);
    }

    pub fn send_data(&mut self, now_ms: u64, effects: &mut Vec<Effect>) {
        if !interval_elapsed(self.send_ms, now_ms, self.send_interval) {
            return;
        }
        effects.push(log(
            now_ms,
            "stage",
            LogPriority::Info,
            json!({ "stage": self.curr_stage, "status": self.status }),
        ));
        self.send_ms = Some(now_ms);
    }

    /// Posts the valve requests the current stage calls for.
    pub fn stage_valve_control(&mut self, snap: &Snapshot, effects: &mut Vec<Effect>) {
        match self.curr_stage {
            Stage::Waiting => {
                for location in WAITING_CLOSED {
                    self.hold(snap, location, ActuationType::CloseVent, effects);
                }
            }
            Stage::Pressurization => {
                self.hold(snap, ValveLocation::Pressurization, ActuationType::OpenVent, effects);
            }
            Stage::Autosequence => {
                self.hold(snap, ValveLocation::Pressurization, ActuationType::CloseVent, effects);
                if elapsed_secs(self.start_ms, snap.now_ms) > AUTOSEQUENCE_DELAY_SECS {
                    self.hold(
                        snap,
                        ValveLocation::MainPropellantValve,
                        ActuationType::OpenVent,
                        effects,
                    );
                }
            }
            Stage::Postburn => {
                for (location, actuation) in POSTBURN_STATE {
                    if !self.postburn_posted.contains(&location)
                        && self.post(snap, location, actuation, effects)
                    {
                        self.postburn_posted.insert(location);
                    }
                }
            }
        }
    }

    /// Requests `actuation` unless the valve already reports it or it is already requested.
    fn hold(
        &mut self,
        snap: &Snapshot,
        location: ValveLocation,
        actuation: ActuationType,
        effects: &mut Vec<Effect>,
    ) {
        let valve = snap.valve(location);
        if valve.observed == Some(actuation) {
            return;
        }
        if valve.requested == Some(ActuationRequest::new(actuation, SEQUENCER_PRIORITY)) {
            return;
        }
        self.post(snap, location, actuation, effects);
    }

    fn post(
        &mut self,
        snap: &Snapshot,
        location: ValveLocation,
        actuation: ActuationType,
        effects: &mut Vec<Effect>,
    ) -> bool {
        if let Some(current) = snap.valve(location).requested
            && current.priority.outranks(SEQUENCER_PRIORITY)
        {
            if current.actuation != actuation && self.suppressed.get(&location) != Some(&current) {
                effects.push(log(
                    snap.now_ms,
                    "response",
                    LogPriority::Crit,
                    json!({
                        "header": "Actuation suppressed",
                        "description": "A stronger request holds this valve",
                        "stage": self.curr_stage,
                        "valve": location,
                        "wanted": actuation,
                        "held": current.actuation,
                        "held_priority": current.priority,
                    }),
                ));
                self.suppressed.insert(location, current);
            }
            return false;
        }

        self.suppressed.remove(&location);
        effects.push(Effect::Actuate {
            valve_type: SEQUENCER_VALVES,
            location,
            request: ActuationRequest::new(actuation, SEQUENCER_PRIORITY),
        });
        true
    }
}

fn is_complete(status: f64) -> bool {
    status >= COMPLETE
}

fn interval_elapsed(last_ms: Option<u64>, now_ms: u64, interval_secs: f64) -> bool {
    match last_ms {
        None => true,
        Some(last) => elapsed_secs(last, now_ms) > interval_secs,
    }
}

fn log(timestamp_ms: u64, header: &str, priority: LogPriority, message: serde_json::Value) -> Effect {
    Effect::Log(LogEntry {
        timestamp_ms,
        header: header.to_string(),
        priority,
        message,
    })
}

/// Runs a [`StageMachine`] against the shared registry and flag.
pub struct StageControl {
    registry: Arc<Registry>,
    flag: Arc<Flag>,
    clock: Arc<dyn Clock>,
    machine: StageMachine,
}

impl StageControl {
    /// Builds the sequencer from configuration and publishes the first stage.
    pub fn begin(
        registry: Arc<Registry>,
        flag: Arc<Flag>,
        clock: Arc<dyn Clock>,
        config: &StagesConfig,
    ) -> Result<Self, StageControlError> {
        let machine = StageMachine::from_config(config, clock.now_ms())?;
        let control = Self {
            registry,
            flag,
            clock,
            machine,
        };
        control.apply(control.machine.begin_effects());
        tracing::info!(stage = %control.machine.stage(), "stage control started");
        Ok(control)
    }

    pub fn execute(&mut self) -> Result<(), StageControlError> {
        let snap = self.snapshot()?;
        let effects = self.machine.step(&snap)?;
        self.apply(effects);
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Snapshot, LookupError> {
        let mut valves = HashMap::new();
        for location in ValveLocation::ALL {
            let observed = self.registry.valve_actuation(SEQUENCER_VALVES, location)?;
            let requested = self
                .flag
                .actuation_request(SEQUENCER_VALVES, location)?
                .map(|posted| posted.request);
            valves.insert(location, ValveState { observed, requested });
        }
        Ok(Snapshot {
            now_ms: self.clock.now_ms(),
            stage: self.registry.stage()?,
            pt2_psi: self
                .registry
                .sensor_normalized(SensorType::Pressure, SensorLocation::PT2)?,
            valves,
            progress_approved: self.flag.progress_approved()?,
        })
    }

    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            let result = match effect {
                Effect::PutStage(stage) => self.registry.put_stage(stage),
                Effect::PutStatus(status) => self.registry.put_stage_status(status),
                Effect::ClearProgress => self.flag.set_progress(false),
                Effect::Actuate {
                    valve_type,
                    location,
                    request,
                } => {
                    tracing::info!(?valve_type, ?location, ?request, "posting actuation request");
                    self.flag.request_actuation(valve_type, location, request)
                }
                Effect::Log(entry) => self.registry.enqueue(entry),
            };
            if let Err(e) = result {
                tracing::error!(error = %e, "stage control write rejected");
            }
        }
    }

    /// Reports a fatal error through telemetry before the control loop stops.
    fn report_halt(&self, err: &StageControlError) {
        tracing::error!(error = %err, stage = %self.machine.stage(), "stage control halted");
        let entry = LogEntry {
            timestamp_ms: self.clock.now_ms(),
            header: "response".to_string(),
            priority: LogPriority::Crit,
            message: json!({
                "header": "Stage control halted",
                "description": err.to_string(),
                "stage": self.machine.stage(),
                "stage_index": self.machine.stage_idx(),
                "stage_started_ms": self.machine.start_ms(),
                "status": self.machine.status(),
            }),
        };
        if let Err(e) = self.registry.enqueue(entry) {
            tracing::error!(error = %e, "failed to queue halt notice");
        }
    }
}

/// Ticks the sequencer until it hits a fatal error.
pub async fn stage_task(mut control: StageControl, period: Duration) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if let Err(err) = control.execute() {
            control.report_halt(&err);
            break;
        }
    }
}
