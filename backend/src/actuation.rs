//! Actuation executor: turns flag requests into valve writes and reports valve feedback.

use crate::clock::Clock;
use crate::flag::Flag;
use crate::registry::Registry;
use engine_control_shared::{
    ABORT_STATE, ActuationRequest, ActuationType, LogEntry, LogPriority, OperatorCommand,
    ValveLocation, ValvePriority, ValveType,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior, interval};

type Valve = (ValveType, ValveLocation);

/// Hardware side of the valves.
pub trait ValveDriver: Send {
    /// Returns `false` when the command could not be delivered.
    fn write(&mut self, valve_type: ValveType, location: ValveLocation, actuation: ActuationType) -> bool;
    /// Actuation the valve currently reports, if it reports anything.
    fn observed(&mut self, valve_type: ValveType, location: ValveLocation) -> Option<ActuationType>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Priority `None` never drives a valve.
    Ignored,
    Rejected { governing: ActuationRequest },
    Unchanged,
    Apply,
}

/// Tracks the request currently governing each valve.
#[derive(Debug, Default)]
pub struct Arbiter {
    governing: HashMap<Valve, ActuationRequest>,
}

impl Arbiter {
    pub fn evaluate(&self, valve: Valve, request: ActuationRequest) -> Decision {
        if request.priority == ValvePriority::None {
            return Decision::Ignored;
        }
        match self.governing.get(&valve) {
            Some(governing) if governing.priority.outranks(request.priority) => Decision::Rejected {
                governing: *governing,
            },
            Some(governing) if *governing == request => Decision::Unchanged,
            _ => Decision::Apply,
        }
    }

    pub fn latch(&mut self, valve: Valve, request: ActuationRequest) {
        self.governing.insert(valve, request);
    }

    pub fn release(&mut self, valve: Valve) -> Option<ActuationRequest> {
        self.governing.remove(&valve)
    }
}

pub struct ActuationExecutor {
    registry: Arc<Registry>,
    flag: Arc<Flag>,
    clock: Arc<dyn Clock>,
    driver: Box<dyn ValveDriver>,
    arbiter: Arbiter,
    /// Last request per valve that was rejected or failed, so each is reported once.
    reported: HashMap<Valve, ActuationRequest>,
}

impl ActuationExecutor {
    pub fn new(
        registry: Arc<Registry>,
        flag: Arc<Flag>,
        clock: Arc<dyn Clock>,
        driver: Box<dyn ValveDriver>,
    ) -> Self {
        Self {
            registry,
            flag,
            clock,
            driver,
            arbiter: Arbiter::default(),
            reported: HashMap::new(),
        }
    }

    pub fn poll_once(&mut self) {
        for valve_type in ValveType::ALL {
            for location in ValveLocation::ALL {
                self.arbitrate((valve_type, location));
                self.publish_observed((valve_type, location));
            }
        }
    }

    fn arbitrate(&mut self, valve: Valve) {
        let (valve_type, location) = valve;
        let posted = match self.flag.actuation_request(valve_type, location) {
            Ok(Some(posted)) => posted,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "flag has no slot for valve");
                return;
            }
        };
        let request = posted.request;

        match self.arbiter.evaluate(valve, request) {
            Decision::Ignored | Decision::Unchanged => {}
            Decision::Rejected { governing } => {
                self.report_once(valve, request, "Actuation rejected", json!({
                    "description": "A stronger request governs this valve",
                    "held": governing.actuation,
                    "held_priority": governing.priority,
                }));
            }
            Decision::Apply => {
                if self.driver.write(valve_type, location, request.actuation) {
                    tracing::info!(
                        ?valve_type,
                        ?location,
                        ?request,
                        posted_ms = posted.timestamp_ms,
                        "valve actuated"
                    );
                    self.arbiter.latch(valve, request);
                    self.reported.remove(&valve);
                } else {
                    self.report_once(valve, request, "Actuation failed", json!({
                        "description": "Valve write was not acknowledged",
                    }));
                }
            }
        }
    }

    fn report_once(&mut self, valve: Valve, request: ActuationRequest, header: &str, detail: serde_json::Value) {
        if self.reported.insert(valve, request) == Some(request) {
            return;
        }
        let (valve_type, location) = valve;
        tracing::warn!(?valve_type, ?location, ?request, "{header}");
        let mut message = json!({
            "header": header,
            "valve_type": valve_type,
            "valve": location,
            "actuation": request.actuation,
            "priority": request.priority,
        });
        if let (Some(message), serde_json::Value::Object(detail)) = (message.as_object_mut(), detail) {
            message.extend(detail);
        }
        self.enqueue(LogPriority::Crit, message);
    }

    fn publish_observed(&mut self, (valve_type, location): Valve) {
        let Some(actuation) = self.driver.observed(valve_type, location) else {
            return;
        };
        if let Err(e) = self.registry.put_valve_actuation(valve_type, location, actuation) {
            tracing::error!(?valve_type, ?location, error = %e, "valve feedback rejected");
        }
    }

    fn enqueue(&self, priority: LogPriority, message: serde_json::Value) {
        let entry = LogEntry {
            timestamp_ms: self.clock.now_ms(),
            header: "response".to_string(),
            priority,
            message,
        };
        if let Err(e) = self.registry.enqueue(entry) {
            tracing::error!(error = %e, "telemetry queue rejected entry");
        }
    }

    fn post(&self, valve_type: ValveType, location: ValveLocation, request: ActuationRequest) {
        if let Err(e) = self.flag.request_actuation(valve_type, location, request) {
            tracing::error!(?valve_type, ?location, error = %e, "actuation request rejected");
        }
    }

    pub fn handle(&mut self, cmd: OperatorCommand) {
        tracing::info!(?cmd, "operator command");
        self.enqueue(
            LogPriority::Crit,
            json!({ "header": "Operator command", "command": cmd }),
        );

        match cmd {
            OperatorCommand::Progress => {
                if let Err(e) = self.flag.set_progress(true) {
                    tracing::error!(error = %e, "progress approval rejected");
                }
            }
            OperatorCommand::Abort => {
                for (location, actuation) in ABORT_STATE {
                    let request = ActuationRequest::new(actuation, ValvePriority::Abort);
                    self.post(ValveType::Solenoid, location, request);
                    self.arbitrate((ValveType::Solenoid, location));
                }
            }
            OperatorCommand::Actuate {
                valve_type,
                location,
                actuation,
            } => {
                let request = ActuationRequest::new(actuation, ValvePriority::MaxTelemetry);
                self.post(valve_type, location, request);
            }
            OperatorCommand::Release {
                valve_type,
                location,
            } => {
                self.arbiter.release((valve_type, location));
                self.reported.remove(&(valve_type, location));
                // leave a slot the sequencer is allowed to overwrite
                self.post(
                    valve_type,
                    location,
                    ActuationRequest::new(ActuationType::None, ValvePriority::None),
                );
            }
        }
    }
}

pub async fn actuation_task(
    mut executor: ActuationExecutor,
    period: Duration,
    mut cmd_rx: mpsc::Receiver<OperatorCommand>,
) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tick.tick() => executor.poll_once(),
            Some(cmd) = cmd_rx.recv() => executor.handle(cmd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Mutex;

    const PRESS: Valve = (ValveType::Solenoid, ValveLocation::Pressurization);

    #[derive(Clone, Default)]
    struct RecordingDriver {
        writes: Arc<Mutex<Vec<(Valve, ActuationType)>>>,
        fail: bool,
    }

    impl ValveDriver for RecordingDriver {
        fn write(&mut self, valve_type: ValveType, location: ValveLocation, actuation: ActuationType) -> bool {
            if self.fail {
                return false;
            }
            self.writes
                .lock()
                .expect("lock")
                .push(((valve_type, location), actuation));
            true
        }

        fn observed(&mut self, valve_type: ValveType, location: ValveLocation) -> Option<ActuationType> {
            self.writes
                .lock()
                .expect("lock")
                .iter()
                .rev()
                .find(|(valve, _)| *valve == (valve_type, location))
                .map(|(_, actuation)| *actuation)
        }
    }

    fn req(actuation: ActuationType, priority: ValvePriority) -> ActuationRequest {
        ActuationRequest::new(actuation, priority)
    }

    #[test]
    fn arbiter_rules() {
        let mut arbiter = Arbiter::default();
        let pi_open = req(ActuationType::OpenVent, ValvePriority::Pi);
        assert_eq!(
            arbiter.evaluate(PRESS, req(ActuationType::OpenVent, ValvePriority::None)),
            Decision::Ignored
        );
        assert_eq!(arbiter.evaluate(PRESS, pi_open), Decision::Apply);

        let abort = req(ActuationType::CloseVent, ValvePriority::Abort);
        arbiter.latch(PRESS, abort);
        assert_eq!(
            arbiter.evaluate(PRESS, pi_open),
            Decision::Rejected { governing: abort }
        );
        assert_eq!(arbiter.evaluate(PRESS, abort), Decision::Unchanged);

        assert_eq!(arbiter.release(PRESS), Some(abort));
        assert_eq!(arbiter.governing.get(&PRESS), None);
        assert_eq!(arbiter.evaluate(PRESS, pi_open), Decision::Apply);
    }

    struct Rig {
        executor: ActuationExecutor,
        registry: Arc<Registry>,
        flag: Arc<Flag>,
        writes: Arc<Mutex<Vec<(Valve, ActuationType)>>>,
    }

    fn rig(fail: bool) -> Rig {
        let registry = Arc::new(Registry::with_default_schema().expect("registry"));
        let flag = Arc::new(Flag::with_default_schema().expect("flag"));
        let driver = RecordingDriver {
            fail,
            ..RecordingDriver::default()
        };
        let writes = driver.writes.clone();
        let executor = ActuationExecutor::new(
            registry.clone(),
            flag.clone(),
            Arc::new(ManualClock::new(1_000)),
            Box::new(driver),
        );
        Rig {
            executor,
            registry,
            flag,
            writes,
        }
    }

    fn writes(rig: &Rig) -> Vec<(Valve, ActuationType)> {
        rig.writes.lock().expect("lock").clone()
    }

    #[test]
    fn requests_are_applied_once_and_fed_back() {
        let mut rig = rig(false);
        rig.flag
            .request_actuation(PRESS.0, PRESS.1, req(ActuationType::OpenVent, ValvePriority::Pi))
            .expect("post");

        rig.executor.poll_once();
        rig.executor.poll_once();

        assert_eq!(writes(&rig), [(PRESS, ActuationType::OpenVent)]);
        assert_eq!(
            rig.registry.valve_actuation(PRESS.0, PRESS.1).expect("declared"),
            Some(ActuationType::OpenVent)
        );
    }

    #[test]
    fn abort_governs_until_released() {
        let mut rig = rig(false);
        rig.executor.handle(OperatorCommand::Abort);
        assert_eq!(writes(&rig).len(), ABORT_STATE.len());
        assert_eq!(
            rig.executor.arbiter.governing.get(&PRESS),
            Some(&req(ActuationType::CloseVent, ValvePriority::Abort))
        );

        rig.flag
            .request_actuation(PRESS.0, PRESS.1, req(ActuationType::OpenVent, ValvePriority::Pi))
            .expect("post");
        rig.executor.poll_once();
        rig.executor.poll_once();
        assert_eq!(writes(&rig).len(), ABORT_STATE.len());

        let rejections = rig
            .registry
            .take_telemetry()
            .expect("take")
            .into_iter()
            .filter(|l| l.message["header"] == "Actuation rejected")
            .count();
        assert_eq!(rejections, 1);

        rig.executor.handle(OperatorCommand::Release {
            valve_type: PRESS.0,
            location: PRESS.1,
        });
        let slot = rig
            .flag
            .actuation_request(PRESS.0, PRESS.1)
            .expect("declared")
            .expect("written");
        assert_eq!(slot.request.priority, ValvePriority::None);

        rig.flag
            .request_actuation(PRESS.0, PRESS.1, req(ActuationType::OpenVent, ValvePriority::Pi))
            .expect("post");
        rig.executor.poll_once();
        assert_eq!(writes(&rig).last(), Some(&(PRESS, ActuationType::OpenVent)));
    }

    #[test]
    fn operator_commands_reach_the_flag() {
        let mut rig = rig(false);
        rig.executor.handle(OperatorCommand::Progress);
        assert!(rig.flag.progress_approved().expect("declared"));

        rig.executor.handle(OperatorCommand::Actuate {
            valve_type: ValveType::Ball,
            location: ValveLocation::RemoteDrain,
            actuation: ActuationType::OpenVent,
        });
        let posted = rig
            .flag
            .actuation_request(ValveType::Ball, ValveLocation::RemoteDrain)
            .expect("declared")
            .expect("written");
        assert_eq!(
            posted.request,
            req(ActuationType::OpenVent, ValvePriority::MaxTelemetry)
        );
    }

    #[test]
    fn failed_writes_are_retried_but_reported_once() {
        let mut rig = rig(true);
        rig.flag
            .request_actuation(PRESS.0, PRESS.1, req(ActuationType::OpenVent, ValvePriority::Pi))
            .expect("post");
        rig.executor.poll_once();
        rig.executor.poll_once();

        assert_eq!(rig.executor.arbiter.governing.get(&PRESS), None);
        let failures = rig
            .registry
            .take_telemetry()
            .expect("take")
            .into_iter()
            .filter(|l| l.message["header"] == "Actuation failed")
            .count();
        assert_eq!(failures, 1);
    }
}
