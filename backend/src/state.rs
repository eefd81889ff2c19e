use crate::flag::Flag;
use crate::registry::Registry;
use crate::ring_buffer::RingBuffer;
use engine_control_shared::{LogEntry, OperatorCommand};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct AppState {
    /// Observed state: sensors, valve feedback, stage and status
    pub registry: Arc<Registry>,

    /// Requested state: progress approval and valve requests
    pub flag: Arc<Flag>,

    /// Operator commands → actuation task
    pub cmd_tx: mpsc::Sender<OperatorCommand>,

    /// Telemetry entries already drained from the registry queue
    pub logs: Arc<Mutex<RingBuffer<LogEntry>>>,
}
