use crate::registry::Registry;
use crate::ring_buffer::RingBuffer;
use engine_control_shared::{LogEntry, LogPriority};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, MissedTickBehavior, interval};

/// Moves queued telemetry out of the registry into the log stream and the recent-log buffer.
pub fn drain_once(registry: &Registry, logs: &Mutex<RingBuffer<LogEntry>>) -> usize {
    let entries = match registry.take_telemetry() {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(error = %e, "registry has no telemetry queue");
            return 0;
        }
    };
    let count = entries.len();

    let mut rb = logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    for entry in entries {
        match entry.priority {
            LogPriority::Crit => tracing::warn!(
                target: "telemetry",
                timestamp_ms = entry.timestamp_ms,
                header = %entry.header,
                body = %entry.message,
                "telemetry"
            ),
            LogPriority::Info => tracing::info!(
                target: "telemetry",
                timestamp_ms = entry.timestamp_ms,
                header = %entry.header,
                body = %entry.message,
                "telemetry"
            ),
        }
        rb.push(entry);
    }
    if count > 0 {
        tracing::trace!(drained = count, buffered = rb.len(), "telemetry drained");
    }
    count
}

pub async fn telemetry_task(
    registry: Arc<Registry>,
    logs: Arc<Mutex<RingBuffer<LogEntry>>>,
    period: Duration,
) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        drain_once(&registry, &logs);
    }
}
