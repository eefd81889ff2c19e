use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock source in milliseconds since the Unix epoch.
///
/// Any `Fn() -> u64` works, so `get_current_timestamp_ms` can be handed out directly.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

impl<F> Clock for F
where
    F: Fn() -> u64 + Send + Sync,
{
    fn now_ms(&self) -> u64 {
        self()
    }
}

pub fn get_current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds elapsed between two millisecond timestamps, zero if `now` is earlier.
pub fn elapsed_secs(since_ms: u64, now_ms: u64) -> f64 {
    now_ms.saturating_sub(since_ms) as f64 / 1000.0
}

#[cfg(test)]
pub use manual::ManualClock;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_never_goes_negative() {
        assert_eq!(elapsed_secs(2_000, 4_500), 2.5);
        assert_eq!(elapsed_secs(5_000, 4_000), 0.0);
    }

    #[test]
    fn plain_functions_are_clocks() {
        let clock: &dyn Clock = &get_current_timestamp_ms;
        assert!(clock.now_ms() > 0);
    }
}
