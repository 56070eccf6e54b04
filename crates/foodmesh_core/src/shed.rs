//! Adaptive load shedder.
//!
//! Tracks the rolling average response latency over windows of 100
//! requests. When the average exceeds the threshold the shedder trips and
//! new requests are rejected with an overload outcome until a later window
//! recovers.

use std::sync::Mutex;
use std::time::Duration;

const WINDOW: usize = 100;

#[derive(Debug)]
struct ShedState {
    latency_sum: Duration,
    request_count: usize,
    shedding: bool,
}

#[derive(Debug)]
pub struct LoadShedder {
    state: Mutex<ShedState>,
    threshold: Duration,
}

impl LoadShedder {
    pub fn new(threshold: Duration) -> Self {
        Self {
            state: Mutex::new(ShedState {
                latency_sum: Duration::ZERO,
                request_count: 0,
                shedding: false,
            }),
            threshold,
        }
    }

    pub fn is_shedding(&self) -> bool {
        self.state.lock().unwrap().shedding
    }

    /// Record a completed request's latency. Every 100 requests the window
    /// is evaluated and reset.
    pub fn record(&self, elapsed: Duration) {
        let mut state = self.state.lock().unwrap();
        state.latency_sum += elapsed;
        state.request_count += 1;

        if state.request_count >= WINDOW {
            let avg = state.latency_sum / state.request_count as u32;
            let was_shedding = state.shedding;
            state.shedding = avg > self.threshold;
            if state.shedding && !was_shedding {
                tracing::warn!(avg_ms = avg.as_millis() as u64, "load shedding engaged");
            } else if !state.shedding && was_shedding {
                tracing::info!(avg_ms = avg.as_millis() as u64, "load shedding released");
            }
            state.latency_sum = Duration::ZERO;
            state.request_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_when_window_average_exceeds_threshold() {
        let shedder = LoadShedder::new(Duration::from_millis(500));
        for _ in 0..WINDOW {
            shedder.record(Duration::from_millis(600));
        }
        assert!(shedder.is_shedding());
    }

    #[test]
    fn stays_quiet_under_threshold() {
        let shedder = LoadShedder::new(Duration::from_millis(500));
        for _ in 0..WINDOW {
            shedder.record(Duration::from_millis(100));
        }
        assert!(!shedder.is_shedding());
    }

    #[test]
    fn no_decision_before_window_fills() {
        let shedder = LoadShedder::new(Duration::from_millis(500));
        for _ in 0..WINDOW - 1 {
            shedder.record(Duration::from_secs(5));
        }
        assert!(!shedder.is_shedding());
    }

    #[test]
    fn recovers_after_a_calm_window() {
        let shedder = LoadShedder::new(Duration::from_millis(500));
        for _ in 0..WINDOW {
            shedder.record(Duration::from_millis(900));
        }
        assert!(shedder.is_shedding());
        for _ in 0..WINDOW {
            shedder.record(Duration::from_millis(50));
        }
        assert!(!shedder.is_shedding());
    }
}
