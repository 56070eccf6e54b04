//! Circuit breaker guarding external routing calls.
//!
//! Three consecutive failures open the circuit for ten seconds, after which
//! a single probe is allowed through. While open, callers short-circuit to
//! the local haversine fallback.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::geo::{haversine_km, GeoPoint};
use crate::ports::{DistanceOracle, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    threshold: u32,
    open_for: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_for: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            threshold,
            open_for,
        }
    }

    /// Whether a call may proceed. While open, returns true exactly once
    /// per open period after the timeout elapses (the half-open probe).
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.open_for)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!("circuit breaker half-open, allowing probe");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != BreakerState::Closed {
            tracing::info!("circuit breaker closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        inner.probe_in_flight = false;
        if inner.state == BreakerState::HalfOpen || inner.consecutive_failures >= self.threshold {
            if inner.state != BreakerState::Open {
                tracing::warn!(
                    failures = inner.consecutive_failures,
                    "circuit breaker opened"
                );
            }
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Observable state for metrics.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }
}

/// Distance oracle wrapping an external routing service with the breaker
/// and a per-call timeout. Any failure — open circuit, timeout, upstream
/// error — falls back to the great-circle distance, so callers never see
/// `upstream_unavailable` from this path.
pub struct ResilientDistanceOracle {
    remote: Arc<dyn DistanceOracle>,
    breaker: Arc<CircuitBreaker>,
    call_timeout: Duration,
}

impl ResilientDistanceOracle {
    pub fn new(remote: Arc<dyn DistanceOracle>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            remote,
            breaker,
            call_timeout: Duration::from_millis(200),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl DistanceOracle for ResilientDistanceOracle {
    async fn distance_km(&self, from: GeoPoint, to: GeoPoint) -> Result<f64> {
        if !self.breaker.try_acquire() {
            return Ok(haversine_km(from, to));
        }
        match tokio::time::timeout(self.call_timeout, self.remote.distance_km(from, to)).await {
            Ok(Ok(distance)) => {
                self.breaker.record_success();
                Ok(distance)
            }
            Ok(Err(err)) => {
                tracing::debug!(error = %err, "routing call failed, falling back to haversine");
                self.breaker.record_failure();
                Ok(haversine_km(from, to))
            }
            Err(_) => {
                tracing::debug!("routing call timed out, falling back to haversine");
                self.breaker.record_failure();
                Ok(haversine_km(from, to))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingOracle {
        calls: AtomicU32,
    }

    #[async_trait]
    impl DistanceOracle for FailingOracle {
        async fn distance_km(&self, _from: GeoPoint, _to: GeoPoint) -> Result<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::UpstreamUnavailable("routing down".into()))
        }
    }

    #[test]
    fn opens_after_three_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        for _ in 0..2 {
            assert!(breaker.try_acquire());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn allows_single_probe_after_timeout() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.try_acquire(), "first call after timeout is the probe");
        assert!(!breaker.try_acquire(), "only one probe in flight");

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire());
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.try_acquire());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());
    }

    #[tokio::test]
    async fn fourth_call_short_circuits_to_haversine() {
        let remote = Arc::new(FailingOracle {
            calls: AtomicU32::new(0),
        });
        let oracle = ResilientDistanceOracle::new(
            remote.clone(),
            Arc::new(CircuitBreaker::new(3, Duration::from_secs(10))),
        );

        let a = GeoPoint::new(-6.2, 106.8);
        let b = GeoPoint::new(-6.9, 107.6);
        let expected = haversine_km(a, b);

        for _ in 0..3 {
            let d = oracle.distance_km(a, b).await.unwrap();
            assert!((d - expected).abs() < 1e-9, "fallback distance expected");
        }
        assert_eq!(remote.calls.load(Ordering::SeqCst), 3);

        // Circuit is open: the remote must not be invoked again.
        let d = oracle.distance_km(a, b).await.unwrap();
        assert!((d - expected).abs() < 1e-9);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 3);
        assert_eq!(oracle.breaker().state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn probe_attempted_after_open_window() {
        let remote = Arc::new(FailingOracle {
            calls: AtomicU32::new(0),
        });
        let oracle = ResilientDistanceOracle::new(
            remote.clone(),
            Arc::new(CircuitBreaker::new(1, Duration::from_millis(20))),
        );
        let a = GeoPoint::new(-6.2, 106.8);
        let b = GeoPoint::new(-6.3, 106.9);

        oracle.distance_km(a, b).await.unwrap();
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        oracle.distance_km(a, b).await.unwrap();
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1, "open: no call");

        tokio::time::sleep(Duration::from_millis(30)).await;
        oracle.distance_km(a, b).await.unwrap();
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2, "probe reached remote");
    }
}
