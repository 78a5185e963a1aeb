use std::future::Future;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;

use crate::errors::ApiError;
use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through
    Closed,
    /// Requests are rejected until `open_timeout` elapses
    Open,
    /// Probing: a few requests are allowed to test recovery
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure rate that opens the circuit (0.5 = 50%)
    pub failure_threshold: f64,

    /// Requests in the current window before the rate is considered
    pub minimum_requests: usize,

    /// How long to stay open before probing
    pub open_timeout: Duration,

    /// Successful probes needed to close again
    pub success_threshold: usize,

    /// Statistics window
    pub window_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 0.5, minimum_requests: 10, open_timeout: Duration::from_secs(30), success_threshold: 3, window_duration: Duration::from_secs(60) }
    }
}

impl CircuitBreakerConfig {
    /// Trip early; snapshot repairs should fail fast while the backend is down
    pub fn aggressive() -> Self {
        Self { failure_threshold: 0.3, minimum_requests: 5, open_timeout: Duration::from_secs(10), success_threshold: 2, window_duration: Duration::from_secs(30) }
    }

    pub fn conservative() -> Self {
        Self { failure_threshold: 0.7, minimum_requests: 20, open_timeout: Duration::from_secs(60), success_threshold: 2, window_duration: Duration::from_secs(120) }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    opened_at: Option<Instant>,
    window_start: Instant,
    total: usize,
    failed: usize,
    probe_successes: usize,
}

/// Fails REST calls fast while the backend is unhealthy.
///
/// Only server-side failures (transport errors, 5xx, malformed bodies) count; a 401 or a 404 says
/// nothing about backend health.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(BreakerInner { state: CircuitState::Closed, opened_at: None, window_start: Instant::now(), total: 0, failed: 0, probe_successes: 0 }),
            config,
        }
    }

    pub async fn call_async<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.check_allow()?;

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if err.is_server_side() {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(err)
            }
        }
    }

    pub fn check_allow(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if inner.state == CircuitState::Closed && now.duration_since(inner.window_start) >= self.config.window_duration {
            inner.window_start = now;
            inner.total = 0;
            inner.failed = 0;
        }

        if inner.state == CircuitState::Open {
            let elapsed = inner.opened_at.map(|at| now.duration_since(at)).unwrap_or_default();
            if elapsed < self.config.open_timeout {
                return Err(ApiError::CircuitOpen);
            }
            tracing::info!("Circuit half-open after {elapsed:?}");
            inner.state = CircuitState::HalfOpen;
            inner.probe_successes = 0;
        }

        inner.total += 1;
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::HalfOpen {
            return;
        }
        inner.probe_successes += 1;
        if inner.probe_successes >= self.config.success_threshold {
            tracing::info!("Circuit closed");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.window_start = Instant::now();
            inner.total = 0;
            inner.failed = 0;
            inner.probe_successes = 0;
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failed += 1;
                let rate = inner.failed as f64 / inner.total.max(1) as f64;
                if inner.total >= self.config.minimum_requests && rate >= self.config.failure_threshold {
                    tracing::warn!("Circuit opened: {} of {} requests failed", inner.failed, inner.total);
                    Self::open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("Probe failed, circuit re-opened");
                Self::open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    pub fn current_state(&self) -> CircuitState {
        self.inner.lock().state
    }

    fn open(inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error() -> ApiError {
        ApiError::Status { status: 503, message: "unavailable".to_string() }
    }

    #[tokio::test]
    async fn test_opens_after_failure_rate() {
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig { minimum_requests: 4, failure_threshold: 0.5, ..Default::default() });

        let _ = breaker.call_async(|| async { Ok::<_, ApiError>(1) }).await;
        let _ = breaker.call_async(|| async { Ok::<_, ApiError>(1) }).await;
        let _ = breaker.call_async(|| async { Err::<i32, _>(server_error()) }).await;
        assert_eq!(breaker.current_state(), CircuitState::Closed);

        let _ = breaker.call_async(|| async { Err::<i32, _>(server_error()) }).await;
        assert_eq!(breaker.current_state(), CircuitState::Open);
        assert!(matches!(breaker.call_async(|| async { Ok::<_, ApiError>(1) }).await, Err(ApiError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_client_errors_do_not_trip() {
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig { minimum_requests: 2, ..Default::default() });
        for _ in 0..5 {
            let _ = breaker.call_async(|| async { Err::<i32, _>(ApiError::Unauthorized { status: 401 }) }).await;
        }
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_closes() {
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
            minimum_requests: 1,
            open_timeout: Duration::ZERO,
            success_threshold: 2,
            ..Default::default()
        });
        breaker.check_allow().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.current_state(), CircuitState::Open);

        breaker.check_allow().unwrap();
        assert_eq!(breaker.current_state(), CircuitState::HalfOpen);
        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig { minimum_requests: 1, open_timeout: Duration::ZERO, ..Default::default() });
        breaker.check_allow().unwrap();
        breaker.record_failure();
        breaker.check_allow().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.current_state(), CircuitState::Open);
    }
}
