use std::time::Duration;

use tokio::time::Instant;

/// Tracks inbound activity on a link; a link with no traffic for `timeout` is considered dead
pub struct HealthChecker {
    last_activity: Instant,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> Self {
        Self { last_activity: Instant::now(), timeout }
    }

    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_healthy(&self) -> bool {
        self.last_activity.elapsed() < self.timeout
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}
