//! Connection lifecycle per endpoint: the state machine, the backoff schedule and the task that
//! drives a transport through `Connecting -> Open -> Degraded -> Reconnecting -> Open` until it is closed.

use std::sync::Arc;
use std::time::Duration;

use fleet_types::ConnectionState;
use fleet_ws::Transport;
use fleet_ws::WsError;
use futures::future::BoxFuture;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::alerts::AlertLatch;
use crate::alerts::SyncEvent;
use crate::config::BackoffConfig;
use crate::errors::Result;
use crate::errors::SyncError;

/// Exponential backoff with jitter: `min(base * 2^attempt, max)`, jittered and capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay for an attempt number
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.config.base_delay.checked_mul(factor).unwrap_or(self.config.max_delay).min(self.config.max_delay)
    }

    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.nominal_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.jitter;
        if jitter <= 0.0 {
            return nominal;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        nominal.mul_f64(factor.max(0.0)).min(self.config.max_delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Legal connection-state transitions; everything else is rejected
#[derive(Debug, Default)]
pub struct ConnectionMachine {
    state: ConnectionState,
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_legal(from: ConnectionState, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (from, to),
            (Idle, Connecting)
                | (Connecting, Open)
                | (Connecting, Degraded)
                | (Open, Degraded)
                | (Degraded, Reconnecting)
                | (Reconnecting, Open)
                | (Reconnecting, Degraded)
        ) || (to == Closed && from != Closed)
    }

    /// Move to `to`. Returns false when already there.
    pub fn advance(&mut self, to: ConnectionState) -> Result<bool> {
        if self.state == to {
            return Ok(false);
        }
        if !Self::is_legal(self.state, to) {
            return Err(SyncError::IllegalTransition { from: self.state, to });
        }
        self.state = to;
        Ok(true)
    }
}

/// What the controller asks of the rest of the client
pub trait ControllerHooks: Send + Sync + 'static {
    /// The link is open. Resolves once the endpoint's channels are ready for live updates;
    /// `recovered` is true after a reconnect, when channels need a snapshot repair.
    fn on_open(&self, url: &str, recovered: bool) -> BoxFuture<'static, ()>;

    /// A reconnect attempt on `transport` is about to start
    fn before_reconnect(&self, _transport: &Transport) {}

    fn on_event(&self, event: SyncEvent);

    /// The transport was closed and the controller is exiting
    fn on_closed(&self, _transport: &Transport) {}
}

pub struct ReconnectController {
    transport: Transport,
    hooks: Arc<dyn ControllerHooks>,
    backoff: Backoff,
    machine: ConnectionMachine,
    alert_after: Option<u32>,
    failures: u32,
    lost: AlertLatch,
    auth: AlertLatch,
}

impl ReconnectController {
    pub fn new(transport: Transport, hooks: Arc<dyn ControllerHooks>, backoff: BackoffConfig, alert_after: Option<u32>) -> Self {
        Self {
            transport,
            hooks,
            backoff: Backoff::new(backoff),
            machine: ConnectionMachine::new(),
            alert_after,
            failures: 0,
            lost: AlertLatch::new(),
            auth: AlertLatch::new(),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drive the transport until it is closed. Never gives up on its own.
    pub async fn run(mut self) {
        let url = self.transport.url().to_string();
        let mut state_rx = self.transport.watch_state();

        loop {
            let recovering = self.machine.state() == ConnectionState::Reconnecting;
            if self.machine.state() == ConnectionState::Idle {
                self.advance(ConnectionState::Connecting);
            }
            if recovering {
                self.hooks.before_reconnect(&self.transport);
            }

            match self.transport.connect().await {
                Ok(()) => {
                    self.advance(ConnectionState::Open);
                    self.on_opened(&url, recovering).await;

                    let next = match state_rx.wait_for(|state| *state != ConnectionState::Open).await {
                        Ok(state) => *state,
                        Err(_) => ConnectionState::Closed,
                    };
                    if next == ConnectionState::Closed {
                        break;
                    }
                    self.advance(ConnectionState::Degraded);
                }
                Err(WsError::Closed) => break,
                Err(err) => {
                    self.on_failed(&url, &err);
                    self.advance(ConnectionState::Degraded);
                }
            }

            let delay = self.backoff.next_delay();
            debug!("Reconnecting to {url} in {delay:?} (attempt {})", self.backoff.attempt());
            let closed = async {
                let _ = state_rx.wait_for(|state| *state == ConnectionState::Closed).await;
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = closed => break,
            }

            if !self.transport.mark_reconnecting() {
                break;
            }
            self.advance(ConnectionState::Reconnecting);
        }

        self.advance(ConnectionState::Closed);
        self.hooks.on_closed(&self.transport);
        debug!("Controller for {url} stopped");
    }

    async fn on_opened(&mut self, url: &str, recovering: bool) {
        if recovering {
            info!("Reconnected to {url} after {} attempts", self.backoff.attempt());
        }
        self.backoff.reset();
        self.failures = 0;
        self.auth.rearm();
        if self.lost.rearm() {
            self.hooks.on_event(SyncEvent::ConnectionRestored { url: url.to_string() });
        }
        self.hooks.on_open(url, recovering).await;
    }

    fn on_failed(&mut self, url: &str, err: &WsError) {
        self.failures = self.failures.saturating_add(1);
        warn!("Connecting to {url} failed (attempt {}): {err}", self.failures);

        if let WsError::Unauthorized { status, .. } = err
            && self.auth.raise()
        {
            self.hooks.on_event(SyncEvent::AuthRejected { url: url.to_string(), status: *status });
        }

        if self.alert_after.is_some_and(|threshold| self.failures >= threshold) && self.lost.raise() {
            self.hooks.on_event(SyncEvent::ConnectionLost { url: url.to_string(), attempts: self.failures });
        }
    }

    fn advance(&mut self, to: ConnectionState) {
        if let Err(err) = self.machine.advance(to) {
            warn!("{}: {err}", self.transport.url());
        }
    }
}

#[cfg(test)]
mod tests {
    use fleet_ws::TransportConfig;
    use fleet_ws::testing::MemoryDialer;
    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn test_backoff_bounds_and_reset() {
        let mut backoff = Backoff::new(BackoffConfig::deterministic(Duration::from_millis(100), Duration::from_secs(1)));
        let delays: Vec<Duration> = (0..8).map(|_| backoff.next_delay()).collect();

        assert_eq!(delays[0], Duration::from_millis(100));
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(1));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent_and_max() {
        let config = BackoffConfig { base_delay: Duration::from_millis(1_000), max_delay: Duration::from_millis(4_000), jitter: 0.2 };
        let mut backoff = Backoff::new(config);
        for attempt in 0..10 {
            let nominal = backoff.nominal_delay(attempt);
            let delay = backoff.next_delay();
            assert!(delay >= nominal.mul_f64(0.8) && delay <= nominal.mul_f64(1.2), "{delay:?} vs {nominal:?}");
            assert!(delay <= Duration::from_millis(4_000));
        }
    }

    #[test]
    fn test_nominal_delay_saturates() {
        let backoff = Backoff::new(BackoffConfig::deterministic(Duration::from_secs(1), Duration::from_secs(30)));
        assert_eq!(backoff.nominal_delay(200), Duration::from_secs(30));
    }

    #[test]
    fn test_machine_rejects_illegal_transitions() {
        let mut machine = ConnectionMachine::new();
        assert!(matches!(machine.advance(ConnectionState::Open), Err(SyncError::IllegalTransition { .. })));
        assert!(machine.advance(ConnectionState::Connecting).unwrap());
        assert!(machine.advance(ConnectionState::Open).unwrap());
        assert!(!machine.advance(ConnectionState::Open).unwrap());
        assert!(matches!(machine.advance(ConnectionState::Reconnecting), Err(SyncError::IllegalTransition { .. })));
        assert!(machine.advance(ConnectionState::Degraded).unwrap());
        assert!(machine.advance(ConnectionState::Reconnecting).unwrap());
        assert!(machine.advance(ConnectionState::Open).unwrap());
        assert!(machine.advance(ConnectionState::Closed).unwrap());
        assert!(matches!(machine.advance(ConnectionState::Connecting), Err(SyncError::IllegalTransition { .. })));
    }

    #[derive(Default)]
    struct Recorder {
        opens: Mutex<Vec<bool>>,
        events: Mutex<Vec<SyncEvent>>,
        closed: Mutex<bool>,
    }

    impl ControllerHooks for Recorder {
        fn on_open(&self, _url: &str, recovered: bool) -> BoxFuture<'static, ()> {
            self.opens.lock().push(recovered);
            Box::pin(async {})
        }

        fn on_event(&self, event: SyncEvent) {
            self.events.lock().push(event);
        }

        fn on_closed(&self, _transport: &Transport) {
            *self.closed.lock() = true;
        }
    }

    const URL: &str = "ws://fleet.test/ws/vehicles/all/42";

    fn controller(dialer: &Arc<MemoryDialer>, hooks: &Arc<Recorder>, alert_after: Option<u32>) -> (Transport, JoinHandle<()>) {
        let transport = Transport::new(URL, dialer.clone(), TransportConfig::default());
        let hooks: Arc<dyn ControllerHooks> = hooks.clone();
        let handle = ReconnectController::new(transport.clone(), hooks, BackoffConfig::aggressive(), alert_after).spawn();
        (transport, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_link_loss() {
        let (dialer, mut accepted) = MemoryDialer::new();
        let hooks = Arc::new(Recorder::default());
        let (transport, handle) = controller(&dialer, &hooks, None);

        let first = accepted.recv().await.unwrap();
        drop(first);
        let _second = accepted.recv().await.unwrap();
        let mut state = transport.watch_state();
        state.wait_for(|state| *state == ConnectionState::Open).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(hooks.opens.lock().clone(), vec![false, true]);
        assert_eq!(dialer.dial_count(URL), 2);

        transport.close();
        handle.await.unwrap();
        assert!(*hooks.closed.lock());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_lost_alert_raised_once_then_restored() {
        let (dialer, mut accepted) = MemoryDialer::new();
        dialer.fail_next_dials(6);
        let hooks = Arc::new(Recorder::default());
        let (transport, handle) = controller(&dialer, &hooks, Some(3));

        let _server = accepted.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(dialer.dial_count(URL), 7);
        assert_eq!(
            hooks.events.lock().clone(),
            vec![SyncEvent::ConnectionLost { url: URL.to_string(), attempts: 3 }, SyncEvent::ConnectionRestored { url: URL.to_string() }]
        );

        transport.close();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejection_reported_once_and_retrying_continues() {
        let (dialer, _accepted) = MemoryDialer::new();
        dialer.reject_auth(true);
        let hooks = Arc::new(Recorder::default());
        let (transport, handle) = controller(&dialer, &hooks, None);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(dialer.dial_count(URL) > 3);
        let auth_events = hooks.events.lock().iter().filter(|event| matches!(event, SyncEvent::AuthRejected { status: 401, .. })).count();
        assert_eq!(auth_events, 1);

        transport.close();
        handle.await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Closed);
    }
}
