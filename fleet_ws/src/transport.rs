use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use fleet_types::ConnectionState;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dialer::Dialer;
use crate::dialer::Link;
use crate::errors::Result;
use crate::errors::WsError;
use crate::frame::Frame;
use crate::metrics::TransportStats;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

pub type MessageListener = Arc<dyn Fn(&Frame) + Send + Sync>;
pub type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Give up on a connect attempt after this long and fall into `Degraded`
    pub open_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { open_timeout: Duration::from_secs(10) }
    }
}

/// One duplex connection to one endpoint URL.
///
/// Makes a single attempt per [`Transport::connect`] call and never retries on its own: a lost
/// link moves the transport to `Degraded` and it is up to the reconnection controller to act.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    // Unique per transport, so a re-created transport for the same url is told apart
    id: u64,
    url: String,
    dialer: Arc<dyn Dialer>,
    config: TransportConfig,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    message_listeners: Mutex<Vec<MessageListener>>,
    state_listeners: Mutex<Vec<StateListener>>,
    // Bumped on every new link so a stale reader cannot degrade a fresh connection
    generation: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
    stats: TransportStats,
}

impl Transport {
    pub fn new(url: impl Into<String>, dialer: Arc<dyn Dialer>, config: TransportConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(TransportInner {
                id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
                url: url.into(),
                dialer,
                config,
                state,
                outbound: Mutex::new(None),
                message_listeners: Mutex::new(Vec::new()),
                state_listeners: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
                reader: Mutex::new(None),
                stats: TransportStats::default(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn stats(&self) -> &TransportStats {
        &self.inner.stats
    }

    /// Register a callback for every inbound frame, in delivery order
    pub fn on_message<F>(&self, listener: F)
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.inner.message_listeners.lock().push(Arc::new(listener));
    }

    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.inner.state_listeners.lock().push(Arc::new(listener));
    }

    /// Attempt to open the link once, bounded by the open timeout
    pub async fn connect(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Closed => return Err(WsError::Closed),
            ConnectionState::Open => return Ok(()),
            ConnectionState::Idle => self.set_state(ConnectionState::Connecting),
            _ => {}
        }

        let timeout = self.inner.config.open_timeout;
        let link = match tokio::time::timeout(timeout, self.inner.dialer.dial(&self.inner.url)).await {
            Ok(Ok(link)) => link,
            Ok(Err(err)) => {
                self.inner.stats.record_dial_failure();
                self.set_state_unless_closed(ConnectionState::Degraded);
                return Err(err);
            }
            Err(_) => {
                self.inner.stats.record_dial_failure();
                self.set_state_unless_closed(ConnectionState::Degraded);
                return Err(WsError::Timeout { url: self.inner.url.clone(), timeout_ms: timeout.as_millis() as u64 });
            }
        };

        // Teardown may have raced the dial
        if self.state() == ConnectionState::Closed {
            return Err(WsError::Closed);
        }

        self.attach(link);
        Ok(())
    }

    fn attach(&self, link: Link) {
        let Link { outbound, mut inbound } = link;
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *self.inner.outbound.lock() = Some(outbound);

        let transport = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                transport.deliver(&frame);
            }
            transport.link_lost(generation);
        });

        if let Some(previous) = self.inner.reader.lock().replace(handle) {
            previous.abort();
        }

        self.inner.stats.record_connect();
        self.set_state_unless_closed(ConnectionState::Open);
    }

    fn deliver(&self, frame: &Frame) {
        self.inner.stats.record_frame(frame.len());
        let listeners = self.inner.message_listeners.lock().clone();
        for listener in &listeners {
            listener(frame);
        }
    }

    fn link_lost(&self, generation: u64) {
        if self.inner.generation.load(Ordering::Acquire) != generation {
            return;
        }
        self.inner.outbound.lock().take();
        self.inner.stats.record_disconnect();
        tracing::warn!("Link to {} lost", self.inner.url);
        self.set_state_unless_closed(ConnectionState::Degraded);
    }

    /// Queue a frame on the current link
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let sender = self.inner.outbound.lock().clone().ok_or(WsError::NotConnected)?;
        sender.send(frame).await.map_err(|_| WsError::NotConnected)?;
        self.inner.stats.record_sent();
        Ok(())
    }

    /// Queue a frame without waiting; fails when there is no link or its queue is full
    pub fn try_send(&self, frame: Frame) -> Result<()> {
        let sender = self.inner.outbound.lock().clone().ok_or(WsError::NotConnected)?;
        sender.try_send(frame).map_err(|_| WsError::NotConnected)?;
        self.inner.stats.record_sent();
        Ok(())
    }

    /// Mark a retry as in flight. Only valid while degraded.
    pub fn mark_reconnecting(&self) -> bool {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Degraded {
                *state = ConnectionState::Reconnecting;
                true
            } else {
                false
            }
        });
        if changed {
            self.notify_state(ConnectionState::Reconnecting);
        }
        changed
    }

    /// Tear the link down for good. Terminal: later `connect` calls fail.
    pub fn close(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.inner.outbound.lock().take();
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        self.set_state(ConnectionState::Closed);
    }

    fn set_state_unless_closed(&self, next: ConnectionState) {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            self.notify_state(next);
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            self.notify_state(next);
        }
    }

    fn notify_state(&self, state: ConnectionState) {
        tracing::debug!("{} -> {state}", self.inner.url);
        let listeners = self.inner.state_listeners.lock().clone();
        for listener in &listeners {
            listener(state);
        }
    }
}
