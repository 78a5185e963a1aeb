//! In-memory dialer: every successful dial hands the server side of the link to the test.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rapidhash::RapidHashMap;
use tokio::sync::mpsc;

use crate::dialer::Dialer;
use crate::dialer::Link;
use crate::errors::Result;
use crate::errors::WsError;
use crate::frame::Frame;

const LINK_CAPACITY: usize = 256;

/// Server side of an in-memory link. Dropping it closes the link from the server.
pub struct ServerEnd {
    pub url: String,
    to_client: mpsc::Sender<Frame>,
    from_client: mpsc::Receiver<Frame>,
}

impl ServerEnd {
    pub async fn send(&self, frame: Frame) {
        let _ = self.to_client.send(frame).await;
    }

    pub async fn send_text(&self, text: &str) {
        self.send(Frame::text(text)).await;
    }

    /// Next frame sent by the client, `None` once the client closed its side
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.from_client.try_recv().ok()
    }
}

#[derive(Default)]
pub struct MemoryDialer {
    accepted: Mutex<Option<mpsc::UnboundedSender<ServerEnd>>>,
    dials: Mutex<RapidHashMap<String, usize>>,
    failures_left: AtomicUsize,
    reject_auth: AtomicBool,
    hang: AtomicBool,
}

impl MemoryDialer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = Self { accepted: Mutex::new(Some(tx)), ..Default::default() };
        (Arc::new(dialer), rx)
    }

    /// Refuse the next `count` dials
    pub fn fail_next_dials(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Reject every dial as an unauthorised handshake until turned off
    pub fn reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Make dials never complete, to exercise open timeouts
    pub fn hang_dials(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Number of dial attempts made to `url`, successful or not
    pub fn dial_count(&self, url: &str) -> usize {
        self.dials.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_dials(&self) -> usize {
        self.dials.lock().values().sum()
    }

    fn try_dial(&self, url: &str) -> Result<Link> {
        *self.dials.lock().entry(url.to_string()).or_insert(0) += 1;

        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(WsError::Unauthorized { url: url.to_string(), status: 401 });
        }
        let refused = self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1)).is_ok();
        if refused {
            return Err(WsError::Refused { url: url.to_string(), reason: "connection refused".to_string() });
        }

        let (to_client, inbound) = mpsc::channel(LINK_CAPACITY);
        let (outbound, from_client) = mpsc::channel(LINK_CAPACITY);
        let server = ServerEnd { url: url.to_string(), to_client, from_client };
        if let Some(accepted) = self.accepted.lock().as_ref() {
            let _ = accepted.send(server);
        }

        Ok(Link { outbound, inbound })
    }
}

impl Dialer for MemoryDialer {
    fn dial(&self, url: &str) -> BoxFuture<'static, Result<Link>> {
        if self.hang.load(Ordering::SeqCst) {
            *self.dials.lock().entry(url.to_string()).or_insert(0) += 1;
            return Box::pin(futures::future::pending());
        }
        let outcome = self.try_dial(url);
        Box::pin(async move { outcome })
    }
}
