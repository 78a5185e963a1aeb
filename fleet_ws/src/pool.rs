use std::sync::Arc;

use parking_lot::Mutex;
use rapidhash::RapidHashMap;

use crate::dialer::Dialer;
use crate::transport::Transport;
use crate::transport::TransportConfig;

/// Shared access to a pooled [`Transport`]
#[derive(Clone)]
pub struct TransportHandle {
    transport: Transport,
}

impl TransportHandle {
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }
}

/// Result of [`TransportPool::open`]
pub struct Opened {
    pub handle: TransportHandle,
    /// True when this call created the transport; the caller is then responsible for driving it
    pub created: bool,
}

struct PoolEntry {
    transport: Transport,
    refs: usize,
}

/// At most one live transport per endpoint URL, reference-counted.
///
/// The subscription registry is the only caller that opens and closes handles.
pub struct TransportPool {
    dialer: Arc<dyn Dialer>,
    config: TransportConfig,
    entries: Mutex<RapidHashMap<String, PoolEntry>>,
}

impl TransportPool {
    pub fn new(dialer: Arc<dyn Dialer>, config: TransportConfig) -> Self {
        Self { dialer, config, entries: Mutex::new(RapidHashMap::default()) }
    }

    /// Attach to the transport for `url`, creating it on first use
    pub fn open(&self, url: &str) -> Opened {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(url) {
            entry.refs += 1;
            return Opened { handle: TransportHandle { transport: entry.transport.clone() }, created: false };
        }

        let transport = Transport::new(url, Arc::clone(&self.dialer), self.config.clone());
        entries.insert(url.to_string(), PoolEntry { transport: transport.clone(), refs: 1 });
        tracing::debug!("Transport created for {url}");
        Opened { handle: TransportHandle { transport }, created: true }
    }

    /// Release one reference; the transport is closed when the last one goes. Returns true if it was closed.
    pub fn close(&self, handle: TransportHandle) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(handle.url()) else {
            return false;
        };

        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return false;
        }

        if let Some(entry) = entries.remove(handle.url()) {
            drop(entries);
            entry.transport.stats().log_summary(entry.transport.url());
            entry.transport.close();
        }
        true
    }

    /// Close every transport regardless of reference counts
    pub fn close_all(&self) {
        let drained: Vec<PoolEntry> = self.entries.lock().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            entry.transport.close();
        }
    }

    pub fn ref_count(&self, url: &str) -> usize {
        self.entries.lock().get(url).map(|entry| entry.refs).unwrap_or(0)
    }

    pub fn live_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn get(&self, url: &str) -> Option<Transport> {
        self.entries.lock().get(url).map(|entry| entry.transport.clone())
    }
}

#[cfg(test)]
mod tests {
    use fleet_types::ConnectionState;

    use super::*;
    use crate::testing::MemoryDialer;

    const URL: &str = "ws://fleet.test/ws/vehicles/all/42";

    #[test]
    fn test_same_url_shares_transport() {
        let (dialer, _accepted) = MemoryDialer::new();
        let pool = TransportPool::new(dialer, TransportConfig::default());

        let first = pool.open(URL);
        let second = pool.open(URL);
        let other = pool.open("ws://fleet.test/declared_routes/ws/routes");

        assert!(first.created);
        assert!(!second.created);
        assert!(other.created);
        assert_eq!(pool.ref_count(URL), 2);
        assert_eq!(pool.live_count(), 2);
    }

    #[test]
    fn test_closes_only_after_last_release() {
        let (dialer, _accepted) = MemoryDialer::new();
        let pool = TransportPool::new(dialer, TransportConfig::default());

        let handles: Vec<TransportHandle> = (0..3).map(|_| pool.open(URL).handle).collect();
        let transport = handles[0].transport().clone();

        let mut closed = Vec::new();
        for handle in handles {
            closed.push(pool.close(handle));
        }

        assert_eq!(closed, vec![false, false, true]);
        assert_eq!(pool.live_count(), 0);
        assert_eq!(transport.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_reopen_after_close_creates_fresh_transport() {
        let (dialer, _accepted) = MemoryDialer::new();
        let pool = TransportPool::new(dialer, TransportConfig::default());

        let handle = pool.open(URL).handle;
        assert!(pool.close(handle));
        let reopened = pool.open(URL);
        assert!(reopened.created);
        assert_eq!(reopened.handle.transport().state(), ConnectionState::Idle);
    }
}
