use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use fleet_types::Topic;

/// User-facing conditions surfaced through [`crate::SyncClient::events`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The server refused the connection's credentials. Retrying continues; a new token may fix it.
    AuthRejected { url: String, status: u16 },
    /// Reconnecting has failed `attempts` times in a row
    ConnectionLost { url: String, attempts: u32 },
    /// An endpoint that raised `ConnectionLost` is open again
    ConnectionRestored { url: String },
    /// A snapshot fetch for a live channel failed; the channel keeps its last state and stays subscribed
    SnapshotFailed { topic: Topic, error: String },
}

/// Fires once per episode: `raise` returns true only on the first call until `rearm`
#[derive(Debug, Default)]
pub struct AlertLatch {
    raised: AtomicBool,
}

impl AlertLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) -> bool {
        !self.raised.swap(true, Ordering::AcqRel)
    }

    /// Returns true if the latch had been raised
    pub fn rearm(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_fires_once_per_episode() {
        let latch = AlertLatch::new();
        assert!(latch.raise());
        assert!(!latch.raise());
        assert!(latch.is_raised());

        assert!(latch.rearm());
        assert!(!latch.rearm());
        assert!(latch.raise());
    }
}
