use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Per-transport counters, updated from the read loop and the connect path
#[derive(Debug, Default)]
pub struct TransportStats {
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    connects: AtomicU64,
    disconnects: AtomicU64,
    dial_failures: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    pub frames_received: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub connects: u64,
    pub disconnects: u64,
    pub dial_failures: u64,
}

impl TransportStats {
    pub fn record_frame(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self, url: &str) {
        let stats = self.snapshot();
        tracing::info!(
            "[TRANSPORT] {url}: frames={}, bytes={}, sent={}, connects={}, disconnects={}, dial_failures={}",
            stats.frames_received,
            stats.bytes_received,
            stats.frames_sent,
            stats.connects,
            stats.disconnects,
            stats.dial_failures
        );
    }
}
