use thiserror::Error;

#[derive(Error, Debug)]
pub enum WsError {
    #[error("Failed to connect to {url}: {source}")]
    ConnectFailed { url: String, source: Box<tungstenite::Error> },

    #[error("Connection to {url} refused: {reason}")]
    Refused { url: String, reason: String },

    #[error("Handshake with {url} rejected with HTTP {status}")]
    Unauthorized { url: String, status: u16 },

    #[error("Opening {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("Invalid endpoint URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Transport not connected")]
    NotConnected,

    #[error("Transport closed")]
    Closed,
}

impl WsError {
    /// Auth failures are reported upward instead of being silently retried
    pub fn is_auth(&self) -> bool {
        matches!(self, WsError::Unauthorized { .. })
    }
}

pub type Result<T> = std::result::Result<T, WsError>;
