use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Lifecycle of one transport endpoint as seen by consumers.
///
/// `Closed` is terminal and only reached through an explicit teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Degraded,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }

    /// True while the link is down but the client is still trying to recover it
    pub fn is_recovering(self) -> bool {
        matches!(self, ConnectionState::Degraded | ConnectionState::Reconnecting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
