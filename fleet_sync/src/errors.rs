use fleet_http::ApiError;
use fleet_types::ConnectionState;
use fleet_types::TypesError;
use fleet_ws::WsError;
use thiserror::Error;

use crate::registry::SubscriptionId;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Invalid topic: {0}")]
    Topic(#[from] TypesError),

    #[error("Transport error: {0}")]
    Transport(#[from] WsError),

    #[error("Snapshot fetch failed: {0}")]
    Api(#[from] ApiError),

    #[error("Snapshot fetch failed: {0}")]
    Fetch(String),

    #[error("Illegal connection transition {from} -> {to}")]
    IllegalTransition { from: ConnectionState, to: ConnectionState },

    #[error("Unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("Sync client has been torn down")]
    Closed,
}

impl SyncError {
    pub fn is_auth(&self) -> bool {
        match self {
            SyncError::Transport(err) => err.is_auth(),
            SyncError::Api(err) => err.is_auth(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
