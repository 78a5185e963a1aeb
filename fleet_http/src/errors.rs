use fleet_types::TypesError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Circuit breaker open")]
    CircuitOpen,

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid snapshot entity: {0}")]
    Entity(#[from] TypesError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Unauthorized (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("API error: HTTP {status} - {message}")]
    Status { status: u16, message: String },

    #[error("Session storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("No session token")]
    NoSession,
}

impl ApiError {
    /// Rejections that a fresh login or token refresh could fix
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. } | ApiError::NoSession)
    }

    /// Failures worth counting against the circuit breaker
    pub fn is_server_side(&self) -> bool {
        match self {
            ApiError::Request(_) | ApiError::InvalidResponse(_) => true,
            ApiError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
