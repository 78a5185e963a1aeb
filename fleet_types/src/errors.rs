use thiserror::Error;

#[derive(Error, Debug)]
pub enum TypesError {
    #[error("Invalid topic '{0}'")]
    InvalidTopic(String),

    #[error("Unknown topic family '{0}'")]
    UnknownTopicFamily(String),

    #[error("Entity is missing field '{0}'")]
    MissingField(&'static str),

    #[error("Entity field '{field}' has invalid value: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Entity payload must be a JSON object")]
    NotAnObject,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TypesError>;
