//! Error taxonomy shared by every component.
//!
//! Every variant carries a human-readable message. `kind()` is the stable
//! identifier written on the command boundary.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KafdeskError {
    /// Broker unreachable, handshake failure, dropped connection
    #[error("connection error: {0}")]
    Connection(String),

    /// Broker reachable but credentials rejected
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Validation(String),

    /// Operation not allowed in the current session state
    #[error("invalid state: {0}")]
    State(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// Local persistence failure (connection store / secure store)
    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, KafdeskError>;

impl KafdeskError {
    pub fn kind(&self) -> &'static str {
        match self {
            KafdeskError::Connection(_) => "CONNECTION",
            KafdeskError::Authentication(_) => "AUTHENTICATION",
            KafdeskError::NotFound(_) => "NOT_FOUND",
            KafdeskError::Validation(_) => "VALIDATION",
            KafdeskError::State(_) => "STATE",
            KafdeskError::Timeout(_) => "TIMEOUT",
            KafdeskError::Storage(_) => "STORAGE",
            KafdeskError::Unknown(_) => "UNKNOWN",
        }
    }

    pub fn not_found(what: &str, id: &str) -> Self {
        KafdeskError::NotFound(format!("{} '{}' does not exist", what, id))
    }

    /// Best-effort classification of a raw client-library message.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("authentication") || lower.contains("sasl") || lower.contains("invalid credentials") {
            KafdeskError::Authentication(message)
        } else if lower.contains("timed out") || lower.contains("timeout") {
            KafdeskError::Timeout(message)
        } else if lower.contains("unknown topic") || lower.contains("unknown partition") || lower.contains("does not exist") {
            KafdeskError::NotFound(message)
        } else if lower.contains("connect") || lower.contains("broker transport") || lower.contains("all brokers down") {
            KafdeskError::Connection(message)
        } else if message.is_empty() {
            KafdeskError::Unknown("unknown error".to_string())
        } else {
            KafdeskError::Unknown(message)
        }
    }
}

impl From<rusqlite::Error> for KafdeskError {
    fn from(error: rusqlite::Error) -> Self {
        KafdeskError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for KafdeskError {
    fn from(error: serde_json::Error) -> Self {
        KafdeskError::Storage(error.to_string())
    }
}

impl From<std::io::Error> for KafdeskError {
    fn from(error: std::io::Error) -> Self {
        KafdeskError::Storage(error.to_string())
    }
}
