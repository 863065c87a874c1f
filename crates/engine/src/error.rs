//! Error taxonomy for the exchange connectivity layer

use persistence::DbError;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum EngineError {
    /// A credential field is missing or malformed; the user must fix the input
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Handshake or streaming failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Ticker fetch failure; the caller may retry on the next tick
    #[error("Market data fetch failed: {0}")]
    Fetch(String),

    #[error("Unsupported exchange: {0}")]
    UnsupportedExchange(String),

    #[error("Credential set not found: {0}")]
    NotFound(String),

    #[error("Credential storage error: {0}")]
    Storage(#[from] DbError),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later can succeed without user input
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Fetch(_))
    }

    pub(crate) fn connection(err: TransportError) -> Self {
        Self::Connection(err.to_string())
    }

    pub(crate) fn fetch(err: TransportError) -> Self {
        Self::Fetch(err.to_string())
    }
}
