//! Error types for Rollcall.

use thiserror::Error;

/// Every failure a Rollcall daemon can observe.
///
/// Only [`RollcallError::Config`] is fatal; the daemon loops recover from
/// the rest locally.
#[derive(Debug, Error)]
pub enum RollcallError {
    /// Unusable configuration, detected at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Due-item store unreachable, timed out, or rejected a statement.
    #[error("Store error: {0}")]
    Store(String),

    /// Broker connect or publish failure.
    #[error("Broker error: {0}")]
    Broker(String),

    /// Wake notification payload that could not be decoded.
    #[error("Malformed wake signal: {0}")]
    MalformedSignal(String),

    /// Dead-lettered message that cannot be sent back to its destination.
    #[error("Republish failed: {0}")]
    Republish(String),

    /// Event construction failed for a claimed row.
    #[error("Event build error: {0}")]
    Event(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RollcallError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Broker(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, RollcallError>;
