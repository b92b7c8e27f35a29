//! Error types for ridesync wire types.

use thiserror::Error;

/// Errors that can occur while decoding or validating wire payloads.
#[derive(Debug, Error)]
pub enum TypesError {
    /// JSON serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    /// JSON deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// Payload decoded but is missing data the receiver needs
    #[error("invalid data: {0}")]
    InvalidData(String),
}
