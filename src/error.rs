//! Error types for Parley

use thiserror::Error;

/// Result type alias for Parley operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Parley
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device, capture or encoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// Byte stream read failure during playback
    #[error("stream error: {0}")]
    Stream(String),

    /// Chat endpoint rejected the request
    #[error("chat endpoint returned {status}: {message}")]
    Chat {
        /// HTTP status code
        status: u16,
        /// Error message reported by the endpoint
        message: String,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
