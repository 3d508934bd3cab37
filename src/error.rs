//! Error types for the oauth proxy

use std::io;

use thiserror::Error;

/// Result type alias for the oauth proxy
pub type Result<T> = std::result::Result<T, Error>;

/// Oauth proxy errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration or settings error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Secrets file error
    #[error("Secrets error: {0}")]
    Secrets(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
