//! Error types for trackrelay

use axum::http::StatusCode;
use thiserror::Error;

/// Errors that reach the wire as the protocol's XML error envelope.
///
/// The graceful degradations (timestamp sentinel, session resolution
/// fallback, mirror write failure) never construct one of these; they are
/// logged and the request continues.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Bad or missing Basic credentials
    #[error("Authorization failed")]
    Unauthorized,

    /// The credential file could not be loaded
    #[error("user file missing: {0}")]
    ConfigurationMissing(String),

    /// Wrong path, duplicate field, or a missing required field
    #[error("{0}")]
    MalformedRequest(String),

    /// Declared command outside the protocol surface
    #[error("Unknown request {0}")]
    UnknownCommand(String),

    /// Point batch did not decode
    #[error("{0}")]
    MalformedPointBatch(String),

    /// The authoritative destination rejected a write
    #[error("storage failed: {0}")]
    Destination(String),
}

impl ProtocolError {
    /// HTTP status carried alongside the XML error body.
    pub fn status(&self) -> StatusCode {
        match self {
            ProtocolError::Unauthorized | ProtocolError::ConfigurationMissing(_) => {
                StatusCode::UNAUTHORIZED
            }
            ProtocolError::MalformedRequest(_)
            | ProtocolError::UnknownCommand(_)
            | ProtocolError::MalformedPointBatch(_) => StatusCode::BAD_REQUEST,
            ProtocolError::Destination(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Setup and process-level error type
#[derive(Error, Debug)]
pub enum CoreError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Server error
    #[error("Server error: {0}")]
    Server(String),
}

/// Result type alias for setup operations
pub type Result<T> = std::result::Result<T, CoreError>;
