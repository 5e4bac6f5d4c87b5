//! Session error types
//!
//! Errors raised by the codec, the transport seam and the public session API.

use std::time::Duration;
use thiserror::Error;

/// Errors produced while encoding or decoding wire frames
#[derive(Error, Debug)]
pub enum CodecError {
    /// Input was not valid JSON
    #[error("Malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Valid JSON, but not an object
    #[error("Frame is not a JSON object")]
    NotAnObject,

    /// Object without a string `type` discriminator
    #[error("Frame is missing a string `type` field")]
    MissingType,

    /// Known frame type whose fields do not match the protocol
    #[error("Invalid `{kind}` frame: {source}")]
    InvalidFrame {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    /// Outgoing command could not be serialized
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors raised by a [`Connector`](super::transport::Connector) or an open link
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection timeout ({0:?})")]
    Timeout(Duration),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Connection closed")]
    Closed,
}

/// Errors surfaced by the public [`Session`](super::Session) API
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid session configuration: {0}")]
    Config(String),

    #[error("Invalid endpoint: {0}")]
    Endpoint(String),

    /// The background session task has exited
    #[error("Session task is not running")]
    TaskGone,
}

impl From<url::ParseError> for SessionError {
    fn from(err: url::ParseError) -> Self {
        SessionError::Endpoint(err.to_string())
    }
}

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;
