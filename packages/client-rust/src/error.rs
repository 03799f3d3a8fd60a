//! Client error types and the error-channel event.

use serde_json::Value;
use syncwire_core::{PathError, Topic, VersionError};
use thiserror::Error;

/// Errors surfaced by the public client API.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A caller supplied an argument the API cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The record was destroyed; no further operations succeed on it.
    #[error("record `{0}` has been destroyed")]
    RecordDestroyed(String),

    /// A path descended through a primitive value.
    #[error(transparent)]
    Path(#[from] PathError),

    /// A version token on the wire could not be parsed.
    #[error(transparent)]
    Version(#[from] VersionError),

    /// The connection reached a terminal state and will not reconnect.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The server rejected the supplied credentials.
    #[error("authentication failed: {reason}")]
    AuthenticationFailed {
        /// Event code reported by the server.
        reason: String,
        /// Optional typed payload accompanying the rejection.
        data: Option<Value>,
    },

    /// A listener for this pattern is already registered.
    #[error("already listening to pattern `{0}`")]
    ListenerExists(String),

    /// No listener is registered for this pattern.
    #[error("not listening to pattern `{0}`")]
    NotListening(String),

    /// The client has been dropped and its background tasks have exited.
    #[error("client has been stopped")]
    Stopped,
}

/// Errors raised by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The endpoint URL could not be normalized.
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl {
        /// The offending URL as supplied.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The endpoint could not be connected.
    #[error("connect failed: {0}")]
    Connect(String),
}

/// An entry on the client error channel: `(topic, event code, message)`.
///
/// The event code is kept as a string so server-side codes this crate does
/// not know about still reach the application intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub topic: Topic,
    pub event: String,
    pub message: String,
}
