//! Error types for the chat relay
//!
//! A single taxonomy shared by the relay and the client session.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

use crate::types::ChatId;

/// Relay and session errors
///
/// Per-connection errors never leave their connection: the relay logs
/// them and closes the channel, the session reports them as events.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Protocol violation (unexpected header, malformed handshake or id)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Stream failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No line arrived within the read deadline
    #[error("Read timed out")]
    Timeout,

    /// The channel was closed, locally or by the peer
    #[error("Channel closed")]
    Closed,

    /// Session operation attempted after termination was requested
    #[error("Session interrupted")]
    SessionInterrupted,

    /// Session operation attempted before a connection exists
    #[error("Session not connected")]
    NotConnected,

    /// Forward target is not registered
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(ChatId),

    /// Message body is not valid base64-encoded UTF-8
    #[error("Invalid message payload")]
    InvalidPayload,

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    /// Bad configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<LinesCodecError> for ChatError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => {
                ChatError::InvalidRequest("line exceeds maximum length".to_string())
            }
            LinesCodecError::Io(e) => ChatError::Io(e),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ChatError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ChatError::Timeout
    }
}
