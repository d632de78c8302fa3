//! Client struct definition
//!
//! Represents a registered client: the identity it handshook with and
//! the channel frames are delivered on.

use std::sync::Arc;

use crate::channel::LineChannel;
use crate::error::ChatError;
use crate::types::{ChatId, Identity};

/// Registered client information
#[derive(Debug, Clone)]
pub struct Client {
    /// Identity derived at handshake
    pub identity: Identity,
    /// Relay → client line channel
    pub channel: Arc<LineChannel>,
}

impl Client {
    /// Create a client record for a handshaken identity
    pub fn new(identity: Identity, channel: Arc<LineChannel>) -> Self {
        Self { identity, channel }
    }

    /// Send one frame to this client
    pub async fn send<I, S>(&self, lines: I) -> Result<(), ChatError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.channel.write_lines(lines).await
    }

    /// Get the chat id this client is addressed by
    pub fn chat_id(&self) -> ChatId {
        self.identity.chat_id()
    }

    /// Get the display name sent with CONNECT
    pub fn display_name(&self) -> &str {
        self.identity.name()
    }

    /// Whether this record still points at `channel`
    pub fn owns(&self, channel: &LineChannel) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.channel), channel)
    }
}
