//! Relay connection handler
//!
//! Drives one accepted connection through the relay protocol:
//! `AwaitingConnect → Active → Closed`. Every error stays inside this
//! connection; the channel is always closed on the way out.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channel::LineChannel;
use crate::error::ChatError;
use crate::protocol::{self, MessageFrame, Request};
use crate::server::ChatRelay;
use crate::types::{derive_identity, Identity};

/// Per-connection protocol state
#[derive(Debug)]
enum ConnectionState {
    AwaitingConnect,
    Active(Identity),
    Closed,
}

/// Handle a connection until it closes
///
/// Returns the error that aborted the connection, if any. LOGOUT and a
/// peer that hangs up after the handshake both end with `Ok`.
pub async fn handle_connection(
    channel: Arc<LineChannel>,
    peer: SocketAddr,
    relay: Arc<ChatRelay>,
) -> Result<(), ChatError> {
    let result = drive(&channel, peer, &relay).await;
    channel.close().await;

    match result {
        Err(ChatError::Closed) => {
            info!("Connection from {} closed by peer", peer);
            Ok(())
        }
        other => other,
    }
}

async fn drive(
    channel: &Arc<LineChannel>,
    peer: SocketAddr,
    relay: &ChatRelay,
) -> Result<(), ChatError> {
    let mut state = ConnectionState::AwaitingConnect;

    loop {
        state = match state {
            ConnectionState::AwaitingConnect => match handshake(channel, peer, relay).await {
                Ok(identity) => ConnectionState::Active(identity),
                Err(e) => {
                    if let ChatError::InvalidRequest(reason) = &e {
                        reject(channel, reason).await;
                    }
                    return Err(e);
                }
            },
            ConnectionState::Active(identity) => {
                if handle_request(channel, &identity, relay).await? {
                    ConnectionState::Active(identity)
                } else {
                    ConnectionState::Closed
                }
            }
            ConnectionState::Closed => return Ok(()),
        };
    }
}

/// Read CONNECT + display name, announce and register the new identity
async fn handshake(
    channel: &Arc<LineChannel>,
    peer: SocketAddr,
    relay: &ChatRelay,
) -> Result<Identity, ChatError> {
    let header = channel.read_line().await?;
    if Request::from_header(&header) != Some(Request::Connect) {
        return Err(ChatError::InvalidRequest(format!(
            "expected CONNECT as the first request, got '{}'",
            header
        )));
    }

    let username = channel.read_line().await?;
    let identity = derive_identity(username, peer.ip())?;

    // Announce before registering so the newcomer is not told about itself
    relay.broadcast_user_connected(&identity).await;

    // No other handler can write to this channel until it is registered,
    // so CONNECTION_SUCCESS is always the newcomer's first frame
    channel
        .write_lines(protocol::connection_success(identity.chat_id()))
        .await?;
    relay.register(identity.clone(), channel);

    info!("Client {} connected from {}", identity, peer);
    Ok(identity)
}

/// Best-effort CONNECTION_FAILED before the connection is dropped
async fn reject(channel: &LineChannel, reason: &str) {
    if let Err(e) = channel.write_lines(protocol::connection_failed(reason)).await {
        debug!("Could not send CONNECTION_FAILED: {}", e);
    }
}

/// Process one request; returns false once the connection is done
async fn handle_request(
    channel: &LineChannel,
    identity: &Identity,
    relay: &ChatRelay,
) -> Result<bool, ChatError> {
    let header = channel.read_line().await?;

    match Request::from_header(&header) {
        Some(Request::Logout) => {
            info!("Client {} logged out", identity);
            channel.close().await;
            Ok(false)
        }
        Some(Request::Message) => {
            let frame = read_message(channel).await?;
            match relay.forward(identity, &frame).await {
                Ok(()) => {}
                Err(ChatError::UnknownRecipient(target)) => {
                    warn!(
                        "Dropping message from {}: id {} is not connected",
                        identity, target
                    );
                }
                Err(e) => {
                    warn!(
                        "Failed to forward message from {} to {}: {}",
                        identity, frame.target, e
                    );
                }
            }
            Ok(true)
        }
        Some(Request::ConnectedUsers) => {
            channel.write_lines(relay.connected_users()).await?;
            Ok(true)
        }
        _ => Err(ChatError::InvalidRequest(format!(
            "'{}' is not a valid request header",
            header
        ))),
    }
}

/// Read the four lines following a MESSAGE header
async fn read_message(channel: &LineChannel) -> Result<MessageFrame, ChatError> {
    let target = channel.read_line().await?;
    let begin = channel.read_line().await?;
    let body = channel.read_line().await?;
    let end = channel.read_line().await?;

    MessageFrame::parse(target, begin, body, end)
}
