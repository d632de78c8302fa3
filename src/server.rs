//! Relay core
//!
//! Owns the client registry and implements the three relay operations
//! the connection handlers drive: register, broadcast on connect, and
//! forward by chat id.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channel::LineChannel;
use crate::error::ChatError;
use crate::protocol::{self, MessageFrame};
use crate::registry::ClientRegistry;
use crate::types::Identity;

/// Shared relay state
///
/// Cheap to share behind an `Arc`; every handler task holds one.
#[derive(Debug, Default)]
pub struct ChatRelay {
    registry: Arc<ClientRegistry>,
}

impl ChatRelay {
    /// Create a relay with an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the client registry
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Register a handshaken identity
    ///
    /// The channel's close hook removes the entry again, unless a later
    /// connection from the same address has taken it over.
    pub fn register(&self, identity: Identity, channel: &Arc<LineChannel>) {
        if let Some(previous) = self.registry.put(identity.clone(), Arc::clone(channel)) {
            warn!(
                "Identity {} replaces {} registered from the same address",
                identity,
                previous.identity
            );
        }

        let registry = Arc::clone(&self.registry);
        let owner = Arc::downgrade(channel);
        let key = identity.clone();
        channel.set_on_close(move || {
            if let Some(channel) = owner.upgrade() {
                if registry.remove_channel(&key, &channel) {
                    debug!("Removed {} from registry", key);
                }
            }
        });

        info!(
            "Registered {} (total clients: {})",
            identity,
            self.registry.len()
        );
    }

    /// Tell every registered client that `identity` connected
    ///
    /// Closed channels found during the sweep are dropped from the
    /// registry. A failed write is logged and the sweep continues.
    pub async fn broadcast_user_connected(&self, identity: &Identity) {
        let frame = protocol::user_connected(identity);

        for client in self.registry.snapshot() {
            if client.channel.is_closed() {
                self.registry.remove_channel(&client.identity, &client.channel);
                debug!("Dropped closed channel of {} during broadcast", client.identity);
                continue;
            }

            if let Err(e) = client.send(&frame).await {
                warn!(
                    "Failed to notify {} about {}: {}",
                    client.identity, identity, e
                );
            }
        }
    }

    /// Forward a MESSAGE frame from `sender` to the frame's target
    ///
    /// Returns `UnknownRecipient` when nothing is registered for the
    /// target id; the caller drops the message.
    pub async fn forward(&self, sender: &Identity, frame: &MessageFrame) -> Result<(), ChatError> {
        let target = Identity::from_chat_id(frame.target);
        let Some(channel) = self.registry.get(&target) else {
            return Err(ChatError::UnknownRecipient(frame.target));
        };

        debug!("Forwarding message from {} to {}", sender, frame.target);
        channel.write_lines(frame.forward_lines(sender.chat_id())).await
    }

    /// The CONNECTED_USERS frame for the current registry contents
    pub fn connected_users(&self) -> Vec<String> {
        let identities = self.registry.snapshot_identities();
        protocol::connected_users(&identities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};

    use crate::types::ChatId;

    fn connection() -> (Arc<LineChannel>, Lines<BufReader<DuplexStream>>) {
        let (local, remote) = tokio::io::duplex(4096);
        (
            Arc::new(LineChannel::new(Box::new(local))),
            BufReader::new(remote).lines(),
        )
    }

    async fn next(lines: &mut Lines<BufReader<DuplexStream>>) -> String {
        lines.next_line().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_register_and_close_hook() {
        let relay = ChatRelay::new();
        let (channel, _remote) = connection();
        let alice = Identity::new("Alice", Ipv4Addr::new(10, 0, 0, 1));

        relay.register(alice.clone(), &channel);
        assert!(relay.registry().contains(&alice));

        channel.close().await;
        assert!(!relay.registry().contains(&alice));
    }

    #[tokio::test]
    async fn test_stale_close_keeps_successor() {
        let relay = ChatRelay::new();
        let (first, _r1) = connection();
        let (second, _r2) = connection();
        let addr = Ipv4Addr::new(10, 0, 0, 1);

        relay.register(Identity::new("Alice", addr), &first);
        relay.register(Identity::new("Alice again", addr), &second);

        first.close().await;
        let current = relay.registry().get(&Identity::new("", addr)).unwrap();
        assert!(Arc::ptr_eq(&current, &second));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_registered_clients() {
        let relay = ChatRelay::new();
        let (alice_ch, mut alice_rx) = connection();
        let (bob_ch, mut bob_rx) = connection();
        relay.register(Identity::new("Alice", Ipv4Addr::new(10, 0, 0, 1)), &alice_ch);
        relay.register(Identity::new("Bob", Ipv4Addr::new(10, 0, 0, 2)), &bob_ch);

        let carol = Identity::new("Carol", Ipv4Addr::new(10, 0, 0, 3));
        relay.broadcast_user_connected(&carol).await;

        for rx in [&mut alice_rx, &mut bob_rx] {
            assert_eq!(next(rx).await, "USER_CONNECTED");
            assert_eq!(next(rx).await, carol.chat_id().to_string());
            assert_eq!(next(rx).await, "Carol");
        }
    }

    #[tokio::test]
    async fn test_broadcast_prunes_closed_channels() {
        let relay = ChatRelay::new();
        let (open_ch, mut open_rx) = connection();
        let (dead_ch, _dead_rx) = connection();
        let dead = Identity::new("Dead", Ipv4Addr::new(10, 0, 0, 9));
        relay.register(Identity::new("Open", Ipv4Addr::new(10, 0, 0, 1)), &open_ch);

        // registered without a hook, as if the hook had raced
        relay.registry().put(dead.clone(), Arc::clone(&dead_ch));
        dead_ch.close().await;
        assert!(relay.registry().contains(&dead));

        relay
            .broadcast_user_connected(&Identity::new("New", Ipv4Addr::new(10, 0, 0, 5)))
            .await;

        assert!(!relay.registry().contains(&dead));
        assert_eq!(next(&mut open_rx).await, "USER_CONNECTED");
    }

    #[tokio::test]
    async fn test_forward_to_registered_target() {
        let relay = ChatRelay::new();
        let (bob_ch, mut bob_rx) = connection();
        let alice = Identity::new("Alice", Ipv4Addr::new(10, 0, 0, 1));
        let bob = Identity::new("Bob", Ipv4Addr::new(10, 0, 0, 2));
        relay.register(bob.clone(), &bob_ch);

        let frame = MessageFrame::parse(
            bob.chat_id().to_string(),
            protocol::BEGIN_MESSAGE.to_string(),
            "aGk=".to_string(),
            protocol::END_MESSAGE.to_string(),
        )
        .unwrap();
        relay.forward(&alice, &frame).await.unwrap();

        assert_eq!(next(&mut bob_rx).await, "MESSAGE");
        assert_eq!(next(&mut bob_rx).await, alice.chat_id().to_string());
        assert_eq!(next(&mut bob_rx).await, bob.chat_id().to_string());
        assert_eq!(next(&mut bob_rx).await, protocol::BEGIN_MESSAGE);
        assert_eq!(next(&mut bob_rx).await, "aGk=");
        assert_eq!(next(&mut bob_rx).await, protocol::END_MESSAGE);
    }

    #[tokio::test]
    async fn test_forward_to_unknown_target() {
        let relay = ChatRelay::new();
        let frame =
            MessageFrame::parse("1".to_string(), String::new(), String::new(), String::new())
                .unwrap();
        let sender = Identity::new("Alice", Ipv4Addr::new(10, 0, 0, 1));
        assert!(matches!(
            relay.forward(&sender, &frame).await,
            Err(ChatError::UnknownRecipient(ChatId(1)))
        ));
    }

    #[tokio::test]
    async fn test_connected_users_lists_registry() {
        let relay = ChatRelay::new();
        let (ch, _rx) = connection();
        relay.register(Identity::new("Alice", Ipv4Addr::new(127, 0, 0, 2)), &ch);

        assert_eq!(
            relay.connected_users(),
            vec![
                "CONNECTED_USERS",
                protocol::BEGIN_LIST,
                "2130706434:Alice",
                protocol::END_LIST
            ]
        );
    }
}
