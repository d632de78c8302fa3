//! Client registry
//!
//! Concurrent map from identity to its registered client. Keys are the
//! identity's chat id, which is exactly what `Identity` hashes and
//! compares by, so a second CONNECT from an address overwrites the first.

use std::sync::Arc;

use dashmap::DashMap;

use crate::channel::LineChannel;
use crate::client::Client;
use crate::types::{ChatId, Identity};

/// Thread-safe registry of handshaken clients
///
/// All operations take `&self`; no external lock is needed.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<ChatId, Client>,
}

impl ClientRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite, returning the replaced client
    pub fn put(&self, identity: Identity, channel: Arc<LineChannel>) -> Option<Client> {
        self.clients
            .insert(identity.chat_id(), Client::new(identity, channel))
    }

    /// Remove an identity; absent identities are a no-op
    pub fn remove(&self, identity: &Identity) -> Option<Client> {
        self.clients
            .remove(&identity.chat_id())
            .map(|(_, client)| client)
    }

    /// Remove an identity only while it is still bound to `channel`
    pub fn remove_channel(&self, identity: &Identity, channel: &LineChannel) -> bool {
        self.clients
            .remove_if(&identity.chat_id(), |_, client| client.owns(channel))
            .is_some()
    }

    /// Channel registered for `identity`, if any
    pub fn get(&self, identity: &Identity) -> Option<Arc<LineChannel>> {
        self.get_by_id(identity.chat_id())
    }

    /// Channel registered under `id`, if any
    ///
    /// The channel is cloned out, so no map guard outlives the call.
    pub fn get_by_id(&self, id: ChatId) -> Option<Arc<LineChannel>> {
        self.clients
            .get(&id)
            .map(|client| Arc::clone(&client.channel))
    }

    /// Check if `identity` is currently registered
    pub fn contains(&self, identity: &Identity) -> bool {
        self.clients.contains_key(&identity.chat_id())
    }

    /// Weakly-consistent copy of the registered clients
    ///
    /// Each entry was registered at some point during the call. No map
    /// lock is held once this returns, so callers may write to the
    /// channels or mutate the registry while walking the result.
    pub fn snapshot(&self) -> Vec<Client> {
        self.clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Weakly-consistent copy of the registered identities
    pub fn snapshot_identities(&self) -> Vec<Identity> {
        self.clients
            .iter()
            .map(|entry| entry.value().identity.clone())
            .collect()
    }

    /// Number of registered clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
