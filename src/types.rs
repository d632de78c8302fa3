//! Basic type definitions for the chat relay
//!
//! Provides the two views of a participant's identity:
//! - `Identity`: the relay's view, keyed by the peer's IPv4 address
//! - `ChatUser`: the client's view, keyed by the id the relay assigned
//!
//! Both are keyed by a `ChatId`, the big-endian packing of an IPv4 address.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use crate::error::ChatError;

/// Chat identifier (newtype over the 32 bits of an IPv4 address)
///
/// Identity and address are interconvertible: the relay hands out
/// `ChatId::from(addr)` and routes messages with `ChatId::addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatId(pub u32);

impl ChatId {
    /// Recover the IPv4 address, most significant byte first
    pub fn addr(self) -> Ipv4Addr {
        Ipv4Addr::from(self.0.to_be_bytes())
    }
}

impl From<Ipv4Addr> for ChatId {
    fn from(addr: Ipv4Addr) -> Self {
        Self(u32::from_be_bytes(addr.octets()))
    }
}

/// Wire form: the same 32 bits as a signed decimal integer
impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 as i32)
    }
}

impl FromStr for ChatId {
    type Err = ChatError;

    /// Parses signed decimal, or the unsigned form of the same 32 bits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(id) = s.parse::<u32>() {
            return Ok(Self(id));
        }
        s.parse::<i32>()
            .map(|id| Self(id as u32))
            .map_err(|_| ChatError::InvalidRequest(format!("invalid chat id '{}'", s)))
    }
}

/// A connected party as the relay sees it
///
/// Equality and hashing use the address alone. Two connections from the
/// same address are the same identity, and the later one wins.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Display name, as sent (may contain spaces)
    name: String,
    /// Peer address the chat id is derived from
    addr: Ipv4Addr,
}

impl Identity {
    /// Create an identity for a display name and peer address
    pub fn new(name: impl Into<String>, addr: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            addr,
        }
    }

    /// Lookup key for a chat id; carries no display name
    pub fn from_chat_id(id: ChatId) -> Self {
        Self::new(String::new(), id.addr())
    }

    /// Get the display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the peer address
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Get the chat id, the packed form of the peer address
    pub fn chat_id(&self) -> ChatId {
        ChatId::from(self.addr)
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.chat_id() == other.chat_id()
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.chat_id().hash(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.chat_id())
    }
}

/// Derive the relay identity for a peer that sent CONNECT
///
/// IPv4-mapped IPv6 addresses are unmapped. Other IPv6 peers cannot be
/// expressed as a `ChatId` and are rejected.
pub fn derive_identity(name: impl Into<String>, peer: IpAddr) -> Result<Identity, ChatError> {
    let addr = match peer {
        IpAddr::V4(addr) => addr,
        IpAddr::V6(addr) => addr.to_ipv4_mapped().ok_or_else(|| {
            ChatError::InvalidRequest(format!("IPv6 peer {} is not supported", addr))
        })?,
    };
    Ok(Identity::new(name, addr))
}

/// A remote participant as the client session sees it
///
/// Equality and hashing use the id alone.
#[derive(Debug, Clone)]
pub struct ChatUser {
    /// Id assigned by the relay
    pub id: ChatId,
    /// Display name
    pub name: String,
}

impl ChatUser {
    /// Create a user entry from a relay frame
    pub fn new(id: ChatId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl PartialEq for ChatUser {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ChatUser {}

impl Hash for ChatUser {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
