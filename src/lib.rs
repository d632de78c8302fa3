//! Line-oriented Chat Relay Library
//!
//! A minimal real-time text chat: clients hold one persistent TCP (or
//! TLS) connection to a central relay, introduce themselves with a
//! display name, and exchange short messages addressed by chat id.
//! Nothing is persisted.
//!
//! # Architecture
//! - `Acceptor` accepts connections and dispatches each to its own task
//! - `handle_connection` runs the per-connection protocol state machine
//! - `ChatRelay` owns the `ClientRegistry` and broadcasts / forwards
//! - `LineChannel` frames every stream into lines and serializes writers
//! - `ChatSession` is the client side: one worker task, events out,
//!   requests in
//!
//! A chat id is the 32-bit big-endian form of the client's IPv4 address,
//! which is why the relay can route by id without a lookup table.
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use chat_relay::{Acceptor, ChatRelay, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), chat_relay::ChatError> {
//!     let relay = Arc::new(ChatRelay::new());
//!     let acceptor = Acceptor::bind(&RelayConfig::default(), relay).await?;
//!     acceptor.run().await;
//!     Ok(())
//! }
//! ```

pub mod acceptor;
pub mod channel;
pub mod cli;
pub mod client;
pub mod config;
pub mod console;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod tls;
pub mod types;

// Re-export main types for convenience
pub use acceptor::{Acceptor, Bounded, Dispatcher, Unbounded};
pub use channel::{decode_payload, encode_payload, BoxedStream, LineChannel};
pub use client::Client;
pub use config::{RelayConfig, SessionConfig, TlsFiles};
pub use error::ChatError;
pub use handler::handle_connection;
pub use registry::ClientRegistry;
pub use server::ChatRelay;
pub use session::{ChatSession, SessionEvent, SessionState};
pub use types::{derive_identity, ChatId, ChatUser, Identity};
