//! Connection acceptor
//!
//! Accepts inbound connections and hands each one to a [`Dispatcher`],
//! which decides how the per-connection work is scheduled. The accept
//! loop never waits on a handshake.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::channel::{BoxedStream, LineChannel};
use crate::config::RelayConfig;
use crate::error::ChatError;
use crate::handler::handle_connection;
use crate::server::ChatRelay;
use crate::tls;

/// Schedules per-connection work
pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// One task per connection, no limit
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbounded;

impl Dispatcher for Unbounded {
    fn dispatch<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(task);
    }
}

/// One task per connection, at most `limit` running at once
///
/// Connections over the limit are accepted but wait for a slot before
/// their handshake starts.
#[derive(Debug, Clone)]
pub struct Bounded {
    slots: Arc<Semaphore>,
}

impl Bounded {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(limit.max(1))),
        }
    }
}

impl Dispatcher for Bounded {
    fn dispatch<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        tokio::spawn(async move {
            let Ok(_slot) = slots.acquire_owned().await else {
                return;
            };
            task.await;
        });
    }
}

/// Listening socket plus everything a connection task needs
pub struct Acceptor<D = Unbounded> {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    relay: Arc<ChatRelay>,
    read_timeout: Duration,
    dispatcher: D,
}

impl Acceptor<Unbounded> {
    /// Bind the listener described by `config`, loading TLS material if set
    pub async fn bind(config: &RelayConfig, relay: Arc<ChatRelay>) -> Result<Self, ChatError> {
        let tls = match &config.tls {
            Some(files) => Some(tls::load_acceptor(&files.cert, &files.key)?),
            None => {
                warn!("Starting relay WITHOUT TLS");
                None
            }
        };
        let listener = TcpListener::bind(config.bind).await?;
        Ok(Self::new(listener, tls, relay, config.read_timeout))
    }

    pub fn new(
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        relay: Arc<ChatRelay>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            tls,
            relay,
            read_timeout,
            dispatcher: Unbounded,
        }
    }
}

impl<D: Dispatcher> Acceptor<D> {
    /// Swap the scheduling strategy
    pub fn with_dispatcher<E: Dispatcher>(self, dispatcher: E) -> Acceptor<E> {
        Acceptor {
            listener: self.listener,
            tls: self.tls,
            relay: self.relay,
            read_timeout: self.read_timeout,
            dispatcher,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept forever
    pub async fn run(self) {
        self.run_until(std::future::pending()).await
    }

    /// Accept until `shutdown` resolves
    ///
    /// Each iteration accepts one connection and dispatches it before
    /// accepting the next.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Relay stopped accepting connections");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("New connection from {}", peer);
                        let task = serve(
                            stream,
                            peer,
                            self.tls.clone(),
                            Arc::clone(&self.relay),
                            self.read_timeout,
                        );
                        self.dispatcher.dispatch(task);
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }
    }
}

/// Per-connection task: optional TLS handshake, then the protocol handler
async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    relay: Arc<ChatRelay>,
    read_timeout: Duration,
) {
    let stream: BoxedStream = match tls {
        Some(acceptor) => {
            match tokio::time::timeout(read_timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => Box::new(tls_stream),
                Ok(Err(e)) => {
                    warn!(
                        "TLS handshake with {} failed: {} (the peer probably connected without TLS)",
                        peer, e
                    );
                    return;
                }
                Err(_) => {
                    warn!("TLS handshake with {} timed out", peer);
                    return;
                }
            }
        }
        None => Box::new(stream),
    };

    let channel = Arc::new(LineChannel::new(stream).with_read_timeout(read_timeout));
    match handle_connection(channel, peer, relay).await {
        Ok(()) => debug!("Connection handler for {} finished", peer),
        Err(ChatError::Timeout) => {
            info!("Connection from {} timed out and was closed", peer)
        }
        Err(e) => warn!("Connection from {} aborted: {}", peer, e),
    }
}
