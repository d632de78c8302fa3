//! Line channel
//!
//! Wraps one byte stream (plain TCP, TLS or an in-memory duplex) with
//! line-oriented reads and writes, an idempotent close, and a single
//! close hook that runs exactly once.

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::debug;

use crate::error::ChatError;

/// Longest accepted line, delimiter excluded
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Any bidirectional stream a channel can own
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

type CloseHook = Box<dyn FnOnce() + Send + 'static>;

/// Buffered line reader/writer over an exclusively owned stream
///
/// Reads and writes are independent directions and may run concurrently.
/// Writers are serialized, so a batch from `write_lines` is never
/// interleaved with another batch on the same channel.
pub struct LineChannel {
    reader: Mutex<FramedRead<ReadHalf<BoxedStream>, LinesCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<BoxedStream>, LinesCodec>>,
    /// Monotonic: only ever goes false → true
    closed: watch::Sender<bool>,
    on_close: parking_lot::Mutex<Option<CloseHook>>,
    read_timeout: Option<Duration>,
}

impl LineChannel {
    /// Wrap `stream`; reads never time out until `with_read_timeout`
    pub fn new(stream: BoxedStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        Self {
            reader: Mutex::new(FramedRead::new(
                read_half,
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            )),
            writer: Mutex::new(FramedWrite::new(write_half, LinesCodec::new())),
            closed,
            on_close: parking_lot::Mutex::new(None),
            read_timeout: None,
        }
    }

    /// Fail `read_line` with `Timeout` when no line arrives in time
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Read one line without its delimiter
    ///
    /// Fails with `Closed` on EOF or when the channel is closed while
    /// waiting, and with `Timeout` if the read deadline elapses.
    pub async fn read_line(&self) -> Result<String, ChatError> {
        let closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(ChatError::Closed);
        }

        let mut reader = self.reader.lock().await;
        let next = async {
            match self.read_timeout {
                Some(deadline) => tokio::time::timeout(deadline, reader.next())
                    .await
                    .map_err(ChatError::from),
                None => Ok(reader.next().await),
            }
        };

        tokio::select! {
            _ = wait_closed(closed) => Err(ChatError::Closed),
            next = next => match next? {
                Some(Ok(line)) => Ok(line),
                Some(Err(e)) => Err(e.into()),
                None => Err(ChatError::Closed),
            },
        }
    }

    /// Write each line followed by the delimiter, flushing once at the end
    pub async fn write_lines<I, S>(&self, lines: I) -> Result<(), ChatError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(ChatError::Closed);
        }

        let mut writer = self.writer.lock().await;
        let write = async {
            for line in lines {
                writer.feed(line.as_ref()).await?;
            }
            SinkExt::<&str>::flush(&mut *writer).await
        };

        tokio::select! {
            _ = wait_closed(closed) => Err(ChatError::Closed),
            written = write => written.map_err(ChatError::from),
        }
    }

    /// Close the channel; only the first call has any effect
    ///
    /// The first call runs the close hook, then shuts the stream down.
    pub async fn close(&self) {
        let hook = {
            let mut slot = self.on_close.lock();
            if self.closed.send_replace(true) {
                return;
            }
            slot.take()
        };

        if let Some(hook) = hook {
            hook();
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.get_mut().shutdown().await {
            debug!("Shutdown after close failed: {}", e);
        }
    }

    /// Check if `close` has been called
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Register the close hook, replacing any previous one
    ///
    /// If the channel is already closed the hook runs immediately.
    pub fn set_on_close<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.on_close.lock();
        if self.is_closed() {
            drop(slot);
            hook();
        } else {
            *slot = Some(Box::new(hook));
        }
    }
}

impl fmt::Debug for LineChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineChannel")
            .field("closed", &self.is_closed())
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    // The sender lives as long as the channel, so this only ends on close.
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Base64-encode a UTF-8 message body
pub fn encode_payload(text: &str) -> String {
    Base64.encode(text.as_bytes())
}

/// Decode a base64 message body back into text
///
/// Invalid UTF-8 sequences are replaced with U+FFFD; only malformed
/// base64 is an error.
pub fn decode_payload(body: &str) -> Result<String, ChatError> {
    let bytes = Base64.decode(body).map_err(|_| ChatError::InvalidPayload)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
