//! Client chat session
//!
//! One background task owns the connection to the relay: it performs the
//! CONNECT handshake, then decodes relay frames and publishes them as
//! [`SessionEvent`]s on an ordered channel. The [`ChatSession`] handle
//! sends requests from any task.
//!
//! States: `Disconnected → Handshaking → Connected → Terminated`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{decode_payload, BoxedStream, LineChannel};
use crate::config::SessionConfig;
use crate::error::ChatError;
use crate::protocol::{self, Request, Response};
use crate::tls;
use crate::types::{ChatId, ChatUser};

/// Events queued before the worker waits for the consumer
pub const EVENT_BUFFER_SIZE: usize = 256;

/// Everything the session reports, in arrival order
#[derive(Debug)]
pub enum SessionEvent {
    ConnectionSucceeded { chat_id: ChatId },
    /// The relay refused the handshake; no receive loop follows
    ConnectionFailed { reason: String },
    MessageReceived { from: ChatId, text: String },
    UserConnected(ChatUser),
    /// Sent after every entry of a CONNECTED_USERS list
    ConnectedUsersUpdated(HashMap<ChatId, ChatUser>),
    ErrorOccurred(ChatError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Connected,
    Terminated,
}

/// State shared by the handle and the worker
struct Shared {
    username: String,
    channel: OnceLock<Arc<LineChannel>>,
    chat_id: OnceLock<ChatId>,
    state: parking_lot::Mutex<SessionState>,
    interrupted: AtomicBool,
    /// Serializes send_message / request_connected_users / logout
    ops: Mutex<()>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// Move to `next` unless the session already terminated
    fn advance(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if *state == SessionState::Terminated {
            return false;
        }
        *state = next;
        true
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    fn writable_channel(&self) -> Result<&Arc<LineChannel>, ChatError> {
        if self.is_interrupted() {
            return Err(ChatError::SessionInterrupted);
        }
        self.channel.get().ok_or(ChatError::NotConnected)
    }
}

/// How the worker obtains its stream
enum Transport {
    Config(SessionConfig),
    Stream(BoxedStream),
}

/// Handle to a running chat session
pub struct ChatSession {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ChatSession {
    /// Start a session that connects as described by `config`
    ///
    /// Must be called inside a tokio runtime. Connection failures are
    /// reported on the returned event channel.
    pub fn spawn(config: SessionConfig) -> (Self, mpsc::Receiver<SessionEvent>) {
        let username = config.username.clone();
        Self::start(username, Transport::Config(config))
    }

    /// Start a session over an already established stream
    pub fn from_stream(
        stream: BoxedStream,
        username: impl Into<String>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        Self::start(username.into(), Transport::Stream(stream))
    }

    fn start(
        username: String,
        transport: Transport,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let shared = Arc::new(Shared {
            username,
            channel: OnceLock::new(),
            chat_id: OnceLock::new(),
            state: parking_lot::Mutex::new(SessionState::Disconnected),
            interrupted: AtomicBool::new(false),
            ops: Mutex::new(()),
        });
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let worker = tokio::spawn(run_worker(Arc::clone(&shared), transport, events_tx));

        (
            Self {
                shared,
                worker: Some(worker),
            },
            events_rx,
        )
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// Id assigned by the relay, once the handshake succeeded
    pub fn chat_id(&self) -> Option<ChatId> {
        self.shared.chat_id.get().copied()
    }

    /// Display name sent with CONNECT
    pub fn username(&self) -> &str {
        &self.shared.username
    }

    /// Send `text` to the user with id `to`; the body is base64-encoded
    pub async fn send_message(&self, to: ChatId, text: &str) -> Result<(), ChatError> {
        let _op = self.shared.ops.lock().await;
        let channel = self.shared.writable_channel()?;
        channel.write_lines(protocol::message_request(to, text)).await
    }

    /// Ask the relay for the user list; the answer arrives as events
    pub async fn request_connected_users(&self) -> Result<(), ChatError> {
        let _op = self.shared.ops.lock().await;
        let channel = self.shared.writable_channel()?;
        channel
            .write_lines([Request::ConnectedUsers.header()])
            .await
    }

    /// Send LOGOUT and close the connection
    pub async fn logout(&self) -> Result<(), ChatError> {
        let _op = self.shared.ops.lock().await;
        let channel = Arc::clone(self.shared.writable_channel()?);
        self.shared.interrupted.store(true, Ordering::SeqCst);

        let sent = channel.write_lines([Request::Logout.header()]).await;
        channel.close().await;
        self.shared.set_state(SessionState::Terminated);
        sent
    }

    /// Terminate the session: best-effort LOGOUT, then close
    ///
    /// Later calls are no-ops.
    pub async fn interrupt(&self) {
        if self.shared.interrupted.swap(true, Ordering::SeqCst) {
            return;
        }

        let _op = self.shared.ops.lock().await;
        if let Some(channel) = self.shared.channel.get() {
            if let Err(e) = channel.write_lines([Request::Logout.header()]).await {
                debug!("LOGOUT during interrupt failed: {}", e);
            }
            channel.close().await;
        }
        self.shared.set_state(SessionState::Terminated);
    }

    /// Wait for the background worker to finish
    pub async fn join(mut self) {
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!("Session worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

/// Result of the CONNECT exchange
enum Handshake {
    Accepted(ChatId),
    Rejected(String),
}

async fn run_worker(
    shared: Arc<Shared>,
    transport: Transport,
    events: mpsc::Sender<SessionEvent>,
) {
    if !shared.advance(SessionState::Handshaking) {
        return;
    }

    let stream = match transport {
        Transport::Stream(stream) => stream,
        Transport::Config(config) => match establish(&config).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Could not reach relay {}:{}: {}", config.host, config.port, e);
                let _ = events.send(SessionEvent::ErrorOccurred(e)).await;
                shared.set_state(SessionState::Terminated);
                return;
            }
        },
    };

    let channel = Arc::new(LineChannel::new(stream));
    // interrupt() reads the channel after raising the flag, so one of the
    // two sides always sees the other
    let _ = shared.channel.set(Arc::clone(&channel));
    if shared.is_interrupted() {
        channel.close().await;
        shared.set_state(SessionState::Terminated);
        return;
    }

    match handshake(&channel, &shared.username).await {
        Ok(Handshake::Accepted(chat_id)) => {
            let _ = shared.chat_id.set(chat_id);
            if shared.is_interrupted() || !shared.advance(SessionState::Connected) {
                debug!("Session interrupted during handshake");
                channel.close().await;
                shared.set_state(SessionState::Terminated);
                return;
            }
            info!("Connected to relay as {} ({})", shared.username, chat_id);
            let _ = events.send(SessionEvent::ConnectionSucceeded { chat_id }).await;
        }
        Ok(Handshake::Rejected(reason)) => {
            info!("Relay refused connection: {}", reason);
            let _ = events.send(SessionEvent::ConnectionFailed { reason }).await;
            channel.close().await;
            shared.set_state(SessionState::Terminated);
            return;
        }
        Err(e) => {
            if !shared.is_interrupted() {
                let _ = events.send(SessionEvent::ErrorOccurred(e)).await;
            }
            channel.close().await;
            shared.set_state(SessionState::Terminated);
            return;
        }
    }

    let mut users = HashMap::new();
    loop {
        if let Err(e) = receive_frame(&channel, &mut users, &events).await {
            if shared.is_interrupted() {
                debug!("Receive loop stopped after interrupt");
            } else {
                warn!("Lost connection to relay: {}", e);
                let _ = events.send(SessionEvent::ErrorOccurred(e)).await;
            }
            break;
        }
    }

    channel.close().await;
    shared.set_state(SessionState::Terminated);
}

/// Open the TCP (and optionally TLS) stream to the relay
async fn establish(config: &SessionConfig) -> Result<BoxedStream, ChatError> {
    let tcp = match config.local_addr {
        Some(local) => {
            let remote = tokio::net::lookup_host((config.host.as_str(), config.port))
                .await?
                .find(|addr| addr.is_ipv4() == local.is_ipv4())
                .ok_or_else(|| {
                    ChatError::Config(format!("no address of {} matches {}", config.host, local))
                })?;
            let socket = if local.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind((local, 0).into())?;
            socket.connect(remote).await?
        }
        None => TcpStream::connect((config.host.as_str(), config.port)).await?,
    };

    match &config.tls_ca {
        Some(pinned) => {
            let connector = tls::load_connector(pinned)?;
            let name = tls::server_name(&config.host)?;
            Ok(Box::new(connector.connect(name, tcp).await?))
        }
        None => Ok(Box::new(tcp)),
    }
}

async fn handshake(channel: &LineChannel, username: &str) -> Result<Handshake, ChatError> {
    channel.write_lines(protocol::connect_request(username)).await?;

    let status = channel.read_line().await?;
    if Response::from_header(&status) != Some(Response::ConnectionSuccess) {
        let reason = channel.read_line().await?;
        return Ok(Handshake::Rejected(reason));
    }

    let chat_id = channel.read_line().await?.parse()?;
    Ok(Handshake::Accepted(chat_id))
}

/// Decode one relay frame
///
/// Only stream failures are returned; a malformed frame is reported as
/// an event and the loop goes on.
async fn receive_frame(
    channel: &LineChannel,
    users: &mut HashMap<ChatId, ChatUser>,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<(), ChatError> {
    let header = channel.read_line().await?;

    match Response::from_header(&header) {
        Some(Response::Message) => {
            let from = channel.read_line().await?;
            let _target = channel.read_line().await?;
            let _begin = channel.read_line().await?;
            let body = channel.read_line().await?;
            let _end = channel.read_line().await?;

            let event = match (from.parse::<ChatId>(), decode_payload(&body)) {
                (Ok(from), Ok(text)) => SessionEvent::MessageReceived { from, text },
                (Err(e), _) | (_, Err(e)) => SessionEvent::ErrorOccurred(e),
            };
            let _ = events.send(event).await;
        }
        Some(Response::UserConnected) => {
            let id = channel.read_line().await?;
            let name = channel.read_line().await?;

            match id.parse::<ChatId>() {
                Ok(id) => {
                    let user = ChatUser::new(id, name);
                    users.insert(id, user.clone());
                    let _ = events.send(SessionEvent::UserConnected(user)).await;
                }
                Err(e) => {
                    let _ = events.send(SessionEvent::ErrorOccurred(e)).await;
                }
            }
        }
        Some(Response::ConnectedUsers) => {
            let _begin = channel.read_line().await?;
            users.clear();

            loop {
                let line = channel.read_line().await?;
                if protocol::is_end_list(&line) {
                    break;
                }
                let Some((id, name)) = protocol::parse_user_entry(&line) else {
                    debug!("Skipping malformed list entry '{}'", line);
                    continue;
                };
                users.insert(id, ChatUser::new(id, name));
                let _ = events.send(SessionEvent::ConnectedUsersUpdated(users.clone())).await;
            }
        }
        _ => {
            debug!("Ignoring unrecognized frame header '{}'", header);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    use crate::channel::encode_payload;

    struct Relay {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Relay {
        async fn send(&mut self, lines: &[&str]) {
            for line in lines {
                self.writer.write_all(line.as_bytes()).await.unwrap();
                self.writer.write_all(b"\n").await.unwrap();
            }
        }

        async fn next(&mut self) -> Option<String> {
            self.lines.next_line().await.unwrap()
        }
    }

    fn session(name: &str) -> (ChatSession, mpsc::Receiver<SessionEvent>, Relay) {
        let (local, remote) = tokio::io::duplex(4096);
        let (session, events) = ChatSession::from_stream(Box::new(local), name);
        let (read, writer) = tokio::io::split(remote);
        let relay = Relay {
            lines: BufReader::new(read).lines(),
            writer,
        };
        (session, events, relay)
    }

    async fn connected(
        name: &str,
        id: u32,
    ) -> (ChatSession, mpsc::Receiver<SessionEvent>, Relay) {
        let (session, mut events, mut relay) = session(name);
        assert_eq!(relay.next().await.unwrap(), "CONNECT");
        assert_eq!(relay.next().await.unwrap(), name);
        let id_line = id.to_string();
        relay.send(&["CONNECTION_SUCCESS", id_line.as_str()]).await;
        match events.recv().await.unwrap() {
            SessionEvent::ConnectionSucceeded { chat_id } => assert_eq!(chat_id, ChatId(id)),
            other => panic!("unexpected event {:?}", other),
        }
        (session, events, relay)
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let (session, _events, _relay) = connected("Alice", 2130706434).await;
        assert_eq!(session.chat_id(), Some(ChatId(2130706434)));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let (session, mut events, mut relay) = session("Alice");
        relay.next().await;
        relay.next().await;
        relay.send(&["CONNECTION_FAILED", "UNAUTHORIZED"]).await;

        match events.recv().await.unwrap() {
            SessionEvent::ConnectionFailed { reason } => assert_eq!(reason, "UNAUTHORIZED"),
            other => panic!("unexpected event {:?}", other),
        }
        // worker finished without entering the receive loop
        assert!(events.recv().await.is_none());
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.chat_id().is_none());
    }

    #[tokio::test]
    async fn test_message_decoded() {
        let (_session, mut events, mut relay) = connected("Alice", 1).await;
        let body = encode_payload("hola 👋");
        relay
            .send(&["MESSAGE", "7", "1", "---BEGIN MESSAGE---", body.as_str(), "---END MESSAGE---"])
            .await;

        match events.recv().await.unwrap() {
            SessionEvent::MessageReceived { from, text } => {
                assert_eq!(from, ChatId(7));
                assert_eq!(text, "hola 👋");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_payload_reported_and_loop_continues() {
        let (_session, mut events, mut relay) = connected("Alice", 1).await;
        relay
            .send(&["MESSAGE", "7", "1", "---BEGIN MESSAGE---", "***", "---END MESSAGE---"])
            .await;
        relay.send(&["USER_CONNECTED", "9", "Bob"]).await;

        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::ErrorOccurred(ChatError::InvalidPayload)
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::UserConnected(user) if user.id == ChatId(9) && user.name == "Bob"
        ));
    }

    #[tokio::test]
    async fn test_connected_users_incremental_updates() {
        let (_session, mut events, mut relay) = connected("Alice", 1).await;
        relay
            .send(&[
                "CONNECTED_USERS",
                "---BEGIN LIST---",
                "1:Alice",
                "garbage",
                "2:Bob: the builder",
                "---END LIST---",
            ])
            .await;

        let SessionEvent::ConnectedUsersUpdated(first) = events.recv().await.unwrap() else {
            panic!("expected list update");
        };
        assert_eq!(first.len(), 1);

        let SessionEvent::ConnectedUsersUpdated(second) = events.recv().await.unwrap() else {
            panic!("expected list update");
        };
        assert_eq!(second.len(), 2);
        assert_eq!(second[&ChatId(2)].name, "Bob: the builder");
    }

    #[tokio::test]
    async fn test_list_replaces_previous_users() {
        let (_session, mut events, mut relay) = connected("Alice", 1).await;
        relay.send(&["USER_CONNECTED", "5", "Eve"]).await;
        relay
            .send(&["CONNECTED_USERS", "---BEGIN LIST---", "1:Alice", "---END LIST---"])
            .await;

        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::UserConnected(_)
        ));
        let SessionEvent::ConnectedUsersUpdated(users) = events.recv().await.unwrap() else {
            panic!("expected list update");
        };
        assert_eq!(users.len(), 1);
        assert!(!users.contains_key(&ChatId(5)));
    }

    #[tokio::test]
    async fn test_unknown_header_ignored() {
        let (_session, mut events, mut relay) = connected("Alice", 1).await;
        relay.send(&["PING", "USER_CONNECTED", "9", "Bob"]).await;

        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::UserConnected(_)
        ));
    }

    #[tokio::test]
    async fn test_requests_written_to_relay() {
        let (session, _events, mut relay) = connected("Alice", 1).await;

        session.send_message(ChatId(2), "hi").await.unwrap();
        session.request_connected_users().await.unwrap();

        let expected = ["MESSAGE", "2", "---BEGIN MESSAGE---", "aGk=", "---END MESSAGE---", "CONNECTED_USERS"];
        for line in expected {
            assert_eq!(relay.next().await.unwrap(), line);
        }
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let (session, _events, mut relay) = connected("Alice", 1).await;
        let session = Arc::new(session);

        let mut tasks = Vec::new();
        for i in 0..8u32 {
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move {
                session.send_message(ChatId(i), &format!("message {}", i)).await
            }));
        }
        let reader = tokio::spawn(async move {
            let mut frames = Vec::new();
            for _ in 0..8 {
                let mut frame = Vec::new();
                for _ in 0..5 {
                    frame.push(relay.next().await.unwrap());
                }
                frames.push(frame);
            }
            frames
        });
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        for frame in reader.await.unwrap() {
            assert_eq!(frame[0], "MESSAGE");
            let id: u32 = frame[1].parse().unwrap();
            assert_eq!(frame[2], protocol::BEGIN_MESSAGE);
            assert_eq!(decode_payload(&frame[3]).unwrap(), format!("message {}", id));
            assert_eq!(frame[4], protocol::END_MESSAGE);
        }
    }

    #[tokio::test]
    async fn test_interrupt_sends_logout_and_blocks_operations() {
        let (session, mut events, mut relay) = connected("Alice", 1).await;

        session.interrupt().await;
        session.interrupt().await;

        assert_eq!(relay.next().await.unwrap(), "LOGOUT");
        assert!(relay.next().await.is_none());
        assert!(matches!(
            session.send_message(ChatId(2), "late").await,
            Err(ChatError::SessionInterrupted)
        ));
        assert!(matches!(
            session.request_connected_users().await,
            Err(ChatError::SessionInterrupted)
        ));
        assert!(matches!(
            session.logout().await,
            Err(ChatError::SessionInterrupted)
        ));

        // no error event for a requested shutdown
        assert!(events.recv().await.is_none());
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_interrupt_during_handshake() {
        let (session, mut events, mut relay) = session("Alice");
        assert_eq!(relay.next().await.unwrap(), "CONNECT");
        assert_eq!(relay.next().await.unwrap(), "Alice");

        session.interrupt().await;
        relay.send(&["CONNECTION_SUCCESS", "1"]).await;

        assert_eq!(relay.next().await.unwrap(), "LOGOUT");
        assert!(relay.next().await.is_none());
        assert!(events.recv().await.is_none());
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_slow_consumer_applies_backpressure() {
        let (_session, mut events, mut relay) = connected("Alice", 1).await;
        let total = EVENT_BUFFER_SIZE + 44;

        let mut frame = vec!["CONNECTED_USERS".to_string(), protocol::BEGIN_LIST.to_string()];
        frame.extend((1..=total).map(|i| format!("{}:u{}", i, i)));
        frame.push(protocol::END_LIST.to_string());
        let lines: Vec<&str> = frame.iter().map(String::as_str).collect();
        relay.send(&lines).await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(events.len(), EVENT_BUFFER_SIZE);

        let mut last = HashMap::new();
        for _ in 0..total {
            match events.recv().await.unwrap() {
                SessionEvent::ConnectedUsersUpdated(users) => last = users,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(last.len(), total);
        assert_eq!(last[&ChatId(total as u32)].name, format!("u{}", total));
    }

    #[tokio::test]
    async fn test_logout() {
        let (session, mut events, mut relay) = connected("Alice", 1).await;
        session.logout().await.unwrap();

        assert_eq!(relay.next().await.unwrap(), "LOGOUT");
        assert!(relay.next().await.is_none());
        assert!(events.recv().await.is_none());
        session.join().await;
    }

    #[tokio::test]
    async fn test_relay_hangup_reported() {
        let (session, mut events, relay) = connected("Alice", 1).await;
        drop(relay);

        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::ErrorOccurred(ChatError::Closed)
        ));
        assert!(events.recv().await.is_none());
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_operations_before_connection() {
        let (session, _events, _relay) = session("Alice");
        // the worker may not have opened the channel yet
        match session.request_connected_users().await {
            Ok(()) | Err(ChatError::NotConnected) => {}
            Err(e) => panic!("unexpected error {}", e),
        }
    }

    #[tokio::test]
    async fn test_unreachable_relay_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (session, mut events) = ChatSession::spawn(SessionConfig::new("Alice").server("127.0.0.1", port));
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::ErrorOccurred(ChatError::Io(_))
        ));
        assert!(events.recv().await.is_none());
        assert_eq!(session.state(), SessionState::Terminated);
    }
}
