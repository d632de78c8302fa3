//! Message protocol definitions
//!
//! Newline-delimited text frames: a header line followed by a fixed or
//! marker-delimited set of payload lines. Headers match case-insensitively.

use crate::channel::encode_payload;
use crate::error::ChatError;
use crate::types::{ChatId, Identity};

pub const BEGIN_MESSAGE: &str = "---BEGIN MESSAGE---";
pub const END_MESSAGE: &str = "---END MESSAGE---";
pub const BEGIN_LIST: &str = "---BEGIN LIST---";
pub const END_LIST: &str = "---END LIST---";

/// Client → Relay request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Followed by the display name
    Connect,
    /// Followed by target id, begin marker, base64 body, end marker
    Message,
    Logout,
    ConnectedUsers,
}

impl Request {
    const ALL: [Request; 4] = [
        Request::Connect,
        Request::Message,
        Request::Logout,
        Request::ConnectedUsers,
    ];

    pub fn header(self) -> &'static str {
        match self {
            Request::Connect => "CONNECT",
            Request::Message => "MESSAGE",
            Request::Logout => "LOGOUT",
            Request::ConnectedUsers => "CONNECTED_USERS",
        }
    }

    pub fn from_header(header: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.header().eq_ignore_ascii_case(header))
    }
}

/// Relay → Client response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Followed by the assigned id
    ConnectionSuccess,
    /// Followed by a reason line
    ConnectionFailed,
    /// Followed by sender id, target id, begin marker, base64 body, end marker
    Message,
    /// Followed by the list markers enclosing `<id>:<name>` lines
    ConnectedUsers,
    /// Followed by id and display name
    UserConnected,
}

impl Response {
    const ALL: [Response; 5] = [
        Response::ConnectionSuccess,
        Response::ConnectionFailed,
        Response::Message,
        Response::ConnectedUsers,
        Response::UserConnected,
    ];

    pub fn header(self) -> &'static str {
        match self {
            Response::ConnectionSuccess => "CONNECTION_SUCCESS",
            Response::ConnectionFailed => "CONNECTION_FAILED",
            Response::Message => "MESSAGE",
            Response::ConnectedUsers => "CONNECTED_USERS",
            Response::UserConnected => "USER_CONNECTED",
        }
    }

    pub fn from_header(header: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.header().eq_ignore_ascii_case(header))
    }
}

/// The four lines following a MESSAGE request
///
/// The relay forwards the target line, markers and body verbatim; it
/// never decodes them. `target` is the parsed form used for routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub target: ChatId,
    /// Target id exactly as the sender wrote it
    pub target_line: String,
    pub begin: String,
    pub body: String,
    pub end: String,
}

impl MessageFrame {
    /// Build a frame from the four received lines
    ///
    /// Fails with `InvalidRequest` when the target is not a chat id.
    pub fn parse(
        target_line: String,
        begin: String,
        body: String,
        end: String,
    ) -> Result<Self, ChatError> {
        Ok(Self {
            target: target_line.parse()?,
            target_line,
            begin,
            body,
            end,
        })
    }

    /// Lines of the MESSAGE frame delivered to the target
    pub fn forward_lines(&self, sender: ChatId) -> [String; 6] {
        [
            Response::Message.header().to_string(),
            sender.to_string(),
            self.target_line.clone(),
            self.begin.clone(),
            self.body.clone(),
            self.end.clone(),
        ]
    }
}

pub fn connect_request(username: &str) -> [String; 2] {
    [Request::Connect.header().to_string(), username.to_string()]
}

pub fn message_request(target: ChatId, text: &str) -> [String; 5] {
    [
        Request::Message.header().to_string(),
        target.to_string(),
        BEGIN_MESSAGE.to_string(),
        encode_payload(text),
        END_MESSAGE.to_string(),
    ]
}

pub fn connection_success(id: ChatId) -> [String; 2] {
    [
        Response::ConnectionSuccess.header().to_string(),
        id.to_string(),
    ]
}

pub fn connection_failed(reason: &str) -> [String; 2] {
    [
        Response::ConnectionFailed.header().to_string(),
        reason.to_string(),
    ]
}

pub fn user_connected(identity: &Identity) -> [String; 3] {
    [
        Response::UserConnected.header().to_string(),
        identity.chat_id().to_string(),
        identity.name().to_string(),
    ]
}

/// Complete CONNECTED_USERS frame, names written as-is
pub fn connected_users<'a, I>(identities: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a Identity>,
{
    let mut lines = vec![
        Response::ConnectedUsers.header().to_string(),
        BEGIN_LIST.to_string(),
    ];
    lines.extend(
        identities
            .into_iter()
            .map(|identity| format_user_entry(identity.chat_id(), identity.name())),
    );
    lines.push(END_LIST.to_string());
    lines
}

pub fn format_user_entry(id: ChatId, name: &str) -> String {
    format!("{}:{}", id, name)
}

/// Split a list entry on its first `:`
///
/// Returns None for lines with no `:` or a non-numeric id.
pub fn parse_user_entry(line: &str) -> Option<(ChatId, String)> {
    let (id, name) = line.split_once(':')?;
    let id = id.parse().ok()?;
    Some((id, name.to_string()))
}

pub fn is_end_list(line: &str) -> bool {
    line.eq_ignore_ascii_case(END_LIST)
}
