//! Terminal chat front end
//!
//! Reads stdin lines and renders session events. Messages are addressed
//! with an `@Name` reference, where `Name` is a display name with its
//! spaces removed. `/users` refreshes the user list, `/logout` leaves.

use std::collections::HashMap;
use std::io::Write;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::config::SessionConfig;
use crate::error::ChatError;
use crate::session::{ChatSession, SessionEvent};
use crate::types::{ChatId, ChatUser};

/// What a line typed at the prompt asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ListUsers,
    Logout,
    Send { to: ChatId, text: String },
    /// No resolvable `@Name` reference
    Help,
}

/// Known users and the `@Name` references that reach them
#[derive(Debug, Default)]
pub struct Directory {
    users: HashMap<ChatId, ChatUser>,
    refs: HashMap<String, ChatId>,
}

impl Directory {
    pub fn replace(&mut self, users: HashMap<ChatId, ChatUser>) {
        self.refs = users
            .values()
            .map(|user| (reference(&user.name), user.id))
            .collect();
        self.users = users;
    }

    pub fn insert(&mut self, user: ChatUser) {
        self.refs.insert(reference(&user.name), user.id);
        self.users.insert(user.id, user);
    }

    pub fn name_of(&self, id: ChatId) -> Option<&str> {
        self.users.get(&id).map(|user| user.name.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.users.values().map(|user| user.name.as_str())
    }

    /// Find the first `@Name` in `line` and resolve it
    pub fn resolve(&self, line: &str) -> Option<ChatId> {
        let (_, rest) = line.split_once('@')?;
        let name = rest.split(' ').next().unwrap_or_default();
        self.refs.get(name).copied()
    }

    pub fn parse(&self, line: &str) -> Command {
        if line.eq_ignore_ascii_case("/users") {
            return Command::ListUsers;
        }
        if line.eq_ignore_ascii_case("/logout") {
            return Command::Logout;
        }
        match self.resolve(line) {
            Some(to) => Command::Send {
                to,
                text: line.to_string(),
            },
            None => Command::Help,
        }
    }
}

/// `@Name` form of a display name
pub fn reference(name: &str) -> String {
    name.replace(' ', "")
}

/// Run an interactive session until logout, stdin EOF or disconnect
pub async fn run(config: SessionConfig) -> Result<()> {
    let username = config.username.clone();
    let (session, mut events) = ChatSession::spawn(config);
    let mut directory = Directory::default();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut ready = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if matches!(event, SessionEvent::ConnectionSucceeded { .. }) {
                    ready = true;
                    session.request_connected_users().await?;
                }
                render(&event, &mut directory);
                prompt(&username);
            }
            line = stdin.next_line(), if ready => {
                let Some(line) = line? else {
                    session.interrupt().await;
                    break;
                };
                match directory.parse(&line) {
                    Command::ListUsers => session.request_connected_users().await?,
                    Command::Logout => {
                        session.interrupt().await;
                        break;
                    }
                    Command::Send { to, text } => match session.send_message(to, &text).await {
                        Ok(()) => {}
                        Err(ChatError::SessionInterrupted) => {
                            eprintln!("It is not possible to send more messages");
                            break;
                        }
                        Err(e) => warn!("Failed to send message: {}", e),
                    },
                    Command::Help => {
                        println!(
                            "To send a message to a user use the '@' reference without any space, \
                             e. g. if you want to message yourself, use: @{}",
                            reference(&username)
                        );
                        prompt(&username);
                    }
                }
            }
        }
    }

    session.join().await;
    Ok(())
}

fn render(event: &SessionEvent, directory: &mut Directory) {
    match event {
        SessionEvent::ConnectionSucceeded { chat_id } => {
            println!("Connected with id {}", chat_id);
        }
        SessionEvent::ConnectionFailed { reason } => {
            eprintln!("Connection failed: {}", reason);
        }
        SessionEvent::MessageReceived { from, text } => {
            let name = directory.name_of(*from).unwrap_or("unknown");
            println!();
            println!("\x1b[96m{}\x1b[0m: {}", name, text);
        }
        SessionEvent::UserConnected(user) => {
            println!();
            println!("{} connected", user.name);
            directory.insert(user.clone());
        }
        SessionEvent::ConnectedUsersUpdated(users) => {
            directory.replace(users.clone());
            println!();
            println!("Connected users list: ");
            for name in directory.names() {
                println!("{}", name);
            }
        }
        SessionEvent::ErrorOccurred(e) => {
            eprintln!("Chat error: {}", e);
        }
    }
}

fn prompt(username: &str) {
    print!("[{}]: ", username);
    let _ = std::io::stdout().flush();
}
