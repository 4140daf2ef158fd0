//! Line protocol definitions
//!
//! Plain-text, newline-delimited protocol shared by server and client.
//! Every line is either a command (nickname, list, private message, exit)
//! or an ordinary chat line. The wire tokens are:
//!
//! | command | line                                            |
//! |---------|-------------------------------------------------|
//! | nick    | `/nickname <name>`                              |
//! | list    | `/allusers`                                     |
//! | private | `/private<body>/clientId<id>/nickname<nickname>` |
//! | exit    | `/exit`                                         |
//!
//! Tokens are matched at the start of the line and are case-sensitive.
//! There is no escaping: a private body containing `/clientId` or
//! `/nickname` is split at the first occurrence.

use crate::error::DecodeError;
use crate::types::ConnectionId;

/// Nickname command prefix; also the nickname sub-token of a private message
pub const NICKNAME_PREFIX: &str = "/nickname";
/// Client id sub-token of a private message
pub const CLIENT_ID_PREFIX: &str = "/clientId";
/// Directory request, and prefix of the directory reply
pub const LIST_COMMAND: &str = "/allusers";
/// Private message prefix
pub const PRIVATE_PREFIX: &str = "/private";
/// Graceful disconnect request
pub const EXIT_COMMAND: &str = "/exit";
/// Bare exit accepted for compatibility with older clients
const LEGACY_EXIT_COMMAND: &str = "exit";
/// Separator between directory entries
pub const DIRECTORY_SEPARATOR: char = '|';

/// Client → Server command
///
/// Decoded from one inbound line by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ordinary chat line, broadcast verbatim
    Chat(String),
    /// Change the sender's nickname
    Nick(String),
    /// Request the directory of connected users
    List,
    /// Deliver a message to one connection
    Private(PrivateMessage),
    /// Graceful disconnect
    Exit,
}

impl Command {
    /// Decode one line into a command
    ///
    /// Lines that match no command token decode to `Command::Chat`.
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let trimmed = line.trim();
        if trimmed == EXIT_COMMAND || trimmed == LEGACY_EXIT_COMMAND {
            return Ok(Command::Exit);
        }

        if let Some(rest) = line.strip_prefix(NICKNAME_PREFIX) {
            let name = rest.trim();
            if name.is_empty() {
                return Err(DecodeError::EmptyNickname);
            }
            return Ok(Command::Nick(name.to_string()));
        }

        if line.starts_with(LIST_COMMAND) {
            return Ok(Command::List);
        }

        if line.starts_with(PRIVATE_PREFIX) {
            return PrivateMessage::decode(line).map(Command::Private);
        }

        Ok(Command::Chat(line.to_string()))
    }

    /// Encode this command as a single line (without the delimiter)
    pub fn encode(&self) -> String {
        match self {
            Command::Chat(content) => content.clone(),
            Command::Nick(name) => format!("{} {}", NICKNAME_PREFIX, name),
            Command::List => LIST_COMMAND.to_string(),
            Command::Private(message) => message.encode(),
            Command::Exit => EXIT_COMMAND.to_string(),
        }
    }
}

/// Private message
///
/// Client → Server: `client_id` is the target and `nickname` the target's
/// nickname as the sender knows it.
/// Server → Client: the server re-stamps `client_id` and `nickname` with
/// the sender's, so the receiver knows who wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessage {
    pub client_id: ConnectionId,
    pub body: String,
    pub nickname: Option<String>,
}

impl PrivateMessage {
    pub fn new(client_id: ConnectionId, body: impl Into<String>, nickname: Option<String>) -> Self {
        Self {
            client_id,
            body: body.into(),
            nickname,
        }
    }

    /// Nickname if set and non-blank, otherwise `User_<id>`
    pub fn display_name(&self) -> String {
        match self.nickname.as_deref() {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => self.client_id.default_display_name(),
        }
    }

    /// Encode as `/private<body>/clientId<id>/nickname<nickname>`
    pub fn encode(&self) -> String {
        format!(
            "{}{}{}{}{}{}",
            PRIVATE_PREFIX,
            self.body,
            CLIENT_ID_PREFIX,
            self.client_id,
            NICKNAME_PREFIX,
            self.nickname.as_deref().unwrap_or_default()
        )
    }

    /// Decode a private message line
    ///
    /// Splits on the private, client id and nickname tokens in that order.
    /// Body and nickname are trimmed; an empty nickname decodes to `None`.
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let (_, rest) = line
            .split_once(PRIVATE_PREFIX)
            .ok_or(DecodeError::NotPrivateMessage)?;

        let (body, rest) = rest
            .split_once(CLIENT_ID_PREFIX)
            .ok_or(DecodeError::MissingClientId)?;

        let (client_id, nickname) = rest
            .split_once(NICKNAME_PREFIX)
            .ok_or(DecodeError::MissingNickname)?;

        let client_id = client_id
            .parse::<ConnectionId>()
            .map_err(|_| DecodeError::InvalidClientId(client_id.trim().to_string()))?;

        let nickname = nickname.trim();
        let nickname = (!nickname.is_empty()).then(|| nickname.to_string());

        Ok(Self::new(client_id, body.trim(), nickname))
    }
}

/// One row of the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub id: ConnectionId,
    pub name: String,
}

/// Directory of connected users, as sent in reply to `/allusers`
///
/// Encoded as `/allusers` followed by `<id>: <name>|` per entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    pub entries: Vec<DirectoryEntry>,
}

impl Directory {
    pub fn new(entries: Vec<DirectoryEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Display name listed for `id`, if present
    pub fn name_of(&self, id: ConnectionId) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.name.as_str())
    }

    pub fn encode(&self) -> String {
        let mut line = String::from(LIST_COMMAND);
        for entry in &self.entries {
            line.push_str(&format!("{}: {}{}", entry.id, entry.name, DIRECTORY_SEPARATOR));
        }
        line
    }

    /// Parse a directory reply, skipping malformed entries
    ///
    /// Returns `None` if the line is not a directory reply at all.
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix(LIST_COMMAND)?;

        let entries = rest
            .split(DIRECTORY_SEPARATOR)
            .filter_map(|entry| {
                let (id, name) = entry.split_once(':')?;
                let id = id.parse::<ConnectionId>().ok()?;
                if id == ConnectionId::UNASSIGNED {
                    return None;
                }
                Some(DirectoryEntry {
                    id,
                    name: name.trim().to_string(),
                })
            })
            .collect();

        Some(Self { entries })
    }
}

/// Server → Client line, as classified by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    /// Reply to a directory request
    Directory(Directory),
    /// Private message; `client_id`/`nickname` identify the sender
    Private(PrivateMessage),
    /// Anything else: welcome, join/leave notices, chat lines
    Notice(String),
}

impl ServerLine {
    pub fn parse(line: &str) -> Result<Self, DecodeError> {
        if let Some(directory) = Directory::parse(line) {
            return Ok(ServerLine::Directory(directory));
        }

        if line.starts_with(PRIVATE_PREFIX) {
            return PrivateMessage::decode(line).map(ServerLine::Private);
        }

        Ok(ServerLine::Notice(line.to_string()))
    }
}
