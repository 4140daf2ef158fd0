//! Error types for the chat service
//!
//! Defines application-level errors, line send errors and protocol
//! decode errors. Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ConnectionId;

/// Application-level errors
///
/// None of these are process-fatal: connection errors end one
/// connection, configuration errors stop a binary before it starts.
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error (fatal for the affected connection)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Line framing error (line too long or IO failure underneath)
    #[error("Line codec error: {0}")]
    Codec(#[from] tokio_util::codec::AnyDelimiterCodecError),

    /// Outbound connection attempt failed
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be read
    #[error("Failed to read config file '{}': {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML for our schema
    #[error("Failed to parse config file '{}': {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Configuration is missing a required value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// An identifier was registered twice
    #[error("Connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// The session was already started
    #[error("Session already started")]
    AlreadyStarted,

    /// The session was connected once and has since been closed
    #[error("Session closed")]
    SessionClosed,
}

/// Line send errors
///
/// Occurs when attempting to send through a handle whose socket is gone.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The connection has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The session is not in the connected state
    #[error("Not connected")]
    NotConnected,
}

/// Protocol decode errors
///
/// Returned by the line codec; callers log and skip the line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Line does not start with the private message token
    #[error("not a private message")]
    NotPrivateMessage,

    /// Nickname command with nothing after the prefix
    #[error("nickname must not be empty")]
    EmptyNickname,

    /// Private message without the client id token
    #[error("private message is missing the client id")]
    MissingClientId,

    /// Private message without the nickname token
    #[error("private message is missing the nickname")]
    MissingNickname,

    /// Client id segment is not a number
    #[error("invalid client id '{0}'")]
    InvalidClientId(String),
}
