//! Basic type definitions for the chat service
//!
//! Provides newtype wrappers for type safety:
//! - `ConnectionId`: sequential per-process connection identifier
//! - `ConnectionStatus`: client-side connection state

use std::num::ParseIntError;
use std::str::FromStr;

/// Unique connection identifier (newtype pattern)
///
/// Assigned sequentially by the server starting at 1 and never reused
/// for the lifetime of the process. Implements Hash and Eq for use as
/// HashMap keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Identifier carried by client-side handles, which are never
    /// assigned an id by the server.
    pub const UNASSIGNED: ConnectionId = ConnectionId(0);

    /// The first identifier handed out by a server
    pub const fn first() -> Self {
        Self(1)
    }

    /// The identifier allocated after this one
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Label used when the connection has no nickname
    pub fn default_display_name(self) -> String {
        format!("User_{}", self.0)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Client-side connection status
///
/// `Connecting -> Connected` on a successful connect,
/// `Connected -> Disconnected` on I/O failure or explicit close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    #[default]
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}
