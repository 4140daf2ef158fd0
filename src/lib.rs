//! Multi-client line-based TCP chat
//!
//! A small chat service built on tokio. Clients exchange newline-delimited
//! UTF-8 lines with a server that broadcasts chat lines, delivers private
//! messages and answers directory requests.
//!
//! # Features
//! - Sequential connection identifiers starting at 1
//! - Nickname changes with notices to other users
//! - Directory listing of connected users
//! - Private messages to one connection
//! - Capacity limit with reject-on-accept
//! - Client session with background receive loop
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `ChatServer` is the central actor owning the client registry
//! - Each connection has a `handler` task that decodes lines and forwards
//!   commands to the actor, plus a writer task draining its outbound queue
//! - No locks around the registry - all access goes through message passing
//!
//! # Example
//! ```ignore
//! use line_chat::{ChatServerHandle, EventSink, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), line_chat::AppError> {
//!     let server = ChatServerHandle::bind(&ServerConfig::default(), EventSink::new()).await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod handler;
pub mod listener;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use config::{ClientConfig, ServerConfig};
pub use connection::Connection;
pub use error::{AppError, DecodeError, SendError};
pub use events::{EventSink, LogEvent, Severity};
pub use handler::handle_connection;
pub use listener::ChatServerHandle;
pub use message::{Command, Directory, DirectoryEntry, PrivateMessage, ServerLine};
pub use registry::ClientRegistry;
pub use server::{ChatServer, ServerCommand};
pub use session::ClientSession;
pub use types::{ConnectionId, ConnectionStatus};
