//! ChatServer Actor implementation
//!
//! The central actor that owns the client registry and routes every line.
//! Connection handlers decode inbound lines and forward them here as
//! [`ServerCommand`]s; the actor processes commands one at a time, so
//! registry mutation is serialized and each connection's lines are routed
//! in the order they arrived.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::{Connection, Outbound};
use crate::events::EventSink;
use crate::message::{Directory, PrivateMessage};
use crate::registry::ClientRegistry;
use crate::types::ConnectionId;

/// Commands sent from handlers to the ChatServer actor
#[derive(Debug)]
pub enum ServerCommand {
    /// New socket accepted; reply is `None` when the server is full
    Connect {
        peer_addr: Option<SocketAddr>,
        reply: oneshot::Sender<Option<Admission>>,
    },
    /// Receive loop ended
    Disconnect { client_id: ConnectionId },
    /// Client asked to leave
    Exit { client_id: ConnectionId },
    /// Set client's nickname
    SetNickname {
        client_id: ConnectionId,
        nickname: String,
    },
    /// Send the directory back to the client
    ListUsers { client_id: ConnectionId },
    /// Deliver a private message; `message.client_id` is the target
    Private {
        client_id: ConnectionId,
        message: PrivateMessage,
    },
    /// Broadcast a chat line
    Chat {
        client_id: ConnectionId,
        content: String,
    },
    /// Current directory, for embedding code and tests
    Directory { reply: oneshot::Sender<Directory> },
}

/// A registered connection handed back to the accept loop
#[derive(Debug)]
pub struct Admission {
    pub connection: Arc<Connection>,
    pub outbound: Outbound,
}

/// The main ChatServer actor
///
/// Owns the registry and the identifier counter. Identifiers start at 1
/// and are only allocated for admitted connections.
pub struct ChatServer {
    registry: ClientRegistry,
    next_id: ConnectionId,
    max_connections: usize,
    /// Parent of every connection's shutdown token
    shutdown: CancellationToken,
    events: EventSink,
    receiver: mpsc::Receiver<ServerCommand>,
}

impl ChatServer {
    pub fn new(
        receiver: mpsc::Receiver<ServerCommand>,
        max_connections: usize,
        shutdown: CancellationToken,
        events: EventSink,
    ) -> Self {
        Self {
            registry: ClientRegistry::new(),
            next_id: ConnectionId::first(),
            max_connections,
            shutdown,
            events,
            receiver,
        }
    }

    /// Run the ChatServer event loop
    ///
    /// Continuously receives and processes commands until all senders are
    /// dropped, then closes whatever is still registered.
    pub async fn run(mut self) {
        info!("ChatServer started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        for connection in self.registry.snapshot() {
            connection.close();
        }

        info!("ChatServer shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Connect { peer_addr, reply } => {
                self.handle_connect(peer_addr, reply);
            }
            ServerCommand::Disconnect { client_id } => {
                self.deregister(client_id);
            }
            ServerCommand::Exit { client_id } => {
                debug!("Client {} requested exit", client_id);
                self.deregister(client_id);
            }
            ServerCommand::SetNickname {
                client_id,
                nickname,
            } => {
                self.handle_set_nickname(client_id, nickname);
            }
            ServerCommand::ListUsers { client_id } => {
                self.handle_list_users(client_id);
            }
            ServerCommand::Private { client_id, message } => {
                self.handle_private(client_id, message);
            }
            ServerCommand::Chat { client_id, content } => {
                self.handle_chat(client_id, content);
            }
            ServerCommand::Directory { reply } => {
                let _ = reply.send(self.registry.directory());
            }
        }
    }

    /// Handle a newly accepted socket
    fn handle_connect(
        &mut self,
        peer_addr: Option<SocketAddr>,
        reply: oneshot::Sender<Option<Admission>>,
    ) {
        let peer = peer_addr.map_or_else(|| "unknown".to_string(), |addr| addr.to_string());

        if self.registry.len() >= self.max_connections {
            self.events.warning(format!(
                "Max clients reached. Connection refused for {}",
                peer
            ));
            let _ = reply.send(None);
            return;
        }

        let client_id = self.next_id;
        self.next_id = client_id.next();

        let (connection, outbound) =
            Connection::new(client_id, peer_addr, self.shutdown.child_token());

        if let Err(e) = self.registry.add(client_id, Arc::clone(&connection)) {
            self.events.error(e.to_string());
            let _ = reply.send(None);
            return;
        }

        let admission = Admission {
            connection: Arc::clone(&connection),
            outbound,
        };
        if reply.send(Some(admission)).is_err() {
            // Accept loop went away before the socket could be served
            self.registry.remove(client_id);
            connection.close();
            return;
        }

        self.events.success(format!("Client {} connected from {}.", client_id, peer));

        let _ = connection.send(format!("Welcome, User {}!", client_id));
        self.broadcast(client_id, &format!("User {} has joined the chat.", client_id));

        debug!("Total clients: {}", self.registry.len());
    }

    /// Remove a connection and tell everyone else it left
    ///
    /// Runs for both explicit exits and dropped sockets; only the first
    /// call for an id does anything.
    fn deregister(&mut self, client_id: ConnectionId) {
        let Some(connection) = self.registry.remove(client_id) else {
            return;
        };

        connection.close();
        self.events.warning(format!("Client {} disconnected.", client_id));
        self.broadcast(client_id, &format!("User {} has left the chat.", client_id));

        debug!("Total clients: {}", self.registry.len());
    }

    /// Handle nickname change
    fn handle_set_nickname(&mut self, client_id: ConnectionId, nickname: String) {
        let Some(client) = self.registry.get(client_id).cloned() else {
            return;
        };

        client.set_nickname(nickname.clone());
        self.events.success(format!(
            "User {} changed nickname to {}",
            client_id, nickname
        ));

        let _ = client.send(format!("Your nickname has been changed to {}", nickname));
        self.broadcast(
            client_id,
            &format!("User {} changed nickname to {}", client_id, nickname),
        );
    }

    /// Reply with the directory to the requester only
    fn handle_list_users(&mut self, client_id: ConnectionId) {
        let Some(client) = self.registry.get(client_id) else {
            return;
        };

        let _ = client.send(self.registry.directory().encode());
    }

    /// Handle private message delivery
    fn handle_private(&mut self, client_id: ConnectionId, message: PrivateMessage) {
        let Some(sender) = self.registry.get(client_id) else {
            return;
        };

        if message.client_id == client_id {
            self.events.error("You cannot send a private message to yourself.");
            return;
        }

        let Some(target) = self.registry.get(message.client_id) else {
            self.events.error(format!("Client {} not connected.", message.client_id));
            return;
        };

        // The target learns who sent it, not who it was addressed to
        let restamped = PrivateMessage::new(client_id, message.body, sender.nickname());
        debug!(
            "Private message from {} to {}",
            client_id, message.client_id
        );
        let _ = target.send(restamped.encode());
    }

    /// Handle chat message
    fn handle_chat(&mut self, client_id: ConnectionId, content: String) {
        let Some(client) = self.registry.get(client_id) else {
            return;
        };

        let line = format!("{}: {}", client.display_name(), content);
        self.broadcast(client_id, &line);
    }

    /// Send `line` to every registered connection except `sender`
    fn broadcast(&self, sender: ConnectionId, line: &str) {
        for connection in self.registry.snapshot() {
            if connection.id() != sender {
                let _ = connection.send(line);
            }
        }
    }
}
