//! Connection handler
//!
//! Runs one admitted connection: reads lines, decodes them into commands
//! and forwards them to the ChatServer actor, then reports the disconnect
//! when the receive loop ends.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::connection::{framed, Connection};
use crate::events::EventSink;
use crate::message::Command;
use crate::server::{Admission, ServerCommand};
use crate::types::ConnectionId;

/// Serve an admitted connection until it closes
///
/// Lines are forwarded to the actor in arrival order. Malformed lines are
/// reported through `events` and skipped; the connection stays open.
pub async fn handle_connection<S>(
    stream: S,
    admission: Admission,
    cmd_tx: mpsc::Sender<ServerCommand>,
    max_line_length: usize,
    events: EventSink,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Admission {
        connection,
        outbound,
    } = admission;
    let client_id = connection.id();

    match connection.peer_addr() {
        Some(addr) => info!("Client {} connected from {}", client_id, addr),
        None => info!("Client {} connected", client_id),
    }

    let on_line = {
        let connection = Arc::clone(&connection);
        let cmd_tx = cmd_tx.clone();
        move |line: String| {
            let connection = Arc::clone(&connection);
            let cmd_tx = cmd_tx.clone();
            let events = events.clone();
            async move { dispatch_line(&connection, &cmd_tx, &events, line).await }
        }
    };

    let on_close = move || async move {
        // Deregistration is idempotent, so this is harmless after an exit
        let _ = cmd_tx.send(ServerCommand::Disconnect { client_id }).await;
    };

    connection
        .receive_loop(framed(stream, max_line_length), outbound, on_line, on_close)
        .await;

    info!("Client {} disconnected", client_id);
}

/// Decode one inbound line and forward it to the actor
async fn dispatch_line(
    connection: &Connection,
    cmd_tx: &mpsc::Sender<ServerCommand>,
    events: &EventSink,
    line: String,
) {
    let client_id = connection.id();
    debug!("User {}: {}", connection.display_name(), line);

    let cmd = match Command::decode(&line) {
        Ok(cmd) => cmd,
        Err(e) => {
            events.error(format!("Invalid line from client {}: {}", client_id, e));
            return;
        }
    };

    if cmd == Command::Exit {
        // Stop reading now; anything after the exit is dropped
        connection.close();
    }

    if cmd_tx
        .send(command_to_server_command(client_id, cmd))
        .await
        .is_err()
    {
        debug!("Server closed, ending connection {}", client_id);
        connection.close();
    }
}

/// Convert a decoded Command to a ServerCommand
fn command_to_server_command(client_id: ConnectionId, cmd: Command) -> ServerCommand {
    match cmd {
        Command::Chat(content) => ServerCommand::Chat { client_id, content },
        Command::Nick(nickname) => ServerCommand::SetNickname {
            client_id,
            nickname,
        },
        Command::List => ServerCommand::ListUsers { client_id },
        Command::Private(message) => ServerCommand::Private { client_id, message },
        Command::Exit => ServerCommand::Exit { client_id },
    }
}
