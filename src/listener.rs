//! Server startup and accept loop
//!
//! Binds the listener, starts the ChatServer actor and serves every
//! admitted connection on its own supervised task. Shutting down cancels
//! all connections through one parent token and joins their tasks.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::events::EventSink;
use crate::handler::handle_connection;
use crate::message::Directory;
use crate::server::{Admission, ChatServer, ServerCommand};

/// Channel buffer size for server commands
const CHANNEL_BUFFER_SIZE: usize = 256;

/// A running chat server
pub struct ChatServerHandle {
    local_addr: SocketAddr,
    cmd_tx: mpsc::Sender<ServerCommand>,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
    actor_task: JoinHandle<()>,
}

impl ChatServerHandle {
    /// Bind `config.host:config.port` and start serving
    pub async fn bind(config: &ServerConfig, events: EventSink) -> Result<Self, AppError> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        Self::start(listener, config, events)
    }

    /// Start serving on an already bound listener
    pub fn start(
        listener: TcpListener,
        config: &ServerConfig,
        events: EventSink,
    ) -> Result<Self, AppError> {
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let server = ChatServer::new(
            cmd_rx,
            config.max_connections,
            shutdown.clone(),
            events.clone(),
        );
        let actor_task = tokio::spawn(server.run());

        let accept_task = tokio::spawn(accept_loop(
            listener,
            cmd_tx.clone(),
            config.max_line_length,
            shutdown.clone(),
            events.clone(),
        ));

        events.info(format!(
            "Chat server listening on {} (max {} connections)",
            local_addr, config.max_connections
        ));

        Ok(Self {
            local_addr,
            cmd_tx,
            shutdown,
            accept_task,
            actor_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current directory of registered connections
    pub async fn directory(&self) -> Result<Directory, AppError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ServerCommand::Directory { reply })
            .await
            .map_err(|_| AppError::ChannelSend)?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    /// Number of registered connections
    pub async fn client_count(&self) -> Result<usize, AppError> {
        Ok(self.directory().await?.len())
    }

    /// Stop accepting, close every connection and wait for all tasks
    pub async fn shutdown(self) {
        let Self {
            shutdown,
            cmd_tx,
            accept_task,
            actor_task,
            ..
        } = self;

        shutdown.cancel();
        if let Err(e) = accept_task.await {
            warn!("Accept task failed: {}", e);
        }

        // Last sender gone: the actor drains its queue and stops
        drop(cmd_tx);
        if let Err(e) = actor_task.await {
            warn!("ChatServer task failed: {}", e);
        }

        info!("Chat server stopped");
    }
}

/// Connection accept loop
async fn accept_loop(
    listener: TcpListener,
    cmd_tx: mpsc::Sender<ServerCommand>,
    max_line_length: usize,
    shutdown: CancellationToken,
    events: EventSink,
) {
    let mut workers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("New connection from {}", peer_addr);
                    match admit(&cmd_tx, peer_addr).await {
                        Ok(Some(admission)) => {
                            workers.spawn(serve(
                                stream,
                                admission,
                                cmd_tx.clone(),
                                max_line_length,
                                events.clone(),
                            ));
                        }
                        // Server full; dropping the stream closes the socket
                        Ok(None) => drop(stream),
                        Err(e) => {
                            events.error(format!("Cannot register {}: {}", peer_addr, e));
                            break;
                        }
                    }
                }
                Err(e) => {
                    events.error(format!("Failed to accept connection: {}", e));
                }
            },
            Some(finished) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = finished {
                    warn!("Connection task failed: {}", e);
                }
            }
        }
    }

    debug!("Accept loop stopped, waiting for {} connections", workers.len());
    while let Some(finished) = workers.join_next().await {
        if let Err(e) = finished {
            warn!("Connection task failed: {}", e);
        }
    }
}

/// Ask the actor to register a freshly accepted socket
async fn admit(
    cmd_tx: &mpsc::Sender<ServerCommand>,
    peer_addr: SocketAddr,
) -> Result<Option<Admission>, AppError> {
    let (reply, rx) = oneshot::channel();
    cmd_tx
        .send(ServerCommand::Connect {
            peer_addr: Some(peer_addr),
            reply,
        })
        .await
        .map_err(|_| AppError::ChannelSend)?;
    rx.await.map_err(|_| AppError::ChannelSend)
}

async fn serve(
    stream: TcpStream,
    admission: Admission,
    cmd_tx: mpsc::Sender<ServerCommand>,
    max_line_length: usize,
    events: EventSink,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY: {}", e);
    }
    handle_connection(stream, admission, cmd_tx, max_line_length, events).await;
}
