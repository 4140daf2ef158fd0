//! Client session
//!
//! Connects to a chat server, announces the nickname, and runs the
//! receive loop in the background while the caller keeps sending. All
//! failures after connecting are soft: they are reported through the
//! [`EventSink`] and returned as values, never panics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ClientConfig;
use crate::connection::{framed, Connection};
use crate::error::{AppError, SendError};
use crate::events::EventSink;
use crate::message::{Command, PrivateMessage, LIST_COMMAND};
use crate::types::{ConnectionId, ConnectionStatus};

/// One client connection to a chat server
///
/// A session connects at most once. After it has been connected and then
/// disconnected, a new session must be created to reconnect.
pub struct ClientSession {
    config: ClientConfig,
    events: EventSink,
    status: Arc<watch::Sender<ConnectionStatus>>,
    connection: Mutex<Option<Arc<Connection>>>,
    was_connected: AtomicBool,
}

impl ClientSession {
    pub fn new(config: ClientConfig, events: EventSink) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            config,
            events,
            status: Arc::new(status),
            connection: Mutex::new(None),
            was_connected: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Subscribe to status changes
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Connect, announce the nickname and start receiving
    ///
    /// `on_line` is called once per received line, in arrival order, from
    /// the background receive task. On failure the status is left at
    /// `Disconnected` and the error is both reported and returned.
    pub async fn start<F>(&self, mut on_line: F) -> Result<(), AppError>
    where
        F: FnMut(String) + Send + 'static,
    {
        let mut claimed = false;
        self.status.send_if_modified(|status| {
            if *status == ConnectionStatus::Disconnected
                && !self.was_connected.load(Ordering::SeqCst)
            {
                *status = ConnectionStatus::Connecting;
                claimed = true;
            }
            claimed
        });
        if !claimed {
            return Err(match self.status() {
                ConnectionStatus::Disconnected => AppError::SessionClosed,
                _ => AppError::AlreadyStarted,
            });
        }

        let addr = self.config.address();
        self.events.warning(format!("Connecting to server {}", addr));

        let connect = TcpStream::connect((self.config.host.as_str(), self.config.port));
        let stream = match connect.await {
            Ok(stream) => stream,
            Err(source) => {
                self.status.send_replace(ConnectionStatus::Disconnected);
                self.events.error(format!("Error connecting to server: {}", source));
                return Err(AppError::Connect { addr, source });
            }
        };

        let (connection, outbound) = Connection::new(
            ConnectionId::UNASSIGNED,
            stream.peer_addr().ok(),
            CancellationToken::new(),
        );
        connection.set_nickname(self.config.nickname.clone());

        *self.lock_connection() = Some(Arc::clone(&connection));
        self.was_connected.store(true, Ordering::SeqCst);
        self.status.send_replace(ConnectionStatus::Connected);
        self.events.success(format!("Connected to server {}", addr));

        let _ = connection.send(Command::Nick(self.config.nickname.clone()).encode());

        let on_close = {
            let status = Arc::clone(&self.status);
            let events = self.events.clone();
            move || {
                if status.send_replace(ConnectionStatus::Disconnected)
                    == ConnectionStatus::Connected
                {
                    events.warning("Connection to the server was lost.");
                }
                std::future::ready(())
            }
        };

        let max_line_length = self.config.max_line_length;
        let task_connection = Arc::clone(&connection);
        tokio::spawn(async move {
            task_connection
                .receive_loop(
                    framed(stream, max_line_length),
                    outbound,
                    move |line| {
                        on_line(line);
                        std::future::ready(())
                    },
                    on_close,
                )
                .await;
        });

        if let Some(period) = self.config.directory_refresh {
            tokio::spawn(refresh_directory(connection, period));
        }

        Ok(())
    }

    /// Send one raw line
    ///
    /// Fails soft when the session is not connected: a warning is
    /// reported and `SendError::NotConnected` returned.
    pub fn send(&self, line: impl Into<String>) -> Result<(), SendError> {
        let connection = self.lock_connection().clone();
        let connection = match connection {
            Some(connection) if self.is_connected() => connection,
            _ => {
                self.events.warning("Not connected to the server; message not sent.");
                return Err(SendError::NotConnected);
            }
        };

        if let Err(e) = connection.send(line) {
            self.events.error(format!("Error sending message: {}", e));
            self.close_connection();
            return Err(e);
        }
        Ok(())
    }

    pub fn send_command(&self, command: &Command) -> Result<(), SendError> {
        self.send(command.encode())
    }

    pub fn change_nickname(&self, nickname: impl Into<String>) -> Result<(), SendError> {
        self.send_command(&Command::Nick(nickname.into()))
    }

    pub fn request_directory(&self) -> Result<(), SendError> {
        self.send_command(&Command::List)
    }

    /// Send `body` privately to `target`
    ///
    /// `target_nickname` is informational; the server replaces it with the
    /// sender's nickname before delivery.
    pub fn send_private(
        &self,
        target: ConnectionId,
        body: impl Into<String>,
        target_nickname: Option<String>,
    ) -> Result<(), SendError> {
        let message = PrivateMessage::new(target, body, target_nickname);
        self.send_command(&Command::Private(message))
    }

    /// Ask the server to disconnect us, then close locally
    pub fn exit(&self) {
        if self.is_connected() {
            let _ = self.send_command(&Command::Exit);
        }
        self.close_connection();
    }

    /// Release the socket and move to `Disconnected`. Idempotent.
    pub fn close_connection(&self) {
        let connection = self.lock_connection().take();
        if let Some(connection) = connection {
            connection.close();
            self.events.info("Disconnected from the server.");
        }
        self.status.send_replace(ConnectionStatus::Disconnected);
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<Arc<Connection>>> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        let slot = self
            .connection
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(connection) = slot.take() {
            connection.close();
        }
    }
}

/// Periodically request the directory until the connection closes
async fn refresh_directory(connection: Arc<Connection>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = connection.closed() => break,
            _ = ticker.tick() => {
                if connection.send(LIST_COMMAND).is_err() {
                    break;
                }
            }
        }
    }
    debug!("Directory refresh stopped");
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_util::codec::{Framed, LinesCodec};

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    async fn fake_server() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn session_for(port: u16) -> ClientSession {
        ClientSession::new(ClientConfig::new("127.0.0.1", port, "alice"), EventSink::new())
    }

    async fn accept(listener: &TcpListener) -> Framed<TcpStream, LinesCodec> {
        let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
            .await
            .unwrap()
            .unwrap();
        Framed::new(stream, LinesCodec::new())
    }

    async fn next_line(peer: &mut Framed<TcpStream, LinesCodec>) -> Option<String> {
        tokio::time::timeout(WAIT, peer.next())
            .await
            .unwrap()
            .map(|line| line.unwrap())
    }

    async fn wait_for_status(session: &ClientSession, wanted: ConnectionStatus) {
        let mut status = session.watch_status();
        tokio::time::timeout(WAIT, status.wait_for(|status| *status == wanted))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_announces_nickname_and_receives() {
        let (listener, port) = fake_server().await;
        let session = session_for(port);
        let (line_tx, mut lines) = mpsc::unbounded_channel();

        session
            .start(move |line| {
                let _ = line_tx.send(line);
            })
            .await
            .unwrap();
        assert_eq!(session.status(), ConnectionStatus::Connected);

        let mut peer = accept(&listener).await;
        assert_eq!(next_line(&mut peer).await.as_deref(), Some("/nickname alice"));

        peer.send("Welcome, User 1!").await.unwrap();
        peer.send("User 2 has joined the chat.").await.unwrap();
        for expected in ["Welcome, User 1!", "User 2 has joined the chat."] {
            let line = tokio::time::timeout(WAIT, lines.recv()).await.unwrap();
            assert_eq!(line.as_deref(), Some(expected));
        }

        session.send("hello").unwrap();
        session.request_directory().unwrap();
        session
            .send_private(ConnectionId(2), "psst", Some("bob".to_string()))
            .unwrap();
        assert_eq!(next_line(&mut peer).await.as_deref(), Some("hello"));
        assert_eq!(next_line(&mut peer).await.as_deref(), Some("/allusers"));
        assert_eq!(
            next_line(&mut peer).await.as_deref(),
            Some("/privatepsst/clientId2/nicknamebob")
        );
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disconnected() {
        let (listener, port) = fake_server().await;
        drop(listener);

        let (events, mut event_rx) = EventSink::channel();
        let session = ClientSession::new(ClientConfig::new("127.0.0.1", port, "alice"), events);

        let result = session.start(|_| {}).await;
        assert!(matches!(result, Err(AppError::Connect { .. })));
        assert_eq!(session.status(), ConnectionStatus::Disconnected);

        let reported = std::iter::from_fn(|| event_rx.try_recv().ok())
            .any(|event| event.message.starts_with("Error connecting to server"));
        assert!(reported);

        // Sending without a connection fails soft
        assert_eq!(session.send("anyone?"), Err(SendError::NotConnected));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let (listener, port) = fake_server().await;
        let session = session_for(port);
        session.start(|_| {}).await.unwrap();
        let mut peer = accept(&listener).await;
        assert_eq!(next_line(&mut peer).await.as_deref(), Some("/nickname alice"));

        session.close_connection();
        session.close_connection();
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
        assert_eq!(session.send("late"), Err(SendError::NotConnected));

        // Server side sees the socket close
        assert_eq!(next_line(&mut peer).await, None);

        assert!(matches!(
            session.start(|_| {}).await,
            Err(AppError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (_listener, port) = fake_server().await;
        let session = session_for(port);
        session.start(|_| {}).await.unwrap();

        assert!(matches!(
            session.start(|_| {}).await,
            Err(AppError::AlreadyStarted)
        ));
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_server_hangup_moves_to_disconnected() {
        let (listener, port) = fake_server().await;
        let session = session_for(port);
        session.start(|_| {}).await.unwrap();

        let peer = accept(&listener).await;
        drop(peer);

        wait_for_status(&session, ConnectionStatus::Disconnected).await;
        assert_eq!(session.send("hello?"), Err(SendError::NotConnected));
    }

    #[tokio::test]
    async fn test_exit_sends_exit_then_closes() {
        let (listener, port) = fake_server().await;
        let session = session_for(port);
        session.start(|_| {}).await.unwrap();
        let mut peer = accept(&listener).await;

        session.exit();
        session.exit();

        assert_eq!(next_line(&mut peer).await.as_deref(), Some("/nickname alice"));
        assert_eq!(next_line(&mut peer).await.as_deref(), Some("/exit"));
        assert_eq!(next_line(&mut peer).await, None);
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_directory_refresh() {
        let (listener, port) = fake_server().await;
        let config = ClientConfig::new("127.0.0.1", port, "alice")
            .with_directory_refresh(Duration::from_millis(20));
        let session = ClientSession::new(config, EventSink::new());
        session.start(|_| {}).await.unwrap();
        let mut peer = accept(&listener).await;

        assert_eq!(next_line(&mut peer).await.as_deref(), Some("/nickname alice"));
        assert_eq!(next_line(&mut peer).await.as_deref(), Some("/allusers"));
        assert_eq!(next_line(&mut peer).await.as_deref(), Some("/allusers"));
    }
}
