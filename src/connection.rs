//! Connection handle
//!
//! Wraps one line-framed socket. Outbound lines are queued on an
//! unbounded channel and written by a dedicated writer task, so `send`
//! never waits on the peer and lines from different senders are never
//! interleaved. Inbound lines are handed to a callback, one at a time,
//! in arrival order. Bytes that are not valid UTF-8 are replaced with
//! U+FFFD rather than failing the connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{AnyDelimiterCodec, Framed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SendError;
use crate::types::ConnectionId;

/// Default maximum length of a single line, in bytes
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// How long a closing connection may spend flushing queued lines
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Receiving end of a connection's outbound queue, consumed by the
/// writer task started in [`Connection::receive_loop`].
pub type Outbound = mpsc::UnboundedReceiver<String>;

/// Wire framing: raw newline-delimited chunks, decoded by [`decode_line`]
pub type LineFramed<S> = Framed<S, AnyDelimiterCodec>;

/// Wrap a stream in the newline framing used on the wire
pub fn framed<S>(stream: S, max_line_length: usize) -> LineFramed<S>
where
    S: AsyncRead + AsyncWrite,
{
    let codec =
        AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_line_length);
    Framed::new(stream, codec)
}

/// Turn one received chunk into a line: drop a trailing `\r` and replace
/// invalid UTF-8 sequences
pub fn decode_line(chunk: &[u8]) -> String {
    let chunk = chunk.strip_suffix(b"\r").unwrap_or(chunk);
    String::from_utf8_lossy(chunk).into_owned()
}

/// One live connection
///
/// Shared as `Arc<Connection>` between the registry, the connection's own
/// task and anyone delivering lines to it.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    nickname: RwLock<Option<String>>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Create a handle and the receiving end of its outbound queue
    ///
    /// `shutdown` is usually a child of a server-wide token so the whole
    /// server can be torn down at once.
    pub fn new(
        id: ConnectionId,
        peer_addr: Option<SocketAddr>,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, Outbound) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let connection = Self {
            id,
            peer_addr,
            nickname: RwLock::new(None),
            outbound,
            shutdown,
        };
        (Arc::new(connection), outbound_rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn nickname(&self) -> Option<String> {
        self.nickname
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_nickname(&self, nickname: impl Into<String>) {
        *self.nickname.write().unwrap_or_else(PoisonError::into_inner) = Some(nickname.into());
    }

    /// Nickname if set and non-blank, otherwise `User_<id>`
    pub fn display_name(&self) -> String {
        match self.nickname() {
            Some(name) if !name.trim().is_empty() => name,
            _ => self.id.default_display_name(),
        }
    }

    /// Queue one line for the peer
    ///
    /// Fails with `SendError::ChannelClosed` once the connection is
    /// closing; the failure is logged here and callers may ignore it.
    pub fn send(&self, line: impl Into<String>) -> Result<(), SendError> {
        if self.shutdown.is_cancelled() {
            debug!("Dropping line for closed connection {}", self.id);
            return Err(SendError::ChannelClosed);
        }

        self.outbound.send(line.into()).map_err(|_| {
            debug!("Writer for connection {} is gone, dropping line", self.id);
            SendError::ChannelClosed
        })
    }

    /// Close the connection. Idempotent.
    ///
    /// Lines already queued are still flushed before the socket shuts down.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("Closing connection {}", self.id);
            self.shutdown.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the connection has been closed
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Read lines until end-of-stream, a read error, or `close()`
    ///
    /// `on_line` runs once per line, sequentially, in arrival order.
    /// `on_close` runs exactly once, as soon as the loop ends and before
    /// the writer finishes flushing. The connection is closed and the
    /// writer stopped when this returns.
    pub async fn receive_loop<S, F, Fut, C, CFut>(
        &self,
        framed: LineFramed<S>,
        outbound: Outbound,
        mut on_line: F,
        on_close: C,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: FnMut(String) -> Fut,
        Fut: Future<Output = ()>,
        C: FnOnce() -> CFut,
        CFut: Future<Output = ()>,
    {
        let (sink, mut lines) = framed.split::<String>();
        let mut writer = tokio::spawn(write_loop(
            self.id,
            sink,
            outbound,
            self.shutdown.clone(),
        ));

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("Connection {} closed locally", self.id);
                    break;
                }
                frame = lines.next() => match frame {
                    Some(Ok(chunk)) => on_line(decode_line(&chunk)).await,
                    Some(Err(e)) => {
                        warn!("Read error on connection {}: {}", self.id, e);
                        break;
                    }
                    None => {
                        debug!("Connection {} reached end of stream", self.id);
                        break;
                    }
                },
            }
        }

        self.close();
        on_close().await;

        match tokio::time::timeout(CLOSE_GRACE, &mut writer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Writer task for connection {} failed: {}", self.id, e),
            Err(_) => {
                debug!("Writer for connection {} did not flush in time", self.id);
                writer.abort();
            }
        }
    }
}

/// Drain the outbound queue into the socket until shutdown, then flush
/// whatever was queued before the close and shut the write half down.
async fn write_loop<S>(
    id: ConnectionId,
    mut sink: SplitSink<LineFramed<S>, String>,
    mut outbound: Outbound,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            line = outbound.recv() => {
                let Some(line) = line else {
                    break;
                };
                if let Err(e) = sink.send(line).await {
                    debug!("Write failed on connection {}: {}", id, e);
                    shutdown.cancel();
                    return;
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    while let Ok(line) = outbound.try_recv() {
        if sink.send(line).await.is_err() {
            break;
        }
    }

    let _ = sink.close().await;
    debug!("Writer for connection {} finished", id);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::LinesCodec;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    /// Spawn a receive loop over one end of an in-memory pipe and return
    /// the other end, a channel of received lines and a close counter.
    fn spawn_loop(
        connection: &Arc<Connection>,
        outbound: Outbound,
    ) -> (
        Framed<tokio::io::DuplexStream, LinesCodec>,
        mpsc::UnboundedReceiver<String>,
        Arc<AtomicUsize>,
        tokio::task::JoinHandle<()>,
    ) {
        let (local, remote) = tokio::io::duplex(4096);
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let connection = Arc::clone(connection);
            let closes = Arc::clone(&closes);
            async move {
                connection
                    .receive_loop(
                        framed(local, 1024),
                        outbound,
                        move |line| {
                            let _ = line_tx.send(line);
                            async {}
                        },
                        move || {
                            closes.fetch_add(1, Ordering::SeqCst);
                            async {}
                        },
                    )
                    .await;
            }
        });

        (Framed::new(remote, LinesCodec::new()), line_rx, closes, task)
    }

    #[test]
    fn test_display_name() {
        let (connection, _outbound) =
            Connection::new(ConnectionId(3), None, CancellationToken::new());
        assert_eq!(connection.nickname(), None);
        assert_eq!(connection.display_name(), "User_3");

        connection.set_nickname("   ");
        assert_eq!(connection.display_name(), "User_3");

        connection.set_nickname("dave");
        connection.set_nickname("eve");
        assert_eq!(connection.nickname().as_deref(), Some("eve"));
        assert_eq!(connection.display_name(), "eve");
    }

    #[test]
    fn test_close_is_idempotent() {
        let (connection, _outbound) =
            Connection::new(ConnectionId(1), None, CancellationToken::new());
        assert!(connection.send("before").is_ok());

        connection.close();
        connection.close();

        assert!(connection.is_closed());
        assert_eq!(connection.send("after"), Err(SendError::ChannelClosed));
    }

    #[test]
    fn test_parent_token_closes_connection() {
        let parent = CancellationToken::new();
        let (connection, _outbound) = Connection::new(ConnectionId(1), None, parent.child_token());
        parent.cancel();
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_receive_loop_delivers_lines_in_order() {
        let (connection, outbound) =
            Connection::new(ConnectionId(1), None, CancellationToken::new());
        let (mut remote, mut lines, closes, task) = spawn_loop(&connection, outbound);

        for line in ["one", "two", "three"] {
            remote.send(line).await.unwrap();
        }
        for expected in ["one", "two", "three"] {
            let line = tokio::time::timeout(WAIT, lines.recv()).await.unwrap();
            assert_eq!(line.as_deref(), Some(expected));
        }

        // End of stream terminates the loop
        drop(remote);
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(connection.is_closed());
        assert_eq!(connection.send("late"), Err(SendError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (connection, outbound) =
            Connection::new(ConnectionId(1), None, CancellationToken::new());
        let (mut remote, _lines, _closes, _task) = spawn_loop(&connection, outbound);

        connection.send("hello").unwrap();
        connection.send("world").unwrap();

        let first = tokio::time::timeout(WAIT, remote.next()).await.unwrap();
        let second = tokio::time::timeout(WAIT, remote.next()).await.unwrap();
        assert_eq!(first.unwrap().unwrap(), "hello");
        assert_eq!(second.unwrap().unwrap(), "world");
    }

    #[tokio::test]
    async fn test_close_flushes_queued_lines_then_ends() {
        let (connection, outbound) =
            Connection::new(ConnectionId(1), None, CancellationToken::new());
        let (mut remote, _lines, closes, task) = spawn_loop(&connection, outbound);

        connection.send("goodbye").unwrap();
        connection.close();

        let line = tokio::time::timeout(WAIT, remote.next()).await.unwrap();
        assert_eq!(line.unwrap().unwrap(), "goodbye");

        // Write half was shut down after the flush
        let end = tokio::time::timeout(WAIT, remote.next()).await.unwrap();
        assert!(end.is_none());

        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_senders_do_not_interleave() {
        let (connection, outbound) =
            Connection::new(ConnectionId(1), None, CancellationToken::new());
        let (mut remote, _lines, _closes, _task) = spawn_loop(&connection, outbound);

        let mut senders = Vec::new();
        for sender in 0..4 {
            let connection = Arc::clone(&connection);
            senders.push(tokio::spawn(async move {
                for n in 0..25 {
                    connection
                        .send(format!("sender-{}-line-{}-{}", sender, n, "x".repeat(64)))
                        .unwrap();
                }
            }));
        }
        for sender in senders {
            sender.await.unwrap();
        }

        let mut last_seen = [None::<usize>; 4];
        for _ in 0..100 {
            let line = tokio::time::timeout(WAIT, remote.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let parts: Vec<&str> = line.split('-').collect();
            assert_eq!(parts.len(), 5, "torn line: {}", line);
            assert_eq!(parts[4], "x".repeat(64));

            // Each sender's own lines stay in order
            let sender: usize = parts[1].parse().unwrap();
            let n: usize = parts[3].parse().unwrap();
            if let Some(previous) = last_seen[sender] {
                assert!(n > previous);
            }
            last_seen[sender] = Some(n);
        }
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"hello"), "hello");
        assert_eq!(decode_line(b"hello\r"), "hello");
        assert_eq!(decode_line(b"caf\xe9"), "caf\u{FFFD}");
        assert_eq!(decode_line(b""), "");
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_end_connection() {
        let (connection, outbound) =
            Connection::new(ConnectionId(1), None, CancellationToken::new());
        let (mut remote, mut lines, closes, _task) = spawn_loop(&connection, outbound);

        remote.get_mut().write_all(b"caf\xe9\r\nok\n").await.unwrap();

        for expected in ["caf\u{FFFD}", "ok"] {
            let line = tokio::time::timeout(WAIT, lines.recv()).await.unwrap();
            assert_eq!(line.as_deref(), Some(expected));
        }
        assert!(!connection.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_reported_before_writer_finishes() {
        let (connection, outbound) =
            Connection::new(ConnectionId(1), None, CancellationToken::new());
        let (mut remote, _lines, closes, task) = spawn_loop(&connection, outbound);

        // More than the pipe holds, and the peer never reads it
        connection.send("z".repeat(16 * 1024)).unwrap();
        remote.get_mut().shutdown().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while closes.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("close was not reported while the writer was blocked");
        assert!(!task.is_finished());

        // The stuck writer is given up on after the grace period
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_overlong_line_ends_connection() {
        let (connection, outbound) =
            Connection::new(ConnectionId(1), None, CancellationToken::new());
        let (mut remote, _lines, closes, task) = spawn_loop(&connection, outbound);

        remote.send("y".repeat(2048)).await.unwrap();

        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(connection.is_closed());
    }
}
