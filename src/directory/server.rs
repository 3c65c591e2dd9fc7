//! Directory server: listener, accept loop and per-connection I/O.
//!
//! Each accepted socket gets its own task that owns the framed stream and
//! the connection's outbound queue. Replies to a peer's own requests are
//! written directly; traffic from other peers arrives through the queue.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{CodecError, EnvelopeCodec};
use super::config::DirectoryConfig;
use super::connection::{Connection, ConnectionError, Flow};
use super::keepalive;
use super::message::Envelope;
use super::metrics;
use super::peers::{PeerDirectory, PeerHandle};
use super::router::Router;

/// A directory bound to a socket and serving connections.
pub struct RunningDirectory {
    local_addr: SocketAddr,
    peers: PeerDirectory,
    shutdown: CancellationToken,
    accept: JoinHandle<Result<(), std::io::Error>>,
    keepalive: JoinHandle<()>,
}

impl RunningDirectory {
    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the accept loop exits (listener error or shutdown).
    pub async fn wait(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let result = self.accept.await;
        self.shutdown.cancel();
        let _ = self.keepalive.await;
        result??;
        Ok(())
    }

    /// Stop accepting, close every connection and wait for the loop to exit.
    pub async fn shutdown(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.shutdown.cancel();
        self.wait().await
    }
}

/// Bind the listener and start serving. Fails fast if the address is taken.
pub async fn start(config: DirectoryConfig) -> std::io::Result<RunningDirectory> {
    let listener = TcpListener::bind(&config.bind).await?;
    let local_addr = listener.local_addr()?;
    info!(
        %local_addr,
        network = %config.network,
        nick = %config.nick,
        "directory listening"
    );

    let peers = PeerDirectory::with_capacity(config.max_peers);
    let shutdown = CancellationToken::new();
    let keepalive = keepalive::spawn(
        peers.clone(),
        config.sweep_interval(),
        config.idle_timeout(),
        shutdown.clone(),
    );

    let config = Arc::new(config);
    let router = Router::new(peers.clone());
    let accept = tokio::spawn(accept_loop(listener, config, router, shutdown.clone()));

    Ok(RunningDirectory {
        local_addr,
        peers,
        shutdown,
        accept,
        keepalive,
    })
}

/// Run a directory until Ctrl-C.
pub async fn run(config: DirectoryConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let directory = start(config).await?;
    let shutdown = directory.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            shutdown.cancel();
        }
    });
    directory.wait().await
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<DirectoryConfig>,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let mut next_id: u64 = 0;
    loop {
        let (socket, addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.cancelled() => break,
        };
        next_id += 1;
        info!(%addr, id = next_id, "new connection");
        metrics::incr(metrics::CONNECTIONS_ACCEPTED);

        let (conn, rx) = Connection::new(
            next_id,
            addr.to_string(),
            Arc::clone(&config),
            router.clone(),
        );
        let handshake_timeout = config.handshake_timeout;
        let shutdown = shutdown.child_token();
        tokio::spawn(async move {
            match serve_connection(socket, conn, rx, handshake_timeout, shutdown).await {
                Ok(()) => {}
                Err(ConnectionError::ForcedClose) => info!(%addr, "closed by directory"),
                Err(ConnectionError::Transport(e)) => debug!(%addr, "transport error: {e}"),
                Err(e) => warn!(%addr, "client error: {e}"),
            }
            info!(%addr, "disconnected");
        });
    }

    // Stop live connections as well.
    for peer in router.peers().snapshot().await {
        peer.handle.close();
    }
    Ok(())
}

/// Drive one connection to completion over any byte stream.
pub async fn serve_connection<S>(
    stream: S,
    mut conn: Connection,
    mut rx: mpsc::Receiver<Envelope>,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    metrics::gauge_add(metrics::CONNECTIONS_ACTIVE, 1.0);
    let mut framed = Framed::new(stream, EnvelopeCodec);
    let handle = conn.handle().clone();
    let handshake_deadline = tokio::time::sleep(handshake_timeout);
    tokio::pin!(handshake_deadline);

    conn.start();

    let result: Result<(), ConnectionError> = loop {
        tokio::select! {
            frame = framed.next() => {
                let env = match frame {
                    Some(Ok(env)) => env,
                    Some(Err(e)) => break Err(e.into()),
                    None => break Ok(()),
                };
                metrics::incr(metrics::MESSAGES_RECEIVED);
                debug!(nick = conn.nick().unwrap_or("-"), kind = %env.kind, "received");

                let step = match conn.handle_envelope(env).await {
                    Ok(step) => step,
                    Err(v) => break Err(v.into()),
                };
                if let Some(reply) = step.reply {
                    if let Err(e) = guarded(framed.send(reply), &handle, &shutdown).await {
                        break Err(e);
                    }
                }
                if step.flow == Flow::Close {
                    break guarded(flush_queue(&mut framed, &mut rx), &handle, &shutdown).await;
                }
            }

            // Forwarded traffic from other peers.
            Some(env) = rx.recv() => {
                if let Err(e) = guarded(framed.send(env), &handle, &shutdown).await {
                    break Err(e);
                }
            }

            _ = handle.closed() => break Err(ConnectionError::ForcedClose),

            _ = shutdown.cancelled() => break Err(ConnectionError::Shutdown),

            _ = &mut handshake_deadline, if conn.nick().is_none() => {
                break Err(ConnectionError::HandshakeTimeout(handshake_timeout));
            }
        }
    };

    if matches!(
        result,
        Err(ConnectionError::Decode(_)) | Err(ConnectionError::Violation(_))
    ) {
        metrics::incr(metrics::PROTOCOL_VIOLATIONS);
    }

    conn.close().await;
    metrics::gauge_add(metrics::CONNECTIONS_ACTIVE, -1.0);
    match result {
        Err(ConnectionError::Shutdown) => Ok(()),
        other => other,
    }
}

/// Run a socket write, abandoning it as soon as the peer is told to close
/// or the server stops. A peer that stops reading must not pin its task.
async fn guarded<F>(
    write: F,
    handle: &PeerHandle,
    shutdown: &CancellationToken,
) -> Result<(), ConnectionError>
where
    F: Future<Output = Result<(), CodecError>>,
{
    tokio::select! {
        written = write => written.map_err(Into::into),
        _ = handle.closed() => Err(ConnectionError::ForcedClose),
        _ = shutdown.cancelled() => Err(ConnectionError::Shutdown),
    }
}

/// Write out whatever is still queued, then flush.
async fn flush_queue<S>(
    framed: &mut Framed<S, EnvelopeCodec>,
    rx: &mut mpsc::Receiver<Envelope>,
) -> Result<(), CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Ok(env) = rx.try_recv() {
        framed.feed(env).await?;
    }
    framed.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::handshake::{ClientHandshake, DirectoryHandshake, NOT_SERVING};
    use crate::directory::message::MessageKind;
    use crate::directory::peers::Delivery;
    use pretty_assertions::assert_eq;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    const NICK: &str = "J5xhGSWE7VrxOOOO";

    struct Client {
        reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, env: &Envelope) {
            let mut bytes = env.to_json().unwrap().into_bytes();
            bytes.extend_from_slice(b"\r\n");
            self.writer.write_all(&bytes).await.unwrap();
        }

        async fn send_raw(&mut self, raw: &[u8]) {
            self.writer.write_all(raw).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Envelope> {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await.unwrap() == 0 {
                return None;
            }
            assert!(line.ends_with("\r\n"), "{line:?}");
            Some(EnvelopeCodec::parse_frame(line.trim_end().as_bytes()).unwrap())
        }
    }

    fn spawn_conn(
        config: DirectoryConfig,
        peers: &PeerDirectory,
    ) -> (Client, JoinHandle<Result<(), ConnectionError>>) {
        spawn_conn_with_buffer(config, peers, 64 * 1024)
    }

    /// Like [`spawn_conn`], with a socket that holds at most `buffer` bytes
    /// the client has not read yet.
    fn spawn_conn_with_buffer(
        config: DirectoryConfig,
        peers: &PeerDirectory,
        buffer: usize,
    ) -> (Client, JoinHandle<Result<(), ConnectionError>>) {
        let (client, server) = duplex(buffer);
        let timeout = config.handshake_timeout;
        let (conn, rx) = Connection::new(1, "duplex", Arc::new(config), Router::new(peers.clone()));
        let task = tokio::spawn(serve_connection(
            server,
            conn,
            rx,
            timeout,
            CancellationToken::new(),
        ));
        let (r, w) = tokio::io::split(client);
        (
            Client {
                reader: BufReader::new(r),
                writer: w,
            },
            task,
        )
    }

    /// A PRIVMSG to us that is bigger than the small test socket buffer.
    fn bulky_privmsg() -> Envelope {
        Envelope::privmsg(format!("J5other!{NICK}!!{}", "x".repeat(2048)))
    }

    fn handshake() -> Envelope {
        let hs = ClientHandshake::client(NICK, "mainnet");
        Envelope::new(MessageKind::Handshake, hs.to_json().unwrap())
    }

    #[tokio::test]
    async fn handshake_ping_disconnect() {
        let peers = PeerDirectory::new();
        let (mut client, task) = spawn_conn(DirectoryConfig::default(), &peers);

        client.send(&handshake()).await;
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.kind, MessageKind::DnHandshake);
        assert!(DirectoryHandshake::parse(&reply.line).unwrap().accepted);
        assert!(peers.lookup(NICK).await.is_some());

        client.send(&Envelope::bare(MessageKind::Ping)).await;
        assert_eq!(client.recv().await, Some(Envelope::bare(MessageKind::Pong)));

        client.send(&Envelope::bare(MessageKind::Disconnect)).await;
        assert_eq!(client.recv().await, None);
        task.await.unwrap().unwrap();
        assert!(peers.lookup(NICK).await.is_none());
    }

    #[tokio::test]
    async fn rejected_handshake_sends_one_reply_then_closes() {
        let peers = PeerDirectory::new();
        let (mut client, task) = spawn_conn(DirectoryConfig::default(), &peers);

        let mut hs = ClientHandshake::client(NICK, "testnet");
        hs.location = NOT_SERVING.into();
        client
            .send(&Envelope::new(MessageKind::Handshake, hs.to_json().unwrap()))
            .await;

        let reply = client.recv().await.unwrap();
        assert!(!DirectoryHandshake::parse(&reply.line).unwrap().accepted);
        assert_eq!(client.recv().await, None);
        task.await.unwrap().unwrap();
        assert!(peers.is_empty().await);
    }

    #[tokio::test]
    async fn message_before_handshake_closes_silently() {
        let peers = PeerDirectory::new();
        let (mut client, task) = spawn_conn(DirectoryConfig::default(), &peers);

        client.send(&Envelope::bare(MessageKind::GetPeerList)).await;
        assert_eq!(client.recv().await, None);
        assert!(matches!(
            task.await.unwrap(),
            Err(ConnectionError::Violation(_))
        ));
    }

    #[tokio::test]
    async fn unknown_type_is_a_decode_error() {
        let peers = PeerDirectory::new();
        let (mut client, task) = spawn_conn(DirectoryConfig::default(), &peers);

        client.send(&handshake()).await;
        client.recv().await.unwrap();
        client.send_raw(b"{\"type\":686,\"line\":\"\"}\r\n").await;

        assert_eq!(client.recv().await, None);
        assert!(matches!(
            task.await.unwrap(),
            Err(ConnectionError::Decode(CodecError::UnknownType(686)))
        ));
        assert!(peers.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_timeout_closes_connection() {
        let peers = PeerDirectory::new();
        let config = DirectoryConfig {
            handshake_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let (mut client, task) = spawn_conn(config, &peers);

        assert_eq!(client.recv().await, None);
        assert!(matches!(
            task.await.unwrap(),
            Err(ConnectionError::HandshakeTimeout(_))
        ));
    }

    #[tokio::test]
    async fn queued_forward_is_written_to_socket() {
        let peers = PeerDirectory::new();
        let (mut client, _task) = spawn_conn(DirectoryConfig::default(), &peers);
        client.send(&handshake()).await;
        client.recv().await.unwrap();

        let me = peers.lookup(NICK).await.unwrap();
        let env = Envelope::privmsg(format!("J5other!{NICK}!!hello"));
        me.handle.deliver(env.clone());
        assert_eq!(client.recv().await, Some(env));
    }

    #[tokio::test]
    async fn forced_close_unregisters() {
        let peers = PeerDirectory::new();
        let (mut client, task) = spawn_conn(DirectoryConfig::default(), &peers);
        client.send(&handshake()).await;
        client.recv().await.unwrap();

        peers.lookup(NICK).await.unwrap().handle.close();
        assert!(matches!(
            task.await.unwrap(),
            Err(ConnectionError::ForcedClose)
        ));
        assert!(peers.is_empty().await);
        assert_eq!(client.recv().await, None);
    }

    #[tokio::test]
    async fn disconnect_flushes_queued_forwards_first() {
        let peers = PeerDirectory::new();
        let (mut client, task) = spawn_conn(DirectoryConfig::default(), &peers);
        client.send(&handshake()).await;
        client.recv().await.unwrap();

        let me = peers.lookup(NICK).await.unwrap();
        let first = Envelope::privmsg(format!("J5other!{NICK}!!one"));
        let second = Envelope::privmsg(format!("J5other!{NICK}!!two"));
        assert_eq!(me.handle.deliver(first.clone()), Delivery::Queued);
        assert_eq!(me.handle.deliver(second.clone()), Delivery::Queued);
        client.send(&Envelope::bare(MessageKind::Disconnect)).await;

        assert_eq!(client.recv().await, Some(first));
        assert_eq!(client.recv().await, Some(second));
        assert_eq!(client.recv().await, None);
        task.await.unwrap().unwrap();
        assert!(peers.is_empty().await);
    }

    #[tokio::test]
    async fn close_interrupts_a_blocked_write() {
        let peers = PeerDirectory::new();
        let (mut client, task) =
            spawn_conn_with_buffer(DirectoryConfig::default(), &peers, 1024);
        client.send(&handshake()).await;
        client.recv().await.unwrap();

        // The client stops reading; the first write fills the socket.
        let me = peers.lookup(NICK).await.unwrap();
        for _ in 0..3 {
            assert_eq!(me.handle.deliver(bulky_privmsg()), Delivery::Queued);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        me.handle.close();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("connection task stuck in a write")
            .unwrap();
        assert!(matches!(result, Err(ConnectionError::ForcedClose)));
        assert!(peers.lookup(NICK).await.is_none());
    }

    #[tokio::test]
    async fn overflowing_a_stalled_peer_unregisters_it() {
        let peers = PeerDirectory::new();
        let config = DirectoryConfig {
            outbound_queue: 2,
            ..Default::default()
        };
        let (mut client, task) = spawn_conn_with_buffer(config, &peers, 1024);
        client.send(&handshake()).await;
        client.recv().await.unwrap();

        let me = peers.lookup(NICK).await.unwrap();
        assert_eq!(me.handle.deliver(bulky_privmsg()), Delivery::Queued);
        // Let the task pick it up and block writing it.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut overflowed = false;
        for _ in 0..4 {
            if me.handle.deliver(bulky_privmsg()) == Delivery::Overflowed {
                overflowed = true;
                break;
            }
        }
        assert!(overflowed);

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("stalled peer was never torn down")
            .unwrap();
        assert!(matches!(result, Err(ConnectionError::ForcedClose)));
        assert!(peers.lookup(NICK).await.is_none());
        drop(client);
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_blocked_write() {
        let peers = PeerDirectory::new();
        let (client, server) = duplex(1024);
        let config = DirectoryConfig::default();
        let timeout = config.handshake_timeout;
        let (conn, rx) = Connection::new(1, "duplex", Arc::new(config), Router::new(peers.clone()));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve_connection(server, conn, rx, timeout, shutdown.clone()));

        let (r, w) = tokio::io::split(client);
        let mut client = Client {
            reader: BufReader::new(r),
            writer: w,
        };
        client.send(&handshake()).await;
        client.recv().await.unwrap();

        let me = peers.lookup(NICK).await.unwrap();
        me.handle.deliver(bulky_privmsg());
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("shutdown did not reach the connection")
            .unwrap()
            .unwrap();
        assert!(peers.is_empty().await);
    }
}
