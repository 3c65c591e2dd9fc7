//! Per-socket connection state machine.
//!
//! `Connected → AwaitingHandshake → Ready → Closing → Closed`. The machine
//! is transport-free: [`Connection::handle_envelope`] consumes one decoded envelope and
//! says what to write back and whether to keep reading. The server's I/O loop
//! owns the socket and the outbound queue.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::codec::CodecError;
use super::config::DirectoryConfig;
use super::handshake::{ClientHandshake, DirectoryHandshake, RejectReason};
use super::message::{Envelope, MessageKind};
use super::metrics;
use super::peers::{Peer, PeerHandle, RegisterError};
use super::router::{RouteError, Router, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    AwaitingHandshake,
    Ready,
    Closing,
    Closed,
}

/// A message that is not allowed in the connection's current state, or a
/// fatal routing error. Closes the connection without a reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("{0} before handshake")]
    BeforeHandshake(MessageKind),
    #[error("second handshake on a ready connection")]
    RepeatHandshake,
    #[error("{0} may only be sent by a directory")]
    DirectoryOnly(MessageKind),
    #[error(transparent)]
    Route(RouteError),
}

/// Why a connection ended abnormally.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(CodecError),
    #[error("protocol violation: {0}")]
    Violation(#[from] ProtocolViolation),
    #[error("no handshake within {0:?}")]
    HandshakeTimeout(std::time::Duration),
    #[error("closed by the directory")]
    ForcedClose,
    #[error("directory shutting down")]
    Shutdown,
}

impl From<CodecError> for ConnectionError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(io) => Self::Transport(io),
            other => Self::Decode(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Flush anything queued, then close.
    Close,
}

/// Result of handling one inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub reply: Option<Envelope>,
    pub flow: Flow,
}

impl Step {
    fn cont() -> Self {
        Self {
            reply: None,
            flow: Flow::Continue,
        }
    }

    fn reply(env: Envelope) -> Self {
        Self {
            reply: Some(env),
            flow: Flow::Continue,
        }
    }
}

pub struct Connection {
    label: String,
    state: ConnectionState,
    handle: PeerHandle,
    /// Our own directory entry once registered.
    peer: Option<Peer>,
    config: Arc<DirectoryConfig>,
    router: Router,
}

impl Connection {
    /// A fresh connection in `Connected`. `label` identifies it in logs.
    pub fn new(
        id: u64,
        label: impl Into<String>,
        config: Arc<DirectoryConfig>,
        router: Router,
    ) -> (Self, mpsc::Receiver<Envelope>) {
        let (handle, rx) = PeerHandle::new(id, config.outbound_queue);
        let conn = Self {
            label: label.into(),
            state: ConnectionState::Connected,
            handle,
            peer: None,
            config,
            router,
        };
        (conn, rx)
    }

    /// Transport accepted; wait for the client's HANDSHAKE.
    pub fn start(&mut self) {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::AwaitingHandshake;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn handle(&self) -> &PeerHandle {
        &self.handle
    }

    pub fn nick(&self) -> Option<&str> {
        self.peer.as_ref().map(|p| p.nick.as_str())
    }

    /// Process one inbound envelope.
    pub async fn handle_envelope(&mut self, env: Envelope) -> Result<Step, ProtocolViolation> {
        self.handle.touch();

        match self.state {
            ConnectionState::Connected | ConnectionState::AwaitingHandshake => {
                self.handle_unregistered(env).await
            }
            ConnectionState::Ready => self.handle_ready(env).await,
            ConnectionState::Closing | ConnectionState::Closed => Ok(Step {
                reply: None,
                flow: Flow::Close,
            }),
        }
    }

    async fn handle_unregistered(&mut self, env: Envelope) -> Result<Step, ProtocolViolation> {
        match env.kind {
            MessageKind::Handshake => Ok(self.handshake(&env.line).await),
            MessageKind::Disconnect => Ok(self.closing()),
            kind if kind.is_directory_only() => Err(ProtocolViolation::DirectoryOnly(kind)),
            kind => Err(ProtocolViolation::BeforeHandshake(kind)),
        }
    }

    async fn handle_ready(&mut self, env: Envelope) -> Result<Step, ProtocolViolation> {
        let Some(peer) = self.peer.as_ref() else {
            return Err(ProtocolViolation::BeforeHandshake(env.kind));
        };
        let sender = Sender::of(peer);

        match env.kind {
            MessageKind::Ping => Ok(Step::reply(Envelope::bare(MessageKind::Pong))),
            MessageKind::GetPeerList => Ok(Step::reply(self.router.get_peer_list().await)),
            MessageKind::PubMsg => {
                self.router
                    .broadcast(sender, &env)
                    .await
                    .map_err(ProtocolViolation::Route)?;
                Ok(Step::cont())
            }
            MessageKind::PrivMsg => match self.router.route_private(sender, &env).await {
                Ok(()) => Ok(Step::cont()),
                Err(e) if e.is_fatal() => Err(ProtocolViolation::Route(e)),
                Err(e) => {
                    debug!(conn = %self.label, nick = %sender.nick, "privmsg dropped: {e}");
                    Ok(Step::cont())
                }
            },
            MessageKind::Disconnect => Ok(self.closing()),
            MessageKind::Handshake => Err(ProtocolViolation::RepeatHandshake),
            kind @ (MessageKind::PeerList | MessageKind::DnHandshake | MessageKind::Pong) => {
                Err(ProtocolViolation::DirectoryOnly(kind))
            }
        }
    }

    async fn handshake(&mut self, line: &str) -> Step {
        match self.admit(line).await {
            Ok(peer) => {
                info!(
                    conn = %self.label,
                    nick = %peer.nick,
                    location = peer.location.as_deref().unwrap_or("-"),
                    "peer registered"
                );
                metrics::incr(metrics::HANDSHAKES_ACCEPTED);
                self.peer = Some(peer);
                self.state = ConnectionState::Ready;
                Step::reply(self.dn_handshake(true))
            }
            Err(reason) => {
                warn!(conn = %self.label, "handshake rejected: {reason}");
                metrics::incr(metrics::HANDSHAKES_REJECTED);
                self.state = ConnectionState::Closing;
                Step {
                    reply: Some(self.dn_handshake(false)),
                    flow: Flow::Close,
                }
            }
        }
    }

    async fn admit(&self, line: &str) -> Result<Peer, RejectReason> {
        let hs = ClientHandshake::parse(line).map_err(|e| RejectReason::Malformed(e.to_string()))?;
        hs.check(&self.config)?;

        let peer = Peer::new(
            hs.nick.clone(),
            hs.reachable_location().map(str::to_string),
            self.handle.clone(),
        );
        self.router
            .peers()
            .register(peer.clone())
            .await
            .map_err(|e| match e {
                RegisterError::DuplicateNick(nick) => RejectReason::DuplicateNick(nick),
                RegisterError::Full(_) => RejectReason::DirectoryFull,
            })?;
        Ok(peer)
    }

    fn dn_handshake(&self, accepted: bool) -> Envelope {
        let descriptor = DirectoryHandshake::from_config(&self.config, accepted);
        let line = descriptor
            .to_json()
            .expect("directory descriptor holds only strings, bools and integers");
        Envelope::new(MessageKind::DnHandshake, line)
    }

    fn closing(&mut self) -> Step {
        debug!(conn = %self.label, "disconnect requested");
        self.state = ConnectionState::Closing;
        Step {
            reply: None,
            flow: Flow::Close,
        }
    }

    /// Tear down: leave the directory and mark the connection closed.
    /// Idempotent.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.handle.close();
        if let Some(peer) = self.peer.take() {
            let peers = self.router.peers();
            // Only remove the entry if it is still ours.
            if peers
                .lookup(&peer.nick)
                .await
                .is_some_and(|p| p.handle.id() == self.handle.id())
            {
                peers.unregister(&peer.nick).await;
            }
            info!(conn = %self.label, nick = %peer.nick, "peer unregistered");
        }
    }
}
