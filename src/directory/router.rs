//! Router: dispatches application envelopes from Ready peers.
//!
//! GETPEERLIST is answered from a directory snapshot, PUBMSG fans out to
//! every other registered peer, PRIVMSG goes to exactly one recipient
//! followed by a single-entry PEERLIST naming the sender. Forwarded envelopes
//! are the originals, unchanged. Delivery never blocks: a peer whose queue is
//! full is closed instead.

use tracing::debug;

use super::line::{AppLine, LineError};
use super::message::{Envelope, MessageKind};
use super::metrics;
use super::peerlist;
use super::peers::{Delivery, Peer, PeerDirectory};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("malformed line: {0}")]
    Line(#[from] LineError),
    #[error("PUBMSG addressed to {0:?} instead of PUBLIC")]
    NotBroadcast(String),
    #[error("sender {actual} claimed to be {claimed}")]
    SpoofedSender { claimed: String, actual: String },
    #[error("no peer named {0}")]
    UnknownRecipient(String),
}

impl RouteError {
    /// Whether the error ends the sender's connection. Only an unknown
    /// recipient is survivable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::UnknownRecipient(_))
    }
}

/// The sending side of a routed message.
#[derive(Debug, Clone, Copy)]
pub struct Sender<'a> {
    pub nick: &'a str,
    pub location: Option<&'a str>,
}

impl<'a> Sender<'a> {
    pub fn of(peer: &'a Peer) -> Self {
        Self {
            nick: &peer.nick,
            location: peer.location.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    peers: PeerDirectory,
}

impl Router {
    pub fn new(peers: PeerDirectory) -> Self {
        Self { peers }
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    /// Current PEERLIST payload. Peers without a location are unreachable
    /// and left out.
    pub async fn peer_list(&self) -> String {
        let snapshot = self.peers.snapshot().await;
        peerlist::format(
            snapshot
                .iter()
                .filter_map(|p| p.location.as_deref().map(|loc| (p.nick.as_str(), loc))),
        )
    }

    /// Handle GETPEERLIST: build the reply envelope.
    pub async fn get_peer_list(&self) -> Envelope {
        Envelope::peerlist(self.peer_list().await)
    }

    /// Handle PUBMSG. Returns how many peers the envelope was queued to.
    pub async fn broadcast(&self, sender: Sender<'_>, env: &Envelope) -> Result<usize, RouteError> {
        let line = AppLine::parse(&env.line)?;
        check_sender(&line, sender)?;
        if !line.is_public() {
            return Err(RouteError::NotBroadcast(line.to.to_string()));
        }

        let snapshot = self.peers.snapshot().await;
        let mut queued = 0;
        for peer in snapshot.iter().filter(|p| p.nick != sender.nick) {
            if peer.handle.is_closed() {
                continue;
            }
            if peer.handle.deliver(env.clone()) == Delivery::Queued {
                queued += 1;
            }
        }
        debug!(from = sender.nick, recipients = queued, "broadcast");
        Ok(queued)
    }

    /// Handle PRIVMSG. The recipient gets the original envelope, then a
    /// PEERLIST carrying only the sender's location.
    pub async fn route_private(&self, sender: Sender<'_>, env: &Envelope) -> Result<(), RouteError> {
        let line = AppLine::parse(&env.line)?;
        check_sender(&line, sender)?;

        let Some(recipient) = self.peers.lookup(line.to).await else {
            metrics::incr(metrics::ROUTING_FAILURES);
            return Err(RouteError::UnknownRecipient(line.to.to_string()));
        };

        if recipient.handle.deliver(env.clone()) != Delivery::Queued {
            return Ok(());
        }
        if let Some(location) = sender.location {
            recipient.handle.deliver(Envelope::new(
                MessageKind::PeerList,
                peerlist::format_entry(sender.nick, location),
            ));
        }
        debug!(from = sender.nick, to = %recipient.nick, "privmsg routed");
        Ok(())
    }
}

fn check_sender(line: &AppLine<'_>, sender: Sender<'_>) -> Result<(), RouteError> {
    if line.from != sender.nick {
        return Err(RouteError::SpoofedSender {
            claimed: line.from.to_string(),
            actual: sender.nick.to_string(),
        });
    }
    Ok(())
}
