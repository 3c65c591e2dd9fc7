//! Peer directory, the shared registry of Ready peers.
//!
//! Maps nick → [`Peer`]. Every operation takes the registry lock once, so
//! register / unregister / lookup / snapshot are atomic with respect to each
//! other and a reader never sees a half-inserted entry. Snapshots are
//! returned in registration order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::message::Envelope;
use super::metrics;

/// Handle to send envelopes to one connection and to close it.
///
/// Cloned into the directory at registration; the connection task owns the
/// receiving end of the queue.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: u64,
    tx: mpsc::Sender<Envelope>,
    closer: CancellationToken,
    last_activity: Arc<Mutex<Instant>>,
}

/// Outcome of queueing an envelope to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The queue was full; the peer has been told to close.
    Overflowed,
    /// The connection is already gone.
    Gone,
}

impl PeerHandle {
    /// Create a handle with a bounded outbound queue of `capacity` envelopes.
    pub fn new(id: u64, capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            tx,
            closer: CancellationToken::new(),
            last_activity: Arc::new(Mutex::new(Instant::now())),
        };
        (handle, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue an envelope without waiting. A full queue closes the peer
    /// instead of stalling the caller.
    pub fn deliver(&self, env: Envelope) -> Delivery {
        match self.tx.try_send(env) {
            Ok(()) => {
                metrics::incr(metrics::MESSAGES_FORWARDED);
                Delivery::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::incr(metrics::BACKPRESSURE_CLOSES);
                self.close();
                Delivery::Overflowed
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    /// Ask the connection to close. Cooperative: the connection task notices
    /// on its next poll and tears down.
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.closer.cancelled().await;
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        let mut last = self.last_activity.lock().unwrap_or_else(|e| e.into_inner());
        *last = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = self.last_activity.lock().unwrap_or_else(|e| e.into_inner());
        now.saturating_duration_since(*last)
    }
}

/// A registered peer.
#[derive(Debug, Clone)]
pub struct Peer {
    pub nick: String,
    /// Reachable `host:port`, or `None` for peers that serve nothing.
    pub location: Option<String>,
    pub handle: PeerHandle,
}

impl Peer {
    pub fn new(nick: impl Into<String>, location: Option<String>, handle: PeerHandle) -> Self {
        Self {
            nick: nick.into(),
            location,
            handle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("nick {0} is already registered")]
    DuplicateNick(String),
    #[error("directory is full ({0} peers)")]
    Full(usize),
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    peer: Peer,
}

#[derive(Debug, Default)]
struct Registry {
    peers: HashMap<String, Entry>,
    next_seq: u64,
}

/// Shared, concurrency-safe peer registry. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PeerDirectory {
    inner: Arc<RwLock<Registry>>,
    capacity: usize,
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::with_capacity(usize::MAX)
    }
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A directory that refuses registrations beyond `capacity` peers.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Registry::default())),
            capacity,
        }
    }

    /// Register a peer. An existing entry for the same nick is left untouched
    /// and the newcomer is rejected.
    pub async fn register(&self, peer: Peer) -> Result<(), RegisterError> {
        let mut reg = self.inner.write().await;
        if reg.peers.contains_key(&peer.nick) {
            return Err(RegisterError::DuplicateNick(peer.nick));
        }
        if reg.peers.len() >= self.capacity {
            return Err(RegisterError::Full(self.capacity));
        }
        let seq = reg.next_seq;
        reg.next_seq += 1;
        reg.peers.insert(peer.nick.clone(), Entry { seq, peer });
        metrics::set_gauge(metrics::PEERS_REGISTERED, reg.peers.len());
        Ok(())
    }

    /// Remove a peer. Returns the removed entry, if any.
    pub async fn unregister(&self, nick: &str) -> Option<Peer> {
        let mut reg = self.inner.write().await;
        let removed = reg.peers.remove(nick).map(|e| e.peer);
        metrics::set_gauge(metrics::PEERS_REGISTERED, reg.peers.len());
        removed
    }

    pub async fn lookup(&self, nick: &str) -> Option<Peer> {
        self.inner
            .read()
            .await
            .peers
            .get(nick)
            .map(|e| e.peer.clone())
    }

    /// All peers, in registration order.
    pub async fn snapshot(&self) -> Vec<Peer> {
        let reg = self.inner.read().await;
        let mut entries: Vec<&Entry> = reg.peers.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.peer.clone()).collect()
    }

    /// `(nick, location)` pairs, in registration order.
    pub async fn snapshot_all(&self) -> Vec<(String, Option<String>)> {
        self.snapshot()
            .await
            .into_iter()
            .map(|p| (p.nick, p.location))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
