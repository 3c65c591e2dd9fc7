//! Keepalive monitor.
//!
//! A single background task sweeps the directory at a fixed interval and
//! closes every registered peer that has been silent longer than the idle
//! timeout. Closing is cooperative: the peer's connection task notices the
//! cancelled handle, tears down, and unregisters itself.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::metrics;
use super::peers::PeerDirectory;

/// Close every peer idle for longer than `idle_timeout` as of `now`.
/// Returns the nicks that were closed.
pub async fn sweep(peers: &PeerDirectory, now: Instant, idle_timeout: Duration) -> Vec<String> {
    let mut closed = Vec::new();
    for peer in peers.snapshot().await {
        if peer.handle.is_closed() {
            continue;
        }
        let idle = peer.handle.idle_for(now);
        if idle > idle_timeout {
            info!(nick = %peer.nick, ?idle, "keepalive timeout");
            metrics::incr(metrics::KEEPALIVE_TIMEOUTS);
            peer.handle.close();
            closed.push(peer.nick);
        }
    }
    closed
}

/// Spawn the monitor. It runs until `shutdown` is cancelled.
pub fn spawn(
    peers: PeerDirectory,
    every: Duration,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(?every, ?idle_timeout, "keepalive monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep(&peers, Instant::now(), idle_timeout).await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::peers::{Peer, PeerHandle};
    use pretty_assertions::assert_eq;

    const TIMEOUT: Duration = Duration::from_secs(120);

    async fn register(
        dir: &PeerDirectory,
        nick: &str,
        id: u64,
    ) -> (PeerHandle, tokio::sync::mpsc::Receiver<crate::directory::message::Envelope>) {
        let (handle, rx) = PeerHandle::new(id, 4);
        dir.register(Peer::new(nick, None, handle.clone())).await.unwrap();
        (handle, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_closes_only_stale_peers() {
        let dir = PeerDirectory::new();
        let (quiet, _quiet_rx) = register(&dir, "J5quiet", 1).await;
        let (chatty, _chatty_rx) = register(&dir, "J5chatty", 2).await;

        time::advance(Duration::from_secs(100)).await;
        chatty.touch();
        time::advance(Duration::from_secs(30)).await;

        let closed = sweep(&dir, Instant::now(), TIMEOUT).await;
        assert_eq!(closed, vec!["J5quiet".to_string()]);
        assert!(quiet.is_closed());
        assert!(!chatty.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_at_exact_timeout_keeps_peer() {
        let dir = PeerDirectory::new();
        let (h, _rx) = register(&dir, "J5edge", 1).await;
        time::advance(TIMEOUT).await;
        assert!(sweep(&dir, Instant::now(), TIMEOUT).await.is_empty());
        assert!(!h.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_closes_silent_peer_and_spares_pinging_one() {
        let dir = PeerDirectory::new();
        let (silent, _silent_rx) = register(&dir, "J5silent", 1).await;
        let (pinging, _pinging_rx) = register(&dir, "J5pinging", 2).await;
        let shutdown = CancellationToken::new();
        let task = spawn(
            dir.clone(),
            Duration::from_secs(15),
            TIMEOUT,
            shutdown.clone(),
        );

        for _ in 0..10 {
            time::sleep(Duration::from_secs(60)).await;
            pinging.touch();
        }

        assert!(silent.is_closed());
        assert!(!pinging.is_closed());

        shutdown.cancel();
        task.await.unwrap();
    }
}
