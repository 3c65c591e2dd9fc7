//! Orderbook watcher: a thin client of one or more directories.
//!
//! Connects, handshakes, fetches the peer list, broadcasts an orderbook
//! request and collects the PRIVMSG replies for a fixed window. Offers are
//! never interpreted here; each reply is handed to an [`OfferSink`] as-is.

pub mod client;

use std::time::Duration;

use futures::future::join_all;
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, error, info};

use crate::directory::codec::CodecError;
use crate::directory::config::DEFAULT_PING_INTERVAL;
use crate::directory::message::Envelope;
use crate::directory::nick::NickFormat;
use crate::directory::peerlist::PeerEntry;

pub use client::{Collected, DirectoryClient};

/// Shortest collection window the command-line watcher accepts.
pub const MIN_COLLECTION_WINDOW: Duration = Duration::from_secs(10);

/// Receives offer replies. Implementations parse the opaque remainder
/// (offer fields, fidelity bond proof) however they like.
pub trait OfferSink {
    fn offer(&mut self, counterparty: &str, envelope: &Envelope);
}

impl OfferSink for Vec<Envelope> {
    fn offer(&mut self, _counterparty: &str, envelope: &Envelope) {
        self.push(envelope.clone());
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("bad descriptor: {0}")]
    Json(#[from] serde_json::Error),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("directory closed the connection")]
    Closed,
    #[error("handshake rejected by {directory}: {motd}")]
    Rejected { directory: String, motd: String },
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Directory `host:port`.
    pub directory: String,
    pub nick: String,
    pub network: String,
    pub collection_window: Duration,
    /// How long to wait for each expected reply (and for the TCP connect).
    pub reply_timeout: Duration,
    pub ping_interval: Duration,
}

impl WatcherConfig {
    /// Defaults for `directory`, with a fresh random nick.
    pub fn new(directory: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            nick: NickFormat::default().random(),
            network: "mainnet".into(),
            collection_window: MIN_COLLECTION_WINDOW,
            reply_timeout: Duration::from_secs(30),
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

/// Outcome of one successful session with a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherReport {
    pub directory: String,
    pub directory_nick: String,
    pub motd: String,
    /// Peer list as returned by GETPEERLIST.
    pub peers: Vec<PeerEntry>,
    /// Locations learned from PRIVMSG follow-ups during the window.
    pub learned: Vec<PeerEntry>,
    pub offers: usize,
}

/// Run one full session against `config.directory`.
pub async fn watch<K>(config: &WatcherConfig, sink: &mut K) -> Result<WatcherReport, WatcherError>
where
    K: OfferSink + ?Sized,
{
    let stream = time::timeout(config.reply_timeout, TcpStream::connect(&config.directory))
        .await
        .map_err(|_| WatcherError::Timeout("connect"))?
        .map_err(|source| WatcherError::Connect {
            addr: config.directory.clone(),
            source,
        })?;
    let client = DirectoryClient::new(stream, config.nick.clone(), config.reply_timeout);
    session(client, config, sink).await
}

/// Run a session over an already-open client.
pub async fn session<S, K>(
    mut client: DirectoryClient<S>,
    config: &WatcherConfig,
    sink: &mut K,
) -> Result<WatcherReport, WatcherError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    K: OfferSink + ?Sized,
{
    let dn = client.handshake(&config.network).await?;
    let peers = client.get_peerlist().await?;
    info!(directory = %config.directory, peers = peers.len(), "peer list received");

    client.request_orderbook().await?;
    let collected = client
        .collect(config.collection_window, config.ping_interval, sink)
        .await?;
    if collected.directory_left {
        debug!(directory = %config.directory, "directory already gone, skipping goodbye");
    } else {
        client.disconnect().await?;
    }

    info!(
        directory = %config.directory,
        offers = collected.offers,
        "collection window closed"
    );
    Ok(WatcherReport {
        directory: config.directory.clone(),
        directory_nick: dn.nick,
        motd: dn.motd,
        peers,
        learned: collected.learned,
        offers: collected.offers,
    })
}

/// One directory's result from [`watch_all`].
#[derive(Debug)]
pub struct DirectoryOutcome<K> {
    pub directory: String,
    pub sink: K,
    pub result: Result<WatcherReport, WatcherError>,
}

/// Watch several directories concurrently, each with its own sink.
/// A failing directory is logged and reported; the others carry on.
pub async fn watch_all<K, F>(configs: &[WatcherConfig], mut make_sink: F) -> Vec<DirectoryOutcome<K>>
where
    K: OfferSink,
    F: FnMut(&WatcherConfig) -> K,
{
    let sessions = configs.iter().map(|config| {
        let mut sink = make_sink(config);
        async move {
            let result = watch(config, &mut sink).await;
            if let Err(e) = &result {
                error!(directory = %config.directory, "fetch failed: {e}");
            }
            DirectoryOutcome {
                directory: config.directory.clone(),
                sink,
                result,
            }
        }
    });
    join_all(sessions).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::codec::EnvelopeCodec;
    use crate::directory::config::DirectoryConfig;
    use crate::directory::handshake::DirectoryHandshake;
    use crate::directory::message::MessageKind;
    use futures::SinkExt;
    use tokio_stream::StreamExt;
    use tokio_util::codec::Framed;

    #[test]
    fn default_config_has_valid_random_nick() {
        let a = WatcherConfig::new("127.0.0.1:5222");
        let b = WatcherConfig::new("127.0.0.1:5222");
        assert!(NickFormat::default().is_valid(&a.nick));
        assert_ne!(a.nick, b.nick);
        assert_eq!(a.collection_window, MIN_COLLECTION_WINDOW);
    }

    #[tokio::test]
    async fn watch_all_reports_unreachable_directories() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let configs = vec![WatcherConfig::new(addr.clone())];
        let outcomes = watch_all(&configs, |_| Vec::<Envelope>::new()).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].directory, addr);
        assert!(matches!(
            outcomes[0].result,
            Err(WatcherError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn session_skips_goodbye_after_directory_leaves() {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let mut config = WatcherConfig::new("duplex");
        config.collection_window = Duration::from_secs(30);
        let nick = config.nick.clone();

        let directory = tokio::spawn(async move {
            let mut dir = Framed::new(theirs, EnvelopeCodec);
            assert_eq!(dir.next().await.unwrap().unwrap().kind, MessageKind::Handshake);
            let dn = DirectoryHandshake::from_config(&DirectoryConfig::default(), true)
                .to_json()
                .unwrap();
            dir.send(Envelope::new(MessageKind::DnHandshake, dn)).await.unwrap();

            assert_eq!(dir.next().await.unwrap().unwrap().kind, MessageKind::GetPeerList);
            dir.send(Envelope::peerlist("J5Maker1;onion1.onion:5222"))
                .await
                .unwrap();

            assert_eq!(dir.next().await.unwrap().unwrap().kind, MessageKind::PubMsg);
            dir.send(Envelope::privmsg(format!("J5Maker1!{nick}!sw0reloffer 0 1 2 3 4")))
                .await
                .unwrap();
            dir.send(Envelope::bare(MessageKind::Disconnect)).await.unwrap();

            // Nothing more from the watcher, just EOF.
            assert!(dir.next().await.is_none());
        });

        let client = DirectoryClient::new(ours, config.nick.clone(), config.reply_timeout);
        let mut sink: Vec<Envelope> = Vec::new();
        let report = session(client, &config, &mut sink).await.unwrap();
        directory.await.unwrap();

        assert_eq!(report.peers.len(), 1);
        assert_eq!(report.offers, 1);
        assert_eq!(sink.len(), 1);
    }
}
