//! Client side of a directory connection.
//!
//! Every request waits for its expected reply kind, skipping unrelated
//! traffic (other peers' PUBMSGs, stray PEERLISTs) until `reply_timeout`
//! runs out.

use std::time::Duration;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{self, Instant};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::directory::codec::EnvelopeCodec;
use crate::directory::handshake::{ClientHandshake, DirectoryHandshake};
use crate::directory::line::{self, AppLine, PUBLIC};
use crate::directory::message::{Envelope, MessageKind};
use crate::directory::peerlist::{self, PeerEntry};

use super::{OfferSink, WatcherError};

/// Command broadcast to ask makers for their offers.
pub const ORDERBOOK_REQUEST: &str = "!orderbook";

/// What the collection window produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Collected {
    /// PRIVMSGs addressed to us and handed to the sink.
    pub offers: usize,
    /// Locations learned from PEERLIST follow-ups.
    pub learned: Vec<PeerEntry>,
    /// The directory ended the session before the window closed.
    pub directory_left: bool,
}

pub struct DirectoryClient<S> {
    framed: Framed<S, EnvelopeCodec>,
    nick: String,
    reply_timeout: Duration,
}

impl<S> DirectoryClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, nick: impl Into<String>, reply_timeout: Duration) -> Self {
        Self {
            framed: Framed::new(stream, EnvelopeCodec),
            nick: nick.into(),
            reply_timeout,
        }
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub async fn send(&mut self, env: Envelope) -> Result<(), WatcherError> {
        self.framed.send(env).await?;
        Ok(())
    }

    async fn next_envelope(&mut self) -> Result<Envelope, WatcherError> {
        match self.framed.next().await {
            Some(Ok(env)) => Ok(env),
            Some(Err(e)) => Err(e.into()),
            None => Err(WatcherError::Closed),
        }
    }

    /// Wait for the next envelope of `kind`, dropping anything else.
    async fn expect(&mut self, kind: MessageKind) -> Result<Envelope, WatcherError> {
        let deadline = Instant::now() + self.reply_timeout;
        loop {
            let env = time::timeout_at(deadline, self.next_envelope())
                .await
                .map_err(|_| WatcherError::Timeout(kind.name()))??;
            if env.kind == kind {
                return Ok(env);
            }
            debug!(expected = %kind, got = %env.kind, "skipping unexpected message");
        }
    }

    /// Send HANDSHAKE and wait for the directory's verdict.
    pub async fn handshake(&mut self, network: &str) -> Result<DirectoryHandshake, WatcherError> {
        let hs = ClientHandshake::client(&self.nick, network);
        self.send(Envelope::new(MessageKind::Handshake, hs.to_json()?))
            .await?;

        let reply = self.expect(MessageKind::DnHandshake).await?;
        let dn = DirectoryHandshake::parse(&reply.line)?;
        if !dn.accepted {
            return Err(WatcherError::Rejected {
                directory: dn.nick,
                motd: dn.motd,
            });
        }
        info!(directory = %dn.nick, motd = %dn.motd, "handshake accepted");
        Ok(dn)
    }

    /// Request and parse the directory's peer list.
    pub async fn get_peerlist(&mut self) -> Result<Vec<PeerEntry>, WatcherError> {
        self.send(Envelope::bare(MessageKind::GetPeerList)).await?;
        let reply = self.expect(MessageKind::PeerList).await?;
        Ok(peerlist::parse(&reply.line))
    }

    /// Broadcast the orderbook request to every peer.
    pub async fn request_orderbook(&mut self) -> Result<(), WatcherError> {
        let line = line::compose(&self.nick, PUBLIC, ORDERBOOK_REQUEST);
        self.send(Envelope::pubmsg(line)).await
    }

    /// Collect replies for `window`, pinging every `ping_interval`. Each
    /// PRIVMSG addressed to us goes to `sink` unmodified. If the directory
    /// hangs up early, whatever arrived so far is still returned.
    pub async fn collect<K>(
        &mut self,
        window: Duration,
        ping_interval: Duration,
        sink: &mut K,
    ) -> Result<Collected, WatcherError>
    where
        K: OfferSink + ?Sized,
    {
        let deadline = Instant::now() + window;
        let mut ping = time::interval_at(Instant::now() + ping_interval, ping_interval);
        let mut collected = Collected::default();

        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => break,

                _ = ping.tick() => {
                    self.send(Envelope::bare(MessageKind::Ping)).await?;
                }

                env = self.next_envelope() => {
                    let env = match env {
                        Ok(env) => env,
                        Err(WatcherError::Closed) => {
                            warn!("directory closed the connection mid-window");
                            collected.directory_left = true;
                            break;
                        }
                        Err(e) => return Err(e),
                    };
                    match env.kind {
                        MessageKind::PrivMsg => match AppLine::parse(&env.line) {
                            Ok(l) if l.to == self.nick => {
                                collected.offers += 1;
                                sink.offer(l.from, &env);
                            }
                            Ok(l) => debug!(to = l.to, "privmsg for someone else"),
                            Err(e) => debug!("unparseable privmsg: {e}"),
                        },
                        MessageKind::PeerList => {
                            collected.learned.extend(peerlist::parse(&env.line));
                        }
                        MessageKind::Disconnect => {
                            warn!("directory ended the session early");
                            collected.directory_left = true;
                            break;
                        }
                        other => debug!(kind = %other, "ignored during collection"),
                    }
                }
            }
        }

        Ok(collected)
    }

    /// Say goodbye and close the stream.
    pub async fn disconnect(mut self) -> Result<(), WatcherError> {
        self.send(Envelope::bare(MessageKind::Disconnect)).await?;
        self.framed.close().await?;
        Ok(())
    }
}
