//! Directory configuration.
//!
//! Defaults describe a mainnet directory on localhost. The binary overlays
//! command-line flags and `JM_*` environment variables on top.

use std::time::Duration;

use super::handshake::{APP_NAME, PROTOCOL_VERSION};
use super::nick::NickFormat;

/// Default listen address.
pub const DEFAULT_BIND: &str = "127.0.0.1:5222";

/// Recommended client ping interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Address to listen on.
    pub bind: String,
    /// This directory's own reachable location, advertised in DN_HANDSHAKE.
    pub location: Option<String>,
    /// This directory's nick, advertised in DN_HANDSHAKE.
    pub nick: String,
    pub network: String,
    pub app_name: String,
    pub proto_ver_min: u32,
    pub proto_ver_max: u32,
    pub motd: String,
    /// Interval at which clients are expected to ping.
    pub ping_interval: Duration,
    /// A Ready connection silent for `ping_interval * timeout_multiple` is closed.
    pub timeout_multiple: u32,
    /// A connection must complete its handshake within this window.
    pub handshake_timeout: Duration,
    /// Outbound queue depth per connection. A full queue closes that peer.
    pub outbound_queue: usize,
    /// Maximum number of registered peers.
    pub max_peers: usize,
    pub nick_format: NickFormat,
    /// When off, any nick free of separator characters is accepted.
    pub strict_nicks: bool,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.into(),
            location: None,
            nick: "J5Directory1OOOO".into(),
            network: "mainnet".into(),
            app_name: APP_NAME.into(),
            proto_ver_min: PROTOCOL_VERSION,
            proto_ver_max: PROTOCOL_VERSION,
            motd: "JoinMarket directory node".into(),
            ping_interval: DEFAULT_PING_INTERVAL,
            timeout_multiple: 2,
            handshake_timeout: Duration::from_secs(30),
            outbound_queue: 256,
            max_peers: 1000,
            nick_format: NickFormat::default(),
            strict_nicks: true,
        }
    }
}

impl DirectoryConfig {
    /// Silence after which a Ready connection is dropped.
    pub fn idle_timeout(&self) -> Duration {
        self.ping_interval * self.timeout_multiple.max(1)
    }

    /// How often the keepalive monitor sweeps.
    pub fn sweep_interval(&self) -> Duration {
        (self.ping_interval / 4).max(Duration::from_millis(10))
    }
}
