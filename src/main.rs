use std::time::Duration;

use clap::Parser;
use tracing::info;

use jm_directory::directory::{self, DirectoryConfig};

#[derive(Parser)]
#[command(name = "jm-directory")]
#[command(about = "JoinMarket directory relay node", long_about = None)]
#[command(version)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "JM_DIRECTORY_BIND", default_value = directory::config::DEFAULT_BIND)]
    bind: String,

    /// Reachable location advertised to peers (e.g. `xyz.onion:5222`).
    #[arg(long, env = "JM_DIRECTORY_LOCATION")]
    location: Option<String>,

    /// This directory's own nick.
    #[arg(long, env = "JM_DIRECTORY_NICK")]
    nick: Option<String>,

    #[arg(long, env = "JM_NETWORK", default_value = "mainnet")]
    network: String,

    /// Message of the day sent in every handshake reply.
    #[arg(long, env = "JM_DIRECTORY_MOTD")]
    motd: Option<String>,

    /// Expected client ping interval, in seconds.
    #[arg(long, env = "JM_PING_INTERVAL_SECS", default_value_t = 60)]
    ping_interval: u64,

    /// Idle connections are dropped after `ping_interval * timeout_multiple`.
    #[arg(long, env = "JM_TIMEOUT_MULTIPLE", default_value_t = 2)]
    timeout_multiple: u32,

    #[arg(long, env = "JM_HANDSHAKE_TIMEOUT_SECS", default_value_t = 30)]
    handshake_timeout: u64,

    /// Per-connection outbound queue depth.
    #[arg(long, env = "JM_OUTBOUND_QUEUE", default_value_t = 256)]
    outbound_queue: usize,

    #[arg(long, env = "JM_MAX_PEERS", default_value_t = 1000)]
    max_peers: usize,

    /// Require nicks to match the full nick grammar.
    #[arg(long, env = "JM_STRICT_NICKS", default_value_t = true, action = clap::ArgAction::Set)]
    strict_nicks: bool,
}

impl Cli {
    fn into_config(self) -> DirectoryConfig {
        let defaults = DirectoryConfig::default();
        DirectoryConfig {
            bind: self.bind,
            location: self.location,
            nick: self.nick.unwrap_or(defaults.nick),
            network: self.network,
            motd: self.motd.unwrap_or(defaults.motd),
            ping_interval: Duration::from_secs(self.ping_interval),
            timeout_multiple: self.timeout_multiple,
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
            outbound_queue: self.outbound_queue,
            max_peers: self.max_peers,
            strict_nicks: self.strict_nicks,
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Cli::parse().into_config();
    info!(
        idle_timeout = ?config.idle_timeout(),
        max_peers = config.max_peers,
        strict_nicks = config.strict_nicks,
        "starting directory"
    );

    directory::run(config).await
}
