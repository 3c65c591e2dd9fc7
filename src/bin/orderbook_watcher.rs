use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use jm_directory::directory::line::AppLine;
use jm_directory::directory::message::Envelope;
use jm_directory::watcher::{self, OfferSink, WatcherConfig, MIN_COLLECTION_WINDOW};

#[derive(Parser)]
#[command(name = "orderbook-watcher")]
#[command(about = "Collect offer replies from JoinMarket directory nodes", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory `host:port`; repeat to watch several.
    #[arg(short, long = "directory", required = true, env = "JM_DIRECTORIES", value_delimiter = ',')]
    directories: Vec<String>,

    /// Nick to use. A random one is generated when absent.
    #[arg(long, env = "JM_WATCHER_NICK")]
    nick: Option<String>,

    #[arg(long, env = "JM_NETWORK", default_value = "mainnet")]
    network: String,

    /// Collection window in seconds (at least 10).
    #[arg(short, long, env = "JM_COLLECTION_WINDOW_SECS", default_value_t = 30)]
    window: u64,

    /// Seconds to wait for each reply.
    #[arg(long, env = "JM_REPLY_TIMEOUT_SECS", default_value_t = 30)]
    timeout: u64,

    #[arg(long, env = "JM_PING_INTERVAL_SECS", default_value_t = 60)]
    ping_interval: u64,
}

/// Logs each reply. Offer fields are left to downstream tooling.
struct LogSink {
    directory: String,
}

impl OfferSink for LogSink {
    fn offer(&mut self, counterparty: &str, envelope: &Envelope) {
        let remainder = AppLine::parse(&envelope.line)
            .map(|l| l.remainder)
            .unwrap_or_default();
        info!(directory = %self.directory, counterparty, "{remainder}");
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

    let cli = Cli::parse();
    let window = Duration::from_secs(cli.window);
    if window < MIN_COLLECTION_WINDOW {
        return Err(format!(
            "collection window must be at least {}s",
            MIN_COLLECTION_WINDOW.as_secs()
        )
        .into());
    }

    let configs: Vec<WatcherConfig> = cli
        .directories
        .iter()
        .map(|dir| {
            let mut config = WatcherConfig::new(dir.clone());
            if let Some(nick) = &cli.nick {
                config.nick = nick.clone();
            }
            config.network = cli.network.clone();
            config.collection_window = window;
            config.reply_timeout = Duration::from_secs(cli.timeout);
            config.ping_interval = Duration::from_secs(cli.ping_interval);
            config
        })
        .collect();

    let outcomes = watcher::watch_all(&configs, |config| LogSink {
        directory: config.directory.clone(),
    })
    .await;

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(report) => info!(
                directory = %report.directory,
                peers = report.peers.len(),
                learned = report.learned.len(),
                offers = report.offers,
                "done"
            ),
            Err(e) => {
                failed += 1;
                warn!(directory = %outcome.directory, "no orderbook: {e}");
            }
        }
    }

    if failed == outcomes.len() {
        return Err("no directory could be reached".into());
    }
    Ok(())
}
