use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use reqwest::Url;

use vellum_replication::ReplicationConfig;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "vellum-replicator",
    version,
    about = "Runs the Vellum outbound replication engine over a database image"
)]
pub struct Cli {
    /// Public URL peers use to reach this node; sent as `from` on every
    /// outbound request.
    #[arg(long, env = "VELLUM_SERVER_URL")]
    pub server_url: Url,

    /// Database image to load: documents, attachments and the replication
    /// destinations document.
    #[arg(long)]
    pub image: PathBuf,

    /// Peer request timeout in seconds.
    #[arg(long, default_value_t = 60)]
    pub request_timeout_seconds: u64,

    /// Seconds to keep polling for more work after a data-driven cycle.
    #[arg(long, default_value_t = 30)]
    pub data_poll_seconds: u64,

    /// Seconds between idle wake-ups.
    #[arg(long, default_value_t = 300)]
    pub idle_poll_seconds: u64,
}

impl Cli {
    pub fn replication_config(&self) -> ReplicationConfig {
        let mut cfg = ReplicationConfig::new(self.server_url.clone());
        cfg.request_timeout = Duration::from_secs(self.request_timeout_seconds.max(1));
        cfg.data_poll_interval = Duration::from_secs(self.data_poll_seconds.max(1));
        cfg.idle_poll_interval = Duration::from_secs(self.idle_poll_seconds.max(1));
        cfg
    }
}
