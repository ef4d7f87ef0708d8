//! Public API types for the in-process replication engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;
use vellum_store::{DocumentStore, WorkContext};

/// Configuration for one replication engine instance.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Public URL peers use to reach this node; sent as the `from` query
    /// parameter on every outbound call.
    pub server_url: Url,

    /// Timeout applied to every peer HTTP request.
    pub request_timeout: Duration,

    /// How long the scheduler sleeps after a cycle that was woken by a local
    /// write before giving up on further signals.
    pub data_poll_interval: Duration,

    /// How long the scheduler sleeps after an idle cycle. Destinations are
    /// replicated unconditionally when this timer fires, regardless of their
    /// failure history.
    pub idle_poll_interval: Duration,

    /// Maximum number of records per shipped batch.
    pub batch_max_records: usize,

    /// Approximate payload budget per shipped batch, in bytes.
    pub batch_max_bytes: usize,
}

impl ReplicationConfig {
    /// Default peer request timeout.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

    /// Default sleep after a data-driven cycle.
    pub const DEFAULT_DATA_POLL_INTERVAL: Duration = Duration::from_secs(30);

    /// Default sleep after an idle cycle.
    pub const DEFAULT_IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

    /// Default per-batch record cap.
    pub const DEFAULT_BATCH_MAX_RECORDS: usize = 100;

    /// Default per-batch payload budget.
    pub const DEFAULT_BATCH_MAX_BYTES: usize = 10 * 1024 * 1024;

    /// Builds a configuration with the default intervals and batch caps.
    pub fn new(server_url: Url) -> Self {
        Self {
            server_url,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
            data_poll_interval: Self::DEFAULT_DATA_POLL_INTERVAL,
            idle_poll_interval: Self::DEFAULT_IDLE_POLL_INTERVAL,
            batch_max_records: Self::DEFAULT_BATCH_MAX_RECORDS,
            batch_max_bytes: Self::DEFAULT_BATCH_MAX_BYTES,
        }
    }
}

/// Failure state of one destination, as exposed to operational tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationFailureStats {
    /// Effective destination URL.
    pub url: String,
    /// Consecutive failed attempts since the last success.
    pub count: u64,
    /// When the count last changed.
    pub timestamp: DateTime<Utc>,
    /// Most recent error text.
    pub last_error: String,
}

/// Key of the persisted failure document for a destination URL. Operational
/// tooling reads these documents to inspect back-off state across restarts.
pub fn failure_document_key(destination_url: &str) -> String {
    crate::failure::failure_document_key(destination_url)
}

/// Handle to a running replication engine.
pub struct ReplicationHandle {
    pub(crate) work: Arc<WorkContext>,
    pub(crate) failures: Arc<crate::failure::FailureTracker>,
    pub(crate) join: tokio::task::JoinHandle<()>,
}

impl ReplicationHandle {
    /// Immutable snapshot of the in-memory failure map.
    pub fn failure_stats(&self) -> Vec<DestinationFailureStats> {
        self.failures.snapshot()
    }

    /// Requests a graceful shutdown: the scheduler exits at its next check
    /// and in-flight destination workers finish their current step.
    pub fn request_stop(&self) {
        self.work.stop();
    }

    /// Waits for the scheduler task to exit.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.join
            .await
            .map_err(|err| anyhow::anyhow!("replication task join error: {err}"))
    }
}

/// Starts the replication engine for `store`, returning a handle to it.
///
/// The engine re-reads the `replication/destinations` document every cycle,
/// so destinations can be added or removed while it runs.
pub fn start_replication(
    config: ReplicationConfig,
    store: Arc<dyn DocumentStore>,
    work: Arc<WorkContext>,
) -> anyhow::Result<ReplicationHandle> {
    crate::engine::start(config, store, work)
}
