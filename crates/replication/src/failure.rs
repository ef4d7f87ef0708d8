use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use vellum_store::{DocumentStore, Metadata, WriteOrigin};

use crate::api::DestinationFailureStats;

pub(crate) const FAILURE_DOC_PREFIX: &str = "replication/destinations-failure/";

/// Key of the persisted failure document for a destination URL. The URL is
/// flattened (scheme, slashes and colons removed) and percent-encoded so it
/// is safe as a document key segment.
pub(crate) fn failure_document_key(destination_url: &str) -> String {
    let flattened: String = destination_url
        .replace("https://", "")
        .replace("http://", "")
        .chars()
        .filter(|c| *c != '/' && *c != ':')
        .collect();
    format!(
        "{FAILURE_DOC_PREFIX}{}",
        utf8_percent_encode(&flattened, NON_ALPHANUMERIC)
    )
}

/// Persisted shape of `replication/destinations-failure/*` documents.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DestinationFailureInformation {
    destination: String,
    failure_count: u64,
}

#[derive(Debug, Default, Clone)]
struct FailureCount {
    count: u64,
    timestamp: Option<DateTime<Utc>>,
    last_error: String,
}

/// Per-destination failure accounting. The in-memory map answers
/// `is_first_failure` and feeds the observability snapshot; the persisted
/// documents survive restarts and drive the scheduler's back-off.
pub(crate) struct FailureTracker {
    store: Arc<dyn DocumentStore>,
    counts: Mutex<HashMap<String, FailureCount>>,
}

impl FailureTracker {
    pub(crate) fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// True iff the destination's previous state was healthy: no attempt
    /// recorded yet, or the last attempt succeeded.
    pub(crate) fn is_first_failure(&self, url: &str) -> bool {
        let mut counts = self.counts.lock().expect("failure map poisoned");
        counts.entry(url.to_string()).or_default().count == 0
    }

    /// Records a failed attempt and bumps the persisted failure count.
    pub(crate) fn increment(&self, url: &str, error: &str) {
        {
            let mut counts = self.counts.lock().expect("failure map poisoned");
            let entry = counts.entry(url.to_string()).or_default();
            entry.count += 1;
            entry.timestamp = Some(Utc::now());
            entry.last_error = error.to_string();
        }

        let key = failure_document_key(url);
        let persisted = self.persisted_failure_count(url);
        let info = DestinationFailureInformation {
            destination: url.to_string(),
            failure_count: persisted + 1,
        };
        let data = match serde_json::to_value(&info) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(destination = url, error = %err, "failed to encode failure document");
                return;
            }
        };
        if let Err(err) = self
            .store
            .put(&key, None, data, Metadata::new(), WriteOrigin::Internal)
        {
            tracing::warn!(destination = url, error = %err, "failed to persist failure count");
        }
    }

    /// Records a successful attempt: zeroes the in-memory count and deletes
    /// the persisted failure document.
    pub(crate) fn reset(&self, url: &str, message: &str) {
        {
            let mut counts = self.counts.lock().expect("failure map poisoned");
            let entry = counts.entry(url.to_string()).or_default();
            entry.count = 0;
            entry.timestamp = Some(Utc::now());
            entry.last_error = message.to_string();
        }

        let key = failure_document_key(url);
        if let Err(err) = self.store.delete(&key, None, WriteOrigin::Internal) {
            tracing::warn!(destination = url, error = %err, "failed to clear persisted failure count");
        }
    }

    /// The failure count as persisted, surviving restarts. Zero when the
    /// destination has no failure document.
    pub(crate) fn persisted_failure_count(&self, url: &str) -> u64 {
        let key = failure_document_key(url);
        match self.store.get(&key) {
            Ok(Some(doc)) => serde_json::from_value::<DestinationFailureInformation>(doc.data)
                .map(|info| info.failure_count)
                .unwrap_or(0),
            Ok(None) => 0,
            Err(err) => {
                tracing::warn!(destination = url, error = %err, "failed to read persisted failure count");
                0
            }
        }
    }

    /// Immutable snapshot of the in-memory failure map.
    pub(crate) fn snapshot(&self) -> Vec<DestinationFailureStats> {
        let counts = self.counts.lock().expect("failure map poisoned");
        let mut stats: Vec<DestinationFailureStats> = counts
            .iter()
            .filter_map(|(url, entry)| {
                entry.timestamp.map(|timestamp| DestinationFailureStats {
                    url: url.clone(),
                    count: entry.count,
                    timestamp,
                    last_error: entry.last_error.clone(),
                })
            })
            .collect();
        stats.sort_by(|a, b| a.url.cmp(&b.url));
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vellum_store::{MemoryStore, WorkContext};

    use super::*;

    fn tracker() -> FailureTracker {
        FailureTracker::new(Arc::new(MemoryStore::new(Arc::new(WorkContext::new()))))
    }

    #[test]
    fn escaping_flattens_the_url() {
        assert_eq!(
            failure_document_key("http://peer:8080/databases/crm"),
            "replication/destinations-failure/peer8080databasescrm"
        );
        // Characters outside [0-9a-zA-Z] are percent-encoded.
        assert_eq!(
            failure_document_key("https://peer.example.com"),
            "replication/destinations-failure/peer%2Eexample%2Ecom"
        );
    }

    #[test]
    fn first_failure_means_the_prior_state_was_healthy() {
        let tracker = tracker();
        let url = "http://peer/databases/crm";

        assert!(tracker.is_first_failure(url));
        tracker.increment(url, "boom");
        assert!(!tracker.is_first_failure(url));
        tracker.reset(url, "");
        assert!(tracker.is_first_failure(url));
    }

    #[test]
    fn increments_accumulate_in_the_persisted_document() {
        let tracker = tracker();
        let url = "http://peer";

        tracker.increment(url, "connection refused");
        tracker.increment(url, "connection refused");
        tracker.increment(url, "timed out");
        assert_eq!(tracker.persisted_failure_count(url), 3);

        let stats = tracker.snapshot();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].count, 3);
        assert_eq!(stats[0].last_error, "timed out");
    }

    #[test]
    fn reset_deletes_the_persisted_document() {
        let tracker = tracker();
        let url = "http://peer";

        tracker.increment(url, "boom");
        assert_eq!(tracker.persisted_failure_count(url), 1);
        tracker.reset(url, "");
        assert_eq!(tracker.persisted_failure_count(url), 0);

        let stats = tracker.snapshot();
        assert_eq!(stats[0].count, 0);
    }
}
