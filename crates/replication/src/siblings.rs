use std::sync::Arc;

use reqwest::Url;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vellum_store::WorkContext;

use crate::engine::EngineContext;
use crate::peer::PeerApi;

pub(crate) const SOURCES_DOC_PREFIX: &str = "replication/sources/";

const SOURCE_PAGE_SIZE: usize = 128;

/// On startup, tells every previously-seen source peer that we are back so
/// it can resume pushing to us. Best effort all the way down: every failure
/// is a warning and nothing is retried.
pub(crate) fn spawn_sibling_notifications(ctx: &EngineContext) {
    let (tx, rx) = mpsc::channel::<Url>(SOURCE_PAGE_SIZE);
    tokio::spawn(drain_heartbeats(ctx.peer.clone(), ctx.work.clone(), rx));

    let store = ctx.store.clone();
    tokio::spawn(async move {
        let mut skip = 0;
        loop {
            let page =
                match store.documents_with_prefix(SOURCES_DOC_PREFIX, skip, SOURCE_PAGE_SIZE) {
                    Ok(page) => page,
                    Err(err) => {
                        warn!(error = %err, "failed to read source peer records");
                        return;
                    }
                };
            let page_len = page.len();
            for doc in page {
                let Some(source) = doc.data.get("source").and_then(|v| v.as_str()) else {
                    debug!(key = %doc.key, "source peer record has no source url");
                    continue;
                };
                match Url::parse(source) {
                    Ok(url) => {
                        if tx.send(url).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!(key = %doc.key, error = %err, "invalid source peer url"),
                }
            }
            if page_len < SOURCE_PAGE_SIZE {
                // Dropping the sender closes the queue and ends the drainer.
                return;
            }
            skip += page_len;
        }
    });
}

async fn drain_heartbeats(peer: PeerApi, work: Arc<WorkContext>, mut rx: mpsc::Receiver<Url>) {
    loop {
        let item = tokio::select! {
            item = rx.recv() => item,
            () = work.stopped() => return,
        };
        let Some(url) = item else {
            return;
        };
        match peer.heartbeat(&url).await {
            Ok(()) => debug!(peer = %url, "sibling heartbeat sent"),
            Err(err) => warn!(peer = %url, error = %err, "sibling heartbeat failed"),
        }
    }
}
