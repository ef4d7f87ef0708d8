use tracing::{debug, warn};

use crate::batch::{build_attachment_batch, build_document_batch};
use crate::destinations::Destination;
use crate::engine::EngineContext;
use crate::peer::PeerError;

/// Runs one replication pass against a single destination: fetch the remote
/// cursor, ship a document batch, ship an attachment batch, update failure
/// state. Returns true when something was shipped, telling the scheduler to
/// re-evaluate immediately. Never propagates errors; they are logged and
/// accounted here.
pub(crate) async fn replicate_to_destination(
    ctx: &EngineContext,
    destination: &Destination,
) -> bool {
    if !ctx.work.should_continue() {
        return false;
    }
    let url = destination.key();

    let current_etag = ctx.store.most_recent_document_etag();
    let remote = match ctx.peer.fetch_last_etag(destination, current_etag).await {
        Ok(remote) => remote,
        Err(err @ PeerError::ReplicationNotEnabled(_)) => {
            warn!(destination = %url, error = %err, "replication not enabled on peer");
            return false;
        }
        Err(err) => {
            warn!(destination = %url, error = %err, "failed to fetch remote cursor");
            return false;
        }
    };

    let mut replicated: Option<bool> = None;

    // Documents phase.
    let batch = match build_document_batch(
        ctx.store.as_ref(),
        remote.last_document_etag,
        destination,
        remote.server_instance_id,
        ctx.limits,
    ) {
        Ok(batch) => batch,
        Err(err) => {
            // Local read failure: nothing was sent, the destination is not charged.
            warn!(destination = %url, error = %err, "failed to build document batch");
            return false;
        }
    };
    if batch.records.is_empty() {
        if batch.attempted_end > remote.last_document_etag {
            if let Err(err) = ctx
                .peer
                .push_last_etag(destination, Some(batch.attempted_end), None)
                .await
            {
                warn!(destination = %url, error = %err, "failed to push document cursor");
            }
        }
    } else {
        let records = batch.records.len();
        let was_healthy = ctx.failures.is_first_failure(&url);
        let mut outcome = ctx.peer.ship_documents(destination, &batch.records).await;
        if outcome.is_err() && was_healthy {
            debug!(destination = %url, "first failure, retrying once");
            outcome = ctx.peer.ship_documents(destination, &batch.records).await;
        }
        match outcome {
            Ok(()) => {
                debug!(destination = %url, records, end = %batch.attempted_end, "shipped document batch");
                ctx.failures.reset(&url, "");
                replicated = Some(true);
            }
            Err(err) => {
                warn!(destination = %url, error = %err, "failed to replicate documents");
                ctx.failures.increment(&url, &err.to_string());
                return false;
            }
        }
    }

    if !ctx.work.should_continue() {
        return replicated.unwrap_or(false);
    }

    // Attachments phase.
    let batch = match build_attachment_batch(
        ctx.store.as_ref(),
        remote.last_attachment_etag,
        destination,
        remote.server_instance_id,
        ctx.limits,
    ) {
        Ok(batch) => batch,
        Err(err) => {
            warn!(destination = %url, error = %err, "failed to build attachment batch");
            return replicated.unwrap_or(false);
        }
    };
    if batch.records.is_empty() {
        if batch.attempted_end > remote.last_attachment_etag {
            if let Err(err) = ctx
                .peer
                .push_last_etag(destination, None, Some(batch.attempted_end))
                .await
            {
                warn!(destination = %url, error = %err, "failed to push attachment cursor");
            }
        }
    } else {
        let records = batch.records.len();
        let was_healthy = ctx.failures.is_first_failure(&url);
        let mut outcome = ctx.peer.ship_attachments(destination, &batch.records).await;
        if outcome.is_err() && was_healthy {
            debug!(destination = %url, "first failure, retrying once");
            outcome = ctx.peer.ship_attachments(destination, &batch.records).await;
        }
        match outcome {
            Ok(()) => {
                debug!(destination = %url, records, end = %batch.attempted_end, "shipped attachment batch");
                ctx.failures.reset(&url, "");
                replicated = Some(true);
            }
            Err(err) => {
                warn!(destination = %url, error = %err, "failed to replicate attachments");
                ctx.failures.increment(&url, &err.to_string());
                return false;
            }
        }
    }

    replicated.unwrap_or(false)
}
