use uuid::Uuid;
use vellum_store::{
    AttachmentRecord, DocumentRecord, DocumentStore, Etag, StoreError, TombstoneRecord,
};

use crate::destinations::Destination;

/// Per-batch record and payload budgets.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchLimits {
    pub(crate) max_records: usize,
    pub(crate) max_bytes: usize,
}

#[derive(Debug)]
pub(crate) struct DocumentBatch {
    /// Records that passed the destination filter, etag-ascending.
    pub(crate) records: Vec<DocumentRecord>,
    /// Etag of the last record examined, kept or dropped. Equals the start
    /// etag only when the stream was exhausted at it.
    pub(crate) attempted_end: Etag,
}

#[derive(Debug)]
pub(crate) struct AttachmentBatch {
    pub(crate) records: Vec<AttachmentRecord>,
    pub(crate) attempted_end: Etag,
}

fn tombstone_document(tombstone: TombstoneRecord) -> DocumentRecord {
    DocumentRecord {
        key: tombstone.key,
        etag: tombstone.etag,
        metadata: tombstone.metadata,
        data: serde_json::Value::Null,
    }
}

/// Builds the next document batch for a destination starting after `start`.
///
/// Each round reads live documents and tombstones under one snapshot, merges
/// them in etag order and applies the destination filter. When a whole round
/// is filtered out the cursor advances past it and the read repeats, so a
/// large filtered region cannot stall the stream.
pub(crate) fn build_document_batch(
    store: &dyn DocumentStore,
    start: Etag,
    destination: &Destination,
    remote_instance: Uuid,
    limits: BatchLimits,
) -> Result<DocumentBatch, StoreError> {
    let mut cursor = start;
    loop {
        let mut merged = {
            let snapshot = store.snapshot();
            let documents =
                snapshot.documents_after(cursor, limits.max_records, limits.max_bytes)?;
            let tombstones =
                snapshot.document_tombstones_after(cursor, limits.max_records)?;
            let mut merged = documents;
            merged.extend(tombstones.into_iter().map(tombstone_document));
            merged
        };
        merged.sort_by_key(|record| record.etag);

        let Some(last) = merged.last() else {
            return Ok(DocumentBatch {
                records: Vec::new(),
                attempted_end: cursor,
            });
        };
        cursor = last.etag;

        let kept: Vec<DocumentRecord> = merged
            .into_iter()
            .filter(|record| {
                destination
                    .filter
                    .accepts(remote_instance, &record.key, &record.metadata)
            })
            .collect();
        if !kept.is_empty() {
            return Ok(DocumentBatch {
                records: kept,
                attempted_end: cursor,
            });
        }
        // Everything filtered out; re-read from the advanced cursor.
    }
}

/// Attachment counterpart of [`build_document_batch`]. Payloads of kept
/// attachments are read under the same snapshot as the listing, so the bytes
/// match the etag being shipped.
pub(crate) fn build_attachment_batch(
    store: &dyn DocumentStore,
    start: Etag,
    destination: &Destination,
    remote_instance: Uuid,
    limits: BatchLimits,
) -> Result<AttachmentBatch, StoreError> {
    let mut cursor = start;
    loop {
        let (kept, last) = {
            let snapshot = store.snapshot();
            let mut merged =
                snapshot.attachments_after(cursor, limits.max_records, limits.max_bytes)?;
            let tombstones =
                snapshot.attachment_tombstones_after(cursor, limits.max_records)?;
            merged.extend(tombstones.into_iter().map(|tombstone| {
                vellum_store::AttachmentStub {
                    key: tombstone.key,
                    etag: tombstone.etag,
                    metadata: tombstone.metadata,
                    size: 0,
                }
            }));
            merged.sort_by_key(|stub| stub.etag);

            let last = merged.last().map(|stub| stub.etag);
            let mut kept = Vec::new();
            for stub in merged {
                if !destination
                    .filter
                    .accepts(remote_instance, &stub.key, &stub.metadata)
                {
                    continue;
                }
                let data = if stub.size > 0 {
                    snapshot.attachment_data(&stub.key)?.unwrap_or_default()
                } else {
                    Vec::new()
                };
                kept.push(AttachmentRecord {
                    key: stub.key,
                    etag: stub.etag,
                    metadata: stub.metadata,
                    data,
                });
            }
            (kept, last)
        };

        let Some(last) = last else {
            return Ok(AttachmentBatch {
                records: Vec::new(),
                attempted_end: cursor,
            });
        };
        cursor = last;

        if !kept.is_empty() {
            return Ok(AttachmentBatch {
                records: kept,
                attempted_end: cursor,
            });
        }
    }
}
