use uuid::Uuid;

use crate::etag::Etag;
use crate::records::{AttachmentStub, DocumentRecord, Metadata, TombstoneRecord};

/// Who a write came from. Writes performed by the replication engine for its
/// own bookkeeping carry `Internal` and must not signal the work context,
/// otherwise the engine would wake itself up forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// A regular client write; signals the work context.
    Client,
    /// Engine bookkeeping; never signals the work context.
    Internal,
}

/// Storage failures surfaced to the engine.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An optimistic-concurrency check failed.
    #[error("concurrency violation on {key}: expected {expected}, found {actual}")]
    Concurrency {
        /// Key the write targeted.
        key: String,
        /// Etag the caller expected.
        expected: Etag,
        /// Etag actually stored.
        actual: Etag,
    },
    /// The backing store failed.
    #[error("storage failure: {0}")]
    Backend(String),
}

/// One transactional view of the store. Everything read through a single
/// snapshot observes the same committed state, so a record deleted between
/// two reads cannot show up both live and as a tombstone.
pub trait StoreSnapshot {
    /// Documents with etag strictly greater than `after`, ascending, bounded
    /// by `max_count` records and roughly `max_bytes` of payload. At least
    /// one record is returned when any qualifies, even if oversized.
    fn documents_after(
        &self,
        after: Etag,
        max_count: usize,
        max_bytes: usize,
    ) -> Result<Vec<DocumentRecord>, StoreError>;

    /// Document tombstones with etag strictly greater than `after`, ascending.
    fn document_tombstones_after(
        &self,
        after: Etag,
        max_count: usize,
    ) -> Result<Vec<TombstoneRecord>, StoreError>;

    /// Attachment listing entries with etag strictly greater than `after`,
    /// ascending, bounded by count and payload size.
    fn attachments_after(
        &self,
        after: Etag,
        max_count: usize,
        max_bytes: usize,
    ) -> Result<Vec<AttachmentStub>, StoreError>;

    /// Attachment tombstones with etag strictly greater than `after`.
    fn attachment_tombstones_after(
        &self,
        after: Etag,
        max_count: usize,
    ) -> Result<Vec<TombstoneRecord>, StoreError>;

    /// Binary payload of one attachment, read under this snapshot.
    fn attachment_data(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// The document store contract the replication engine runs against.
pub trait DocumentStore: Send + Sync + 'static {
    /// Unique id of this storage instance; sent to peers as `dbid`.
    fn storage_id(&self) -> Uuid;

    /// Most recent etag in the document stream.
    fn most_recent_document_etag(&self) -> Etag;

    /// Opens a transactional snapshot. The snapshot borrows the store and is
    /// expected to be short-lived; no awaiting while one is held.
    fn snapshot(&self) -> Box<dyn StoreSnapshot + '_>;

    /// Reads a single document by key.
    fn get(&self, key: &str) -> Result<Option<DocumentRecord>, StoreError>;

    /// Writes a document. `expected_etag` enables optimistic concurrency.
    fn put(
        &self,
        key: &str,
        expected_etag: Option<Etag>,
        data: serde_json::Value,
        metadata: Metadata,
        origin: WriteOrigin,
    ) -> Result<Etag, StoreError>;

    /// Deletes a document, producing a tombstone. Returns whether the key
    /// existed.
    fn delete(
        &self,
        key: &str,
        expected_etag: Option<Etag>,
        origin: WriteOrigin,
    ) -> Result<bool, StoreError>;

    /// Writes an attachment.
    fn put_attachment(
        &self,
        key: &str,
        data: Vec<u8>,
        metadata: Metadata,
        origin: WriteOrigin,
    ) -> Result<Etag, StoreError>;

    /// Deletes an attachment, producing a tombstone in the attachment stream.
    fn delete_attachment(&self, key: &str, origin: WriteOrigin) -> Result<bool, StoreError>;

    /// Documents whose keys start with `prefix`, ordered by key, paged with
    /// `skip`/`take`.
    fn documents_with_prefix(
        &self,
        prefix: &str,
        skip: usize,
        take: usize,
    ) -> Result<Vec<DocumentRecord>, StoreError>;
}
