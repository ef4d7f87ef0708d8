use crate::etag::Etag;

/// Free-form record metadata, kept as a JSON object.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Well-known metadata keys.
pub mod meta {
    /// Marks a record as a deletion; set on tombstone metadata by the store.
    pub const DELETED: &str = "@deleted";

    /// Server instance id of the node a replicated record originated from.
    /// Absent on records written locally by clients.
    pub const REPLICATION_SOURCE: &str = "@replication-source";
}

/// A live document, or a tombstone rendered with an empty body.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    /// Document key, unique within the database.
    pub key: String,
    /// Write etag from the document stream.
    pub etag: Etag,
    /// Document metadata.
    pub metadata: Metadata,
    /// Document body; `Null` for tombstones.
    pub data: serde_json::Value,
}

/// A deletion marker. Tombstones take their etag from the same stream as the
/// records they delete, so a single cursor covers both.
#[derive(Debug, Clone, PartialEq)]
pub struct TombstoneRecord {
    /// Key of the deleted record.
    pub key: String,
    /// Deletion etag.
    pub etag: Etag,
    /// Metadata of the record at deletion time, plus [`meta::DELETED`].
    pub metadata: Metadata,
}

/// An attachment listing entry without its binary payload. The payload is
/// fetched separately, inside the same snapshot, once a batch builder decides
/// the attachment is actually going to be shipped.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentStub {
    /// Attachment key.
    pub key: String,
    /// Write etag from the attachment stream.
    pub etag: Etag,
    /// Attachment metadata.
    pub metadata: Metadata,
    /// Payload size in bytes; zero for tombstones.
    pub size: usize,
}

/// An attachment with its payload, as shipped to a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentRecord {
    /// Attachment key.
    pub key: String,
    /// Write etag from the attachment stream.
    pub etag: Etag,
    /// Attachment metadata.
    pub metadata: Metadata,
    /// Binary payload; empty for tombstones.
    pub data: Vec<u8>,
}
