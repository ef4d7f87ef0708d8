use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use uuid::Uuid;

use crate::etag::Etag;
use crate::records::{meta, AttachmentRecord, AttachmentStub, DocumentRecord, Metadata, TombstoneRecord};
use crate::store::{DocumentStore, StoreError, StoreSnapshot, WriteOrigin};
use crate::work::WorkContext;

/// In-memory [`DocumentStore`] backed by `BTreeMap`s and a `RwLock`.
///
/// Snapshots hold the read half of the lock, which is what makes them
/// transactional: writers block until every open snapshot is dropped.
/// Used by tests and by the `vellum-replicator` driver binary.
pub struct MemoryStore {
    id: Uuid,
    work: Arc<WorkContext>,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    documents: BTreeMap<String, DocumentRecord>,
    document_tombstones: BTreeMap<Etag, TombstoneRecord>,
    attachments: BTreeMap<String, AttachmentRecord>,
    attachment_tombstones: BTreeMap<Etag, TombstoneRecord>,
    last_document_etag: Etag,
    last_attachment_etag: Etag,
}

impl MemoryStore {
    /// Creates an empty store wired to `work` for write notifications.
    pub fn new(work: Arc<WorkContext>) -> Self {
        Self {
            id: Uuid::new_v4(),
            work,
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("store lock poisoned")
    }

    fn notify(&self, origin: WriteOrigin) {
        if origin == WriteOrigin::Client {
            self.work.notify_about_work();
        }
    }
}

fn check_expected(
    key: &str,
    expected: Option<Etag>,
    actual: Etag,
) -> Result<(), StoreError> {
    match expected {
        Some(expected) if expected != actual => Err(StoreError::Concurrency {
            key: key.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

fn payload_size(data: &serde_json::Value) -> usize {
    serde_json::to_string(data).map(|s| s.len()).unwrap_or(0)
}

impl DocumentStore for MemoryStore {
    fn storage_id(&self) -> Uuid {
        self.id
    }

    fn most_recent_document_etag(&self) -> Etag {
        self.read().last_document_etag
    }

    fn snapshot(&self) -> Box<dyn StoreSnapshot + '_> {
        Box::new(MemorySnapshot { inner: self.read() })
    }

    fn get(&self, key: &str) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.read().documents.get(key).cloned())
    }

    fn put(
        &self,
        key: &str,
        expected_etag: Option<Etag>,
        data: serde_json::Value,
        metadata: Metadata,
        origin: WriteOrigin,
    ) -> Result<Etag, StoreError> {
        let etag = {
            let mut inner = self.inner.write().expect("store lock poisoned");
            let actual = inner.documents.get(key).map(|d| d.etag).unwrap_or(Etag::ZERO);
            check_expected(key, expected_etag, actual)?;
            let etag = inner.last_document_etag.next();
            inner.last_document_etag = etag;
            inner.documents.insert(
                key.to_string(),
                DocumentRecord {
                    key: key.to_string(),
                    etag,
                    metadata,
                    data,
                },
            );
            etag
        };
        self.notify(origin);
        Ok(etag)
    }

    fn delete(
        &self,
        key: &str,
        expected_etag: Option<Etag>,
        origin: WriteOrigin,
    ) -> Result<bool, StoreError> {
        let existed = {
            let mut inner = self.inner.write().expect("store lock poisoned");
            let actual = inner.documents.get(key).map(|d| d.etag).unwrap_or(Etag::ZERO);
            check_expected(key, expected_etag, actual)?;
            match inner.documents.remove(key) {
                None => false,
                Some(doc) => {
                    let etag = inner.last_document_etag.next();
                    inner.last_document_etag = etag;
                    let mut metadata = doc.metadata;
                    metadata.insert(meta::DELETED.to_string(), serde_json::Value::Bool(true));
                    inner.document_tombstones.insert(
                        etag,
                        TombstoneRecord {
                            key: key.to_string(),
                            etag,
                            metadata,
                        },
                    );
                    true
                }
            }
        };
        if existed {
            self.notify(origin);
        }
        Ok(existed)
    }

    fn put_attachment(
        &self,
        key: &str,
        data: Vec<u8>,
        metadata: Metadata,
        origin: WriteOrigin,
    ) -> Result<Etag, StoreError> {
        let etag = {
            let mut inner = self.inner.write().expect("store lock poisoned");
            let etag = inner.last_attachment_etag.next();
            inner.last_attachment_etag = etag;
            inner.attachments.insert(
                key.to_string(),
                AttachmentRecord {
                    key: key.to_string(),
                    etag,
                    metadata,
                    data,
                },
            );
            etag
        };
        self.notify(origin);
        Ok(etag)
    }

    fn delete_attachment(&self, key: &str, origin: WriteOrigin) -> Result<bool, StoreError> {
        let existed = {
            let mut inner = self.inner.write().expect("store lock poisoned");
            match inner.attachments.remove(key) {
                None => false,
                Some(attachment) => {
                    let etag = inner.last_attachment_etag.next();
                    inner.last_attachment_etag = etag;
                    let mut metadata = attachment.metadata;
                    metadata.insert(meta::DELETED.to_string(), serde_json::Value::Bool(true));
                    inner.attachment_tombstones.insert(
                        etag,
                        TombstoneRecord {
                            key: key.to_string(),
                            etag,
                            metadata,
                        },
                    );
                    true
                }
            }
        };
        if existed {
            self.notify(origin);
        }
        Ok(existed)
    }

    fn documents_with_prefix(
        &self,
        prefix: &str,
        skip: usize,
        take: usize,
    ) -> Result<Vec<DocumentRecord>, StoreError> {
        let inner = self.read();
        Ok(inner
            .documents
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .skip(skip)
            .take(take)
            .map(|(_, doc)| doc.clone())
            .collect())
    }
}

struct MemorySnapshot<'a> {
    inner: RwLockReadGuard<'a, Inner>,
}

impl StoreSnapshot for MemorySnapshot<'_> {
    fn documents_after(
        &self,
        after: Etag,
        max_count: usize,
        max_bytes: usize,
    ) -> Result<Vec<DocumentRecord>, StoreError> {
        let mut newer: Vec<&DocumentRecord> = self
            .inner
            .documents
            .values()
            .filter(|doc| doc.etag > after)
            .collect();
        newer.sort_by_key(|doc| doc.etag);

        let mut out = Vec::new();
        let mut bytes = 0usize;
        for doc in newer {
            if out.len() >= max_count {
                break;
            }
            let size = payload_size(&doc.data);
            if !out.is_empty() && bytes + size > max_bytes {
                break;
            }
            bytes += size;
            out.push(doc.clone());
        }
        Ok(out)
    }

    fn document_tombstones_after(
        &self,
        after: Etag,
        max_count: usize,
    ) -> Result<Vec<TombstoneRecord>, StoreError> {
        Ok(self
            .inner
            .document_tombstones
            .range(after.next()..)
            .take(max_count)
            .map(|(_, tombstone)| tombstone.clone())
            .collect())
    }

    fn attachments_after(
        &self,
        after: Etag,
        max_count: usize,
        max_bytes: usize,
    ) -> Result<Vec<AttachmentStub>, StoreError> {
        let mut newer: Vec<&AttachmentRecord> = self
            .inner
            .attachments
            .values()
            .filter(|attachment| attachment.etag > after)
            .collect();
        newer.sort_by_key(|attachment| attachment.etag);

        let mut out = Vec::new();
        let mut bytes = 0usize;
        for attachment in newer {
            if out.len() >= max_count {
                break;
            }
            if !out.is_empty() && bytes + attachment.data.len() > max_bytes {
                break;
            }
            bytes += attachment.data.len();
            out.push(AttachmentStub {
                key: attachment.key.clone(),
                etag: attachment.etag,
                metadata: attachment.metadata.clone(),
                size: attachment.data.len(),
            });
        }
        Ok(out)
    }

    fn attachment_tombstones_after(
        &self,
        after: Etag,
        max_count: usize,
    ) -> Result<Vec<TombstoneRecord>, StoreError> {
        Ok(self
            .inner
            .attachment_tombstones
            .range(after.next()..)
            .take(max_count)
            .map(|(_, tombstone)| tombstone.clone())
            .collect())
    }

    fn attachment_data(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .inner
            .attachments
            .get(key)
            .map(|attachment| attachment.data.clone()))
    }
}
