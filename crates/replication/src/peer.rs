use bson::spec::BinarySubtype;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vellum_store::{AttachmentRecord, DocumentRecord, Etag};

use crate::destinations::{Credentials, Destination};

#[derive(Debug, thiserror::Error)]
pub(crate) enum PeerError {
    #[error("replication not enabled on peer ({0})")]
    ReplicationNotEnabled(StatusCode),
    #[error("peer returned {status}: {message}")]
    Rejected { status: StatusCode, message: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("failed to encode attachment batch: {0}")]
    Encode(#[from] bson::ser::Error),
    #[error("invalid destination url {0:?}")]
    InvalidUrl(String),
}

/// A peer's view of our replication progress.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SourceReplicationInformation {
    pub(crate) last_document_etag: Etag,
    pub(crate) last_attachment_etag: Etag,
    pub(crate) server_instance_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct PeerErrorBody {
    #[serde(rename = "Error")]
    error: String,
}

/// HTTP client for the peer replication endpoints. Cheap to clone; carries
/// this node's identity so every request gets the `from` parameter.
#[derive(Clone)]
pub(crate) struct PeerApi {
    http: reqwest::Client,
    server_url: Url,
    storage_id: Uuid,
}

impl PeerApi {
    pub(crate) fn new(http: reqwest::Client, server_url: Url, storage_id: Uuid) -> Self {
        Self {
            http,
            server_url,
            storage_id,
        }
    }

    fn endpoint(&self, base: &Url, action: &str) -> Result<Url, PeerError> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|()| PeerError::InvalidUrl(base.to_string()))?
            .pop_if_empty()
            .extend(["replication", action]);
        url.query_pairs_mut()
            .append_pair("from", self.server_url.as_str());
        Ok(url)
    }

    fn authorize(&self, req: RequestBuilder, destination: &Destination) -> RequestBuilder {
        match &destination.credentials {
            Credentials::None => req,
            Credentials::Basic {
                username,
                password,
                domain,
            } => {
                let user = match domain {
                    Some(domain) => format!("{domain}\\{username}"),
                    None => username.clone(),
                };
                req.basic_auth(user, password.as_deref())
            }
            Credentials::ApiKey(key) => req.header("Api-Key", key),
        }
    }

    /// Asks the peer for its recorded cursor for us. `current_etag` is our
    /// most recent document etag, passed along for the peer's diagnostics.
    pub(crate) async fn fetch_last_etag(
        &self,
        destination: &Destination,
        current_etag: Etag,
    ) -> Result<SourceReplicationInformation, PeerError> {
        let mut url = self.endpoint(&destination.url, "lastEtag")?;
        url.query_pairs_mut()
            .append_pair("currentEtag", &current_etag.to_string())
            .append_pair("dbid", &self.storage_id.to_string());

        let res = self
            .authorize(self.http.get(url), destination)
            .send()
            .await?;
        let status = res.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND {
            return Err(PeerError::ReplicationNotEnabled(status));
        }
        if !status.is_success() {
            return Err(rejection(res).await);
        }
        Ok(res.json().await?)
    }

    /// Tells the peer our cursor moved past records that were filtered out,
    /// so it advances its stored view without receiving a batch.
    pub(crate) async fn push_last_etag(
        &self,
        destination: &Destination,
        document_etag: Option<Etag>,
        attachment_etag: Option<Etag>,
    ) -> Result<(), PeerError> {
        let mut url = self.endpoint(&destination.url, "lastEtag")?;
        url.query_pairs_mut()
            .append_pair("dbid", &self.storage_id.to_string());
        if let Some(etag) = document_etag {
            url.query_pairs_mut().append_pair("docEtag", &etag.to_string());
        }
        if let Some(etag) = attachment_etag {
            url.query_pairs_mut()
                .append_pair("attachmentEtag", &etag.to_string());
        }

        let res = self
            .authorize(self.http.put(url), destination)
            .send()
            .await?;
        expect_success(res).await
    }

    pub(crate) async fn ship_documents(
        &self,
        destination: &Destination,
        records: &[DocumentRecord],
    ) -> Result<(), PeerError> {
        let url = self.endpoint(&destination.url, "replicateDocs")?;
        let body: Vec<serde_json::Value> = records.iter().map(document_wire_value).collect();

        let res = self
            .authorize(self.http.post(url), destination)
            .json(&body)
            .send()
            .await?;
        expect_success(res).await
    }

    pub(crate) async fn ship_attachments(
        &self,
        destination: &Destination,
        records: &[AttachmentRecord],
    ) -> Result<(), PeerError> {
        let url = self.endpoint(&destination.url, "replicateAttachments")?;
        let ids = records
            .iter()
            .map(|record| record.key.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let body = attachment_wire_body(records)?;

        let res = self
            .authorize(self.http.post(url), destination)
            .header(reqwest::header::CONTENT_TYPE, "application/bson")
            .header("Attachment-Ids", ids)
            .body(body)
            .send()
            .await?;
        expect_success(res).await
    }

    /// Best-effort wake-up call to a source peer.
    pub(crate) async fn heartbeat(&self, peer_url: &Url) -> Result<(), PeerError> {
        let url = self.endpoint(peer_url, "heartbeat")?;
        let res = self.http.post(url).send().await?;
        expect_success(res).await
    }
}

async fn rejection(res: reqwest::Response) -> PeerError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<PeerErrorBody>(&body) {
        Ok(parsed) => parsed.error,
        Err(_) => body,
    };
    PeerError::Rejected { status, message }
}

async fn expect_success(res: reqwest::Response) -> Result<(), PeerError> {
    if res.status().is_success() {
        return Ok(());
    }
    Err(rejection(res).await)
}

/// Wire shape of one document record: payload fields at the top level with
/// `key`, `etag` and `@metadata` alongside. Tombstones carry no payload.
fn document_wire_value(record: &DocumentRecord) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    if let serde_json::Value::Object(payload) = &record.data {
        object.extend(payload.clone());
    }
    object.insert("key".to_string(), serde_json::Value::String(record.key.clone()));
    object.insert(
        "etag".to_string(),
        serde_json::Value::String(record.etag.to_string()),
    );
    object.insert(
        "@metadata".to_string(),
        serde_json::Value::Object(record.metadata.clone()),
    );
    serde_json::Value::Object(object)
}

/// Attachment batches travel as a BSON root array: a document keyed by the
/// element index, each element carrying the raw etag bytes and payload.
fn attachment_wire_body(records: &[AttachmentRecord]) -> Result<Vec<u8>, PeerError> {
    let mut root = bson::Document::new();
    for (idx, record) in records.iter().enumerate() {
        let mut element = bson::Document::new();
        element.insert("@id", record.key.clone());
        element.insert(
            "@etag",
            bson::Binary {
                subtype: BinarySubtype::Generic,
                bytes: record.etag.to_bytes().to_vec(),
            },
        );
        element.insert("@metadata", bson::to_bson(&record.metadata)?);
        element.insert(
            "data",
            bson::Binary {
                subtype: BinarySubtype::Generic,
                bytes: record.data.clone(),
            },
        );
        root.insert(idx.to_string(), element);
    }
    Ok(bson::to_vec(&root)?)
}
