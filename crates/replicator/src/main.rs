mod cli;
mod shutdown;

use std::fs;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use clap::Parser;
use serde::Deserialize;

use vellum_replication::start_replication;
use vellum_store::{DocumentStore, MemoryStore, Metadata, WorkContext, WriteOrigin};

use crate::cli::Cli;
use crate::shutdown::{spawn_signal_listener, ShutdownEvent};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatabaseImage {
    /// Value of the `replication/destinations` document.
    #[serde(default)]
    destinations: Option<serde_json::Value>,
    #[serde(default)]
    documents: Vec<ImageDocument>,
    #[serde(default)]
    attachments: Vec<ImageAttachment>,
}

#[derive(Debug, Deserialize)]
struct ImageDocument {
    key: String,
    #[serde(default)]
    metadata: Metadata,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageAttachment {
    key: String,
    #[serde(default)]
    metadata: Metadata,
    data_base64: String,
}

fn load_image(store: &MemoryStore, image: DatabaseImage) -> anyhow::Result<(usize, usize)> {
    if let Some(destinations) = image.destinations {
        store.put(
            "replication/destinations",
            None,
            destinations,
            Metadata::new(),
            WriteOrigin::Internal,
        )?;
    }

    let documents = image.documents.len();
    for doc in image.documents {
        store.put(&doc.key, None, doc.data, doc.metadata, WriteOrigin::Client)?;
    }

    let attachments = image.attachments.len();
    for attachment in image.attachments {
        let data = B64.decode(attachment.data_base64.as_bytes()).map_err(|err| {
            anyhow::anyhow!("attachment {}: invalid dataBase64: {err}", attachment.key)
        })?;
        store.put_attachment(&attachment.key, data, attachment.metadata, WriteOrigin::Client)?;
    }

    Ok((documents, attachments))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let raw = fs::read_to_string(&cli.image)
        .map_err(|err| anyhow::anyhow!("failed to read image {}: {err}", cli.image.display()))?;
    let image: DatabaseImage = serde_json::from_str(&raw)
        .map_err(|err| anyhow::anyhow!("failed to parse image {}: {err}", cli.image.display()))?;

    let work = Arc::new(WorkContext::new());
    let store = Arc::new(MemoryStore::new(work.clone()));
    let (documents, attachments) = load_image(&store, image)?;
    tracing::info!(documents, attachments, server = %cli.server_url, "database image loaded");

    let store: Arc<dyn DocumentStore> = store;
    let handle = start_replication(cli.replication_config(), store, work)?;

    let mut signals = spawn_signal_listener();
    if let Some(ShutdownEvent::Graceful) = signals.recv().await {
        tracing::info!("shutting down; press Ctrl-C again to exit immediately");
    }
    handle.request_stop();

    tokio::select! {
        res = handle.wait() => res?,
        _ = signals.recv() => {
            tracing::warn!("immediate shutdown requested");
            std::process::exit(130);
        }
    }
    Ok(())
}
