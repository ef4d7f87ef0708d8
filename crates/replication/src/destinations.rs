use reqwest::Url;
use serde::Deserialize;
use uuid::Uuid;
use vellum_store::{meta, DocumentStore, Metadata, StoreError};

/// Key of the replication configuration document.
pub(crate) const DESTINATIONS_DOC_KEY: &str = "replication/destinations";

/// Keys under this prefix are engine bookkeeping and never leave the node.
const INTERNAL_PREFIX: &str = "replication/";

/// Keys under this prefix are node-local system documents.
const SYSTEM_PREFIX: &str = "system/";

/// Whether records that were replicated *to* us get forwarded onwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum TransitiveReplication {
    /// Only ship records written locally (skip anything carrying a foreign
    /// replication source).
    #[default]
    LocalOnly,
    /// Forward replicated records as well.
    Replicate,
}

fn default_skip_system_documents() -> bool {
    true
}

/// One entry of the `replication/destinations` document, as stored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DestinationConfig {
    url: String,
    #[serde(default)]
    database: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    transitive_replication: TransitiveReplication,
    #[serde(default = "default_skip_system_documents")]
    skip_system_documents: bool,
    #[serde(default)]
    include_prefixes: Vec<String>,
    #[serde(default)]
    exclude_prefixes: Vec<String>,
    #[serde(default)]
    disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Credentials {
    None,
    Basic {
        username: String,
        password: Option<String>,
        domain: Option<String>,
    },
    ApiKey(String),
}

#[derive(Debug, Clone)]
pub(crate) struct FilterRules {
    transitive: TransitiveReplication,
    skip_system_documents: bool,
    include_prefixes: Vec<String>,
    exclude_prefixes: Vec<String>,
}

impl FilterRules {
    /// Decides whether a record is shipped to this destination. `remote_instance`
    /// is the destination's server instance id, used to keep from echoing a
    /// record back to the node it came from.
    pub(crate) fn accepts(&self, remote_instance: Uuid, key: &str, metadata: &Metadata) -> bool {
        if key.starts_with(INTERNAL_PREFIX) {
            return false;
        }
        if self.skip_system_documents && key.starts_with(SYSTEM_PREFIX) {
            return false;
        }
        if self.transitive == TransitiveReplication::LocalOnly {
            if let Some(source) = metadata.get(meta::REPLICATION_SOURCE).and_then(|v| v.as_str()) {
                if source.eq_ignore_ascii_case(&remote_instance.to_string()) {
                    return false;
                }
            }
        }
        if !self.include_prefixes.is_empty()
            && !self.include_prefixes.iter().any(|p| key.starts_with(p.as_str()))
        {
            return false;
        }
        if self.exclude_prefixes.iter().any(|p| key.starts_with(p.as_str())) {
            return false;
        }
        true
    }
}

/// A resolved replication destination.
#[derive(Debug, Clone)]
pub(crate) struct Destination {
    /// Effective URL, including the `/databases/<name>` segment when set.
    pub(crate) url: Url,
    pub(crate) credentials: Credentials,
    pub(crate) filter: FilterRules,
}

impl Destination {
    /// Identity of the destination; URLs compare case-insensitively.
    pub(crate) fn key(&self) -> String {
        self.url.as_str().trim_end_matches('/').to_ascii_lowercase()
    }
}

fn resolve(config: DestinationConfig) -> Result<Destination, String> {
    let mut effective = config.url.trim_end_matches('/').to_string();
    if let Some(database) = &config.database {
        effective.push_str("/databases/");
        effective.push_str(database);
    }
    let url = Url::parse(&effective).map_err(|err| format!("invalid url {effective:?}: {err}"))?;

    let credentials = if let Some(api_key) = config.api_key {
        Credentials::ApiKey(api_key)
    } else if let Some(username) = config.username {
        Credentials::Basic {
            username,
            password: config.password,
            domain: config.domain,
        }
    } else {
        Credentials::None
    };

    Ok(Destination {
        url,
        credentials,
        filter: FilterRules {
            transitive: config.transitive_replication,
            skip_system_documents: config.skip_system_documents,
            include_prefixes: config.include_prefixes,
            exclude_prefixes: config.exclude_prefixes,
        },
    })
}

/// Reads the current destination list from the store. A missing document
/// yields an empty list; a malformed entry is skipped so one bad destination
/// cannot disable replication for the rest.
pub(crate) fn load_destinations(store: &dyn DocumentStore) -> Result<Vec<Destination>, StoreError> {
    let Some(doc) = store.get(DESTINATIONS_DOC_KEY)? else {
        return Ok(Vec::new());
    };

    let entries = match doc.data.get("destinations").and_then(|v| v.as_array()) {
        Some(entries) => entries.clone(),
        None => {
            tracing::error!(key = DESTINATIONS_DOC_KEY, "replication document has no destinations array");
            return Ok(Vec::new());
        }
    };

    let mut destinations = Vec::with_capacity(entries.len());
    for entry in entries {
        let config: DestinationConfig = match serde_json::from_value(entry) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(error = %err, "skipping malformed replication destination");
                continue;
            }
        };
        if config.disabled {
            continue;
        }
        match resolve(config) {
            Ok(destination) => destinations.push(destination),
            Err(reason) => tracing::error!(%reason, "skipping replication destination"),
        }
    }
    Ok(destinations)
}

#[cfg(test)]
pub(crate) fn test_destination(url: &str) -> Destination {
    Destination {
        url: Url::parse(url).unwrap(),
        credentials: Credentials::None,
        filter: FilterRules {
            transitive: TransitiveReplication::LocalOnly,
            skip_system_documents: true,
            include_prefixes: Vec::new(),
            exclude_prefixes: Vec::new(),
        },
    }
}

#[cfg(test)]
impl Destination {
    pub(crate) fn with_include_prefixes(mut self, prefixes: &[&str]) -> Self {
        self.filter.include_prefixes = prefixes.iter().map(|p| p.to_string()).collect();
        self
    }

    pub(crate) fn with_exclude_prefixes(mut self, prefixes: &[&str]) -> Self {
        self.filter.exclude_prefixes = prefixes.iter().map(|p| p.to_string()).collect();
        self
    }
}
