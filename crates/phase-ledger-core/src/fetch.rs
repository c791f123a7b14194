//! Document-fetch capability used to enrich a freshly created run.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::LedgerError;

/// The fetch section of a run configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchConfig {
    #[serde(default)]
    pub sources: Vec<String>,
    /// Values below one are read as one.
    #[serde(default)]
    pub max_items_per_source: i64,
}

impl FetchConfig {
    /// Reads `sources` and `max_items_per_source` from a run configuration. A null
    /// configuration means "fetch nothing".
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when the configuration is not an object or
    /// a fetch field has the wrong type.
    pub fn from_run_config(config: &Value) -> Result<Self, LedgerError> {
        match config {
            Value::Null => Ok(Self::default()),
            Value::Object(_) => serde_json::from_value(config.clone()).map_err(|err| {
                LedgerError::Configuration(format!("invalid fetch configuration: {err}"))
            }),
            _ => Err(LedgerError::Configuration(
                "run config must be an object".to_string(),
            )),
        }
    }

    /// Items each source should produce; never less than one.
    #[must_use]
    pub fn items_per_source(&self) -> u32 {
        u32::try_from(self.max_items_per_source.max(1)).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Document {
    pub doc_id: String,
    pub title: String,
    pub url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub published_at: OffsetDateTime,
    pub ticker: String,
    pub summary: String,
}

pub trait DocumentFetcher: Send + Sync {
    fn source(&self) -> &str;

    /// # Errors
    /// Returns an error when the source cannot be reached or answers garbage.
    fn fetch(&self, config: &FetchConfig) -> anyhow::Result<Vec<Document>>;
}

/// Explicit source-name to fetcher mapping handed to run creation.
#[derive(Clone, Default)]
pub struct FetcherRegistry {
    fetchers: BTreeMap<String, Arc<dyn DocumentFetcher>>,
}

impl FetcherRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fetcher under its own source name, replacing any previous one.
    pub fn register(&mut self, fetcher: Arc<dyn DocumentFetcher>) {
        self.fetchers.insert(fetcher.source().to_string(), fetcher);
    }

    #[must_use]
    pub fn with(mut self, fetcher: Arc<dyn DocumentFetcher>) -> Self {
        self.register(fetcher);
        self
    }

    #[must_use]
    pub fn get(&self, source: &str) -> Option<&Arc<dyn DocumentFetcher>> {
        self.fetchers.get(source)
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.fetchers.keys().map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }
}

impl std::fmt::Debug for FetcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.fetchers.keys()).finish()
    }
}

/// Payload of the `doc.fetched` event recorded for one successful fetch.
///
/// # Errors
/// Returns [`LedgerError::Encoding`] when a document timestamp cannot be formatted.
pub fn doc_fetched_payload(
    source: &str,
    documents: &[Document],
) -> Result<Map<String, Value>, LedgerError> {
    let documents = serde_json::to_value(documents)
        .map_err(|err| LedgerError::Encoding(format!("failed to encode documents: {err}")))?;
    let mut payload = Map::new();
    payload.insert("source".to_string(), Value::String(source.to_string()));
    payload.insert("documents".to_string(), documents);
    Ok(payload)
}
