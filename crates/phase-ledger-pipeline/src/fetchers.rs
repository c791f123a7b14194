use std::sync::Arc;

use anyhow::Context;
use phase_ledger_core::{Document, DocumentFetcher, FetchConfig, FetcherRegistry};
use time::{Date, Month, OffsetDateTime};

/// Offline fetcher producing deterministic placeholder documents.
#[derive(Debug, Clone)]
pub struct StubFetcher {
    source: &'static str,
    doc_prefix: &'static str,
    title: &'static str,
    url: &'static str,
    published_day: u8,
}

impl StubFetcher {
    #[must_use]
    pub fn ir() -> Self {
        Self {
            source: "ir",
            doc_prefix: "stub",
            title: "Stub IR Document",
            url: "https://example.com/ir/001",
            published_day: 1,
        }
    }

    #[must_use]
    pub fn sec() -> Self {
        Self {
            source: "sec",
            doc_prefix: "sec-stub",
            title: "Stub SEC Document",
            url: "https://example.com/sec/001",
            published_day: 2,
        }
    }

    #[must_use]
    pub fn edinet() -> Self {
        Self {
            source: "edinet",
            doc_prefix: "edinet-stub",
            title: "Stub EDINET Document",
            url: "https://example.com/edinet/001",
            published_day: 3,
        }
    }

    fn published_at(&self) -> anyhow::Result<OffsetDateTime> {
        let date = Date::from_calendar_date(2026, Month::January, self.published_day)
            .with_context(|| format!("invalid stub publish day {}", self.published_day))?;
        Ok(date.midnight().assume_utc())
    }
}

impl DocumentFetcher for StubFetcher {
    fn source(&self) -> &str {
        self.source
    }

    fn fetch(&self, config: &FetchConfig) -> anyhow::Result<Vec<Document>> {
        let published_at = self.published_at()?;
        Ok((1..=config.items_per_source())
            .map(|index| Document {
                doc_id: format!("{}-{index:03}", self.doc_prefix),
                title: self.title.to_string(),
                url: self.url.to_string(),
                published_at,
                ticker: "DUMMY".to_string(),
                summary: "stub".to_string(),
            })
            .collect())
    }
}

/// Registry with the `ir`, `sec` and `edinet` stub fetchers.
#[must_use]
pub fn default_registry() -> FetcherRegistry {
    FetcherRegistry::new()
        .with(Arc::new(StubFetcher::ir()))
        .with(Arc::new(StubFetcher::sec()))
        .with(Arc::new(StubFetcher::edinet()))
}
