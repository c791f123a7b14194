use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use phase_ledger_core::fetch::doc_fetched_payload;
use phase_ledger_core::{
    now_utc, project_phase1_events, EventPage, EventPageRequest, EventSource, FetchConfig,
    FetcherRegistry, LedgerEvent, LedgerEventInput, LedgerEventType, LedgerStore,
    Phase1Projection, RunId, RunRecord, RunStatus,
};

use crate::{PipelineError, PipelineResult};

/// Number of most recent events read when a run is shown, projected or handed off.
pub const HANDOFF_EVENT_WINDOW: u32 = 200;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunView {
    #[serde(flatten)]
    pub run: RunRecord,
    pub events: Vec<LedgerEvent>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendReceipt {
    pub run_id: RunId,
    pub seq: i64,
}

pub struct Ledger<'a> {
    store: &'a dyn LedgerStore,
    fetchers: &'a FetcherRegistry,
}

impl<'a> Ledger<'a> {
    #[must_use]
    pub fn new(store: &'a dyn LedgerStore, fetchers: &'a FetcherRegistry) -> Self {
        Self { store, fetchers }
    }

    /// Creates a run, then fetches documents for every configured source the registry
    /// knows. Fetch problems are logged and never fail the call.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] when `config` is neither an object nor null,
    /// and [`PipelineError::Storage`] when the run cannot be stored.
    pub fn create_run(&self, mode: &str, config: &Value) -> PipelineResult<RunId> {
        let config = match config {
            Value::Null => Value::Object(Map::new()),
            Value::Object(_) => config.clone(),
            _ => return Err(PipelineError::Validation("config must be object".to_string())),
        };

        let run_id = self.store.create_run(mode, &config)?;
        info!(%run_id, mode, "run created");

        self.fetch_documents(run_id, &config);
        Ok(run_id)
    }

    fn fetch_documents(&self, run_id: RunId, config: &Value) {
        let fetch = match FetchConfig::from_run_config(config) {
            Ok(fetch) => fetch,
            Err(err) => {
                warn!(%run_id, error = %err, "skipping document fetch");
                return;
            }
        };

        if fetch.sources.is_empty() || self.fetchers.is_empty() {
            debug!(%run_id, sources = fetch.sources.len(), "nothing to fetch");
            return;
        }

        for source in &fetch.sources {
            let Some(fetcher) = self.fetchers.get(source) else {
                debug!(
                    %run_id,
                    source = source.as_str(),
                    registered = ?self.fetchers.sources().collect::<Vec<_>>(),
                    "no fetcher registered for source"
                );
                continue;
            };

            let documents = match fetcher.fetch(&fetch) {
                Ok(documents) => documents,
                Err(err) => {
                    warn!(
                        %run_id,
                        source = source.as_str(),
                        error = %format!("{err:#}"),
                        "document fetch failed"
                    );
                    continue;
                }
            };

            let appended = doc_fetched_payload(source, &documents)
                .map_err(anyhow::Error::from)
                .and_then(|payload| {
                    self.store.append_event(&LedgerEventInput {
                        run_id,
                        event_type: LedgerEventType::DocFetched,
                        source: EventSource::Other,
                        occurred_at: now_utc(),
                        payload,
                    })
                });

            match appended {
                Ok(seq) => info!(
                    %run_id,
                    seq,
                    source = source.as_str(),
                    documents = documents.len(),
                    "fetched documents recorded"
                ),
                Err(err) => warn!(
                    %run_id,
                    source = source.as_str(),
                    error = %format!("{err:#}"),
                    "failed to record fetched documents"
                ),
            }
        }
    }

    /// # Errors
    /// Returns [`PipelineError::NotFound`] for an unknown run.
    pub fn get_run(&self, run_id: RunId) -> PipelineResult<RunView> {
        let run = self.require_run(run_id)?;
        let events = self.recent_events(run_id)?;
        Ok(RunView { run, events })
    }

    /// Validates and appends one event, returning its sequence number.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] for a bad event type or payload (checked
    /// before storage is touched), [`PipelineError::NotFound`] for an unknown run.
    pub fn append_event(
        &self,
        run_id: RunId,
        event_type: &str,
        source: Option<&str>,
        occurred_at: Option<OffsetDateTime>,
        payload: Option<Value>,
    ) -> PipelineResult<AppendReceipt> {
        let input = LedgerEventInput::from_raw(run_id, event_type, source, occurred_at, payload)?;
        self.require_run(run_id)?;

        let seq = self.store.append_event(&input)?;
        info!(%run_id, seq, event_type = input.event_type.as_str(), "ledger event appended");
        Ok(AppendReceipt { run_id, seq })
    }

    /// # Errors
    /// Returns [`PipelineError::Storage`] when the page cannot be read.
    pub fn list_events(&self, run_id: RunId, page: EventPageRequest) -> PipelineResult<EventPage> {
        Ok(self.store.list_events(run_id, page)?)
    }

    /// Projects the most recent [`HANDOFF_EVENT_WINDOW`] events of a run.
    ///
    /// # Errors
    /// Returns [`PipelineError::NotFound`] for an unknown run.
    pub fn project_run(&self, run_id: RunId) -> PipelineResult<Phase1Projection> {
        self.require_run(run_id)?;
        let events = self.recent_events(run_id)?;
        Ok(project_phase1_events(&events))
    }

    /// Records `run.finalized` and moves the run to its terminal status, both or neither.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] when `status` is not terminal or the run
    /// was already finalized, [`PipelineError::NotFound`] for an unknown run.
    pub fn finalize_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        error: Option<&str>,
    ) -> PipelineResult<RunRecord> {
        if !status.is_terminal() {
            return Err(PipelineError::Validation(
                "status must be success or failed".to_string(),
            ));
        }
        let run = self.require_run(run_id)?;
        if run.status.is_terminal() {
            return Err(PipelineError::Validation("run already finalized".to_string()));
        }

        let mut payload = Map::new();
        payload.insert("status".to_string(), json!(status.as_str()));
        let finalized = LedgerEventInput {
            run_id,
            event_type: LedgerEventType::RunFinalized,
            source: EventSource::System,
            occurred_at: now_utc(),
            payload,
        };

        // A concurrent finalize can win between the check above and this call.
        let Some(seq) = self.store.finalize_run(&finalized, status, error)? else {
            return Err(PipelineError::Validation("run already finalized".to_string()));
        };
        info!(%run_id, seq, status = status.as_str(), "run finalized");

        self.require_run(run_id)
    }

    fn require_run(&self, run_id: RunId) -> PipelineResult<RunRecord> {
        self.store
            .get_run(run_id)?
            .ok_or_else(|| PipelineError::NotFound(format!("run {run_id}")))
    }

    fn recent_events(&self, run_id: RunId) -> PipelineResult<Vec<LedgerEvent>> {
        recent_events(self.store, run_id)
    }
}

/// The newest [`HANDOFF_EVENT_WINDOW`] events of a run, newest first.
pub(crate) fn recent_events(
    store: &dyn LedgerStore,
    run_id: RunId,
) -> PipelineResult<Vec<LedgerEvent>> {
    Ok(store
        .list_events(run_id, EventPageRequest::latest(HANDOFF_EVENT_WINDOW))?
        .items)
}
