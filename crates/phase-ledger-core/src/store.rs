use anyhow::Result;
use serde_json::Value;

use crate::{
    EventPage, EventPageRequest, HandoffId, HandoffRecord, LedgerEventInput, NewHandoff, Packet,
    PipelinePhase, RunId, RunRecord, RunStatus, StageRunId, StageRunRecord,
};

/// Runs and their append-only event ledgers.
pub trait LedgerStore {
    #[allow(clippy::missing_errors_doc)]
    fn create_run(&self, mode: &str, config: &Value) -> Result<RunId>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>>;

    /// Moves a running run to a terminal status and appends `finalized` to its ledger in
    /// one transaction, returning the event's sequence number. Returns `None`, writing
    /// nothing, when the run does not exist or is no longer running.
    #[allow(clippy::missing_errors_doc)]
    fn finalize_run(
        &self,
        finalized: &LedgerEventInput,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<Option<i64>>;

    /// Appends one event and returns its sequence number: one more than the run's
    /// current maximum, assigned and committed atomically.
    #[allow(clippy::missing_errors_doc)]
    fn append_event(&self, input: &LedgerEventInput) -> Result<i64>;

    /// Newest-first page of a run's events.
    #[allow(clippy::missing_errors_doc)]
    fn list_events(&self, run_id: RunId, page: EventPageRequest) -> Result<EventPage>;
}

pub trait HandoffStore {
    #[allow(clippy::missing_errors_doc)]
    fn create_handoff(&self, handoff: &NewHandoff) -> Result<HandoffId>;

    #[allow(clippy::missing_errors_doc)]
    fn get_handoff(&self, id: HandoffId) -> Result<Option<HandoffRecord>>;

    /// All handoffs of a run, newest first.
    #[allow(clippy::missing_errors_doc)]
    fn list_handoffs_for_run(&self, run_id: RunId) -> Result<Vec<HandoffRecord>>;

    /// Returns `false` when the handoff does not exist.
    #[allow(clippy::missing_errors_doc)]
    fn attach_case(&self, id: HandoffId, case_id: &str) -> Result<bool>;
}

/// One record per pipeline stage invocation.
pub trait StageRunStore {
    #[allow(clippy::missing_errors_doc)]
    fn create_stage_run(&self, phase: PipelinePhase, packet: &Packet) -> Result<StageRunId>;

    #[allow(clippy::missing_errors_doc)]
    fn update_stage_run_packet(
        &self,
        phase: PipelinePhase,
        id: StageRunId,
        packet: &Packet,
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_stage_run(
        &self,
        phase: PipelinePhase,
        id: StageRunId,
    ) -> Result<Option<StageRunRecord>>;
}
