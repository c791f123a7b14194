use serde::{Deserialize, Serialize};
use tracing::info;

use phase_ledger_core::{
    phase1_section, validate_handoff, HandoffId, HandoffRecord, HandoffRequest, HandoffStore,
    LedgerStore, NewHandoff, RunId,
};

use crate::ledger::recent_events;
use crate::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandoffCreated {
    pub id: HandoffId,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachedCase {
    pub handoff_id: HandoffId,
    pub case_id: String,
}

pub struct HandoffService<'a> {
    ledger: &'a dyn LedgerStore,
    handoffs: &'a dyn HandoffStore,
}

impl<'a> HandoffService<'a> {
    #[must_use]
    pub fn new(ledger: &'a dyn LedgerStore, handoffs: &'a dyn HandoffStore) -> Self {
        Self { ledger, handoffs }
    }

    /// Validates a handoff, attaches the run's newest events and their projection to
    /// the packet, and stores it with status `created`.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] with the first violated rule,
    /// [`PipelineError::NotFound`] when the run does not exist.
    pub fn create(&self, request: &HandoffRequest) -> PipelineResult<HandoffCreated> {
        let validated = validate_handoff(request)?;
        let run_id = validated.run_id;
        if self.ledger.get_run(run_id)?.is_none() {
            return Err(PipelineError::NotFound(format!("run {run_id}")));
        }

        let section = phase1_section(run_id, recent_events(self.ledger, run_id)?);
        let event_count = section.events.len();
        let handoff_type = validated.handoff_type();
        let to_phase = validated.envelope.to_phase;
        let packet = validated.envelope.enrich(&section)?.into_packet()?;

        let id = self.handoffs.create_handoff(&NewHandoff {
            run_id,
            case_id: validated.case_id,
            handoff_type,
            from_phase: 1,
            to_phase,
            packet,
        })?;
        info!(
            handoff_id = %id,
            %run_id,
            handoff_type = handoff_type.as_str(),
            to_phase,
            events = event_count,
            "handoff created"
        );

        Ok(HandoffCreated {
            id,
            status: "created".to_string(),
        })
    }

    /// # Errors
    /// Returns [`PipelineError::NotFound`] for an unknown handoff.
    pub fn get(&self, id: HandoffId) -> PipelineResult<HandoffRecord> {
        self.handoffs
            .get_handoff(id)?
            .ok_or_else(|| PipelineError::NotFound(format!("handoff {id}")))
    }

    /// # Errors
    /// Returns [`PipelineError::Storage`] when the handoffs cannot be read.
    pub fn list_for_run(&self, run_id: RunId) -> PipelineResult<Vec<HandoffRecord>> {
        Ok(self.handoffs.list_handoffs_for_run(run_id)?)
    }

    /// # Errors
    /// Returns [`PipelineError::Validation`] for a blank case id and
    /// [`PipelineError::NotFound`] for an unknown handoff.
    pub fn attach_case(&self, id: HandoffId, case_id: &str) -> PipelineResult<AttachedCase> {
        let case_id = case_id.trim();
        if case_id.is_empty() {
            return Err(PipelineError::Validation("case_id required".to_string()));
        }
        if !self.handoffs.attach_case(id, case_id)? {
            return Err(PipelineError::NotFound(format!("handoff {id}")));
        }
        info!(handoff_id = %id, case_id, "case attached to handoff");
        Ok(AttachedCase {
            handoff_id: id,
            case_id: case_id.to_string(),
        })
    }
}
