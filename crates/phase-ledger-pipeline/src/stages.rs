use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use phase_ledger_core::{
    LedgerError, Packet, Phase2Meta, Phase2Section, Phase3Meta, Phase3Section, Phase4Meta,
    Phase4Section, PipelinePhase, StageRunId, StageRunRecord, StageRunStore,
};

use crate::{PipelineError, PipelineResult};

/// What a stage does when writing its finished packet back to its record fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistPolicy {
    /// Log and still return the record id with the in-memory packet.
    BestEffort,
    /// Abort the call with a storage error.
    Fatal,
}

impl PersistPolicy {
    /// Phase 2 tolerates a failed final write; phases 3 and 4 do not.
    #[must_use]
    pub fn for_phase(phase: PipelinePhase) -> Self {
        match phase {
            PipelinePhase::Phase2 => Self::BestEffort,
            PipelinePhase::Phase3 | PipelinePhase::Phase4 => Self::Fatal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageOutput {
    pub run_id: StageRunId,
    pub packet: Packet,
}

pub struct StagePipeline<'a> {
    store: &'a dyn StageRunStore,
}

impl<'a> StagePipeline<'a> {
    #[must_use]
    pub fn new(store: &'a dyn StageRunStore) -> Self {
        Self { store }
    }

    /// Runs one stage: checks the inbound packet, stores it under a fresh stage record,
    /// appends the stage's template section and writes the result back.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] for a missing packet, a `version` other than
    /// 1 or a non-object `phases`, all checked before storage. Storage failures are
    /// returned as [`PipelineError::Storage`], except the final write in phase 2.
    pub fn advance(
        &self,
        phase: PipelinePhase,
        packet: Option<Packet>,
    ) -> PipelineResult<StageOutput> {
        let Some(mut packet) = packet else {
            return Err(PipelineError::Validation("packet required".to_string()));
        };
        packet.check_version_one()?;
        let phases = packet.phases()?;
        let upstream_section = phase.previous_section_name();
        debug!(
            %phase,
            upstream_section,
            upstream_present = phases.contains_key(upstream_section),
            "advancing stage"
        );
        let upstream = UpstreamMeta::extract(phase, &phases);

        let id = self.store.create_stage_run(phase, &packet)?;
        let section = upstream.into_section(id)?;
        packet.set_phase_section(phase.section_name(), section)?;

        if let Err(err) = self.store.update_stage_run_packet(phase, id, &packet) {
            match PersistPolicy::for_phase(phase) {
                PersistPolicy::BestEffort => {
                    warn!(
                        %phase,
                        stage_run_id = %id,
                        error = %format!("{err:#}"),
                        "failed to persist stage packet; returning in-memory packet"
                    );
                }
                PersistPolicy::Fatal => {
                    return Err(PipelineError::Storage(
                        err.context(format!("failed to persist {phase} packet")),
                    ));
                }
            }
        }

        info!(%phase, stage_run_id = %id, "stage advanced");
        Ok(StageOutput {
            run_id: id,
            packet,
        })
    }

    /// Like [`StagePipeline::advance`], from raw JSON. `null` counts as a missing packet.
    ///
    /// # Errors
    /// See [`StagePipeline::advance`]; a non-object packet is a validation error.
    pub fn advance_value(
        &self,
        phase: PipelinePhase,
        packet: Value,
    ) -> PipelineResult<StageOutput> {
        let packet = match packet {
            Value::Null => None,
            other => Some(Packet::from_value(other)?),
        };
        self.advance(phase, packet)
    }

    /// # Errors
    /// Returns [`PipelineError::NotFound`] when no record of `phase` has this id.
    pub fn get(&self, phase: PipelinePhase, id: StageRunId) -> PipelineResult<StageRunRecord> {
        self.store
            .get_stage_run(phase, id)?
            .ok_or_else(|| PipelineError::NotFound(format!("{phase} run {id}")))
    }
}

enum UpstreamMeta {
    Phase2(Phase2Meta),
    Phase3(Phase3Meta),
    Phase4(Phase4Meta),
}

impl UpstreamMeta {
    fn extract(phase: PipelinePhase, phases: &serde_json::Map<String, Value>) -> Self {
        match phase {
            PipelinePhase::Phase2 => Self::Phase2(Phase2Meta::from_phases(phases)),
            PipelinePhase::Phase3 => Self::Phase3(Phase3Meta::from_phases(phases)),
            PipelinePhase::Phase4 => Self::Phase4(Phase4Meta::from_phases(phases)),
        }
    }

    fn into_section(self, id: StageRunId) -> Result<Value, LedgerError> {
        let encoded = match self {
            Self::Phase2(meta) => serde_json::to_value(Phase2Section::template(id, meta)),
            Self::Phase3(meta) => serde_json::to_value(Phase3Section::template(id, meta)),
            Self::Phase4(meta) => serde_json::to_value(Phase4Section::template(id, meta)),
        };
        encoded.map_err(|err| {
            LedgerError::Encoding(format!("failed to encode stage section: {err}"))
        })
    }
}
