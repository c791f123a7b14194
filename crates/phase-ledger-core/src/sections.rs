//! Typed shapes of the per-phase sections carried in `packet.phases`.
//!
//! Every section keeps its known fields strongly typed and collects anything else in
//! an ordered `extensions` map, so a section written by a newer producer survives a
//! read-modify-write cycle through this crate unchanged.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{LedgerEvent, LedgerError, Phase1Projection, RunId, StageRunId};

/// Placeholder `industry_id` marking a phase-2 candidate no reviewer has filled in.
pub const INDUSTRY_SENTINEL: &str = "__unset__";

/// The stages of the packet pipeline that append a section to an accepted handoff.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum PipelinePhase {
    Phase2,
    Phase3,
    Phase4,
}

impl PipelinePhase {
    pub const ALL: [Self; 3] = [Self::Phase2, Self::Phase3, Self::Phase4];

    #[must_use]
    pub fn number(self) -> u8 {
        match self {
            Self::Phase2 => 2,
            Self::Phase3 => 3,
            Self::Phase4 => 4,
        }
    }

    /// Key of the section this stage writes into `packet.phases`.
    #[must_use]
    pub fn section_name(self) -> &'static str {
        match self {
            Self::Phase2 => "phase2",
            Self::Phase3 => "phase3",
            Self::Phase4 => "phase4",
        }
    }

    /// Key of the section this stage reads its upstream metadata from.
    #[must_use]
    pub fn previous_section_name(self) -> &'static str {
        match self {
            Self::Phase2 => "phase1",
            Self::Phase3 => "phase2",
            Self::Phase4 => "phase3",
        }
    }
}

impl TryFrom<u8> for PipelinePhase {
    type Error = LedgerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::Phase2),
            3 => Ok(Self::Phase3),
            4 => Ok(Self::Phase4),
            other => Err(LedgerError::Validation(format!(
                "pipeline phase must be 2, 3 or 4, got {other}"
            ))),
        }
    }
}

impl From<PipelinePhase> for u8 {
    fn from(value: PipelinePhase) -> Self {
        value.number()
    }
}

impl Display for PipelinePhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.section_name())
    }
}

/// `phases.phase1` (and the legacy top-level `phase1` alias) written at handoff time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase1Section {
    pub run_id: RunId,
    pub events: Vec<LedgerEvent>,
    pub meta: Phase1Projection,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl Phase1Section {
    #[must_use]
    pub fn new(run_id: RunId, events: Vec<LedgerEvent>, meta: Phase1Projection) -> Self {
        Self {
            run_id,
            events,
            meta,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DerivedFrom {
    pub phase1_run_id: String,
    pub event_refs: Vec<Value>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndustryCandidate {
    pub industry_id: String,
    pub source: String,
    pub derived_from: DerivedFrom,
    pub notes: Vec<Value>,
    pub confidence: Option<f64>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl IndustryCandidate {
    /// The single seeded candidate a fresh phase-2 section starts with.
    #[must_use]
    pub fn template(phase1_run_id: &str) -> Self {
        Self {
            industry_id: INDUSTRY_SENTINEL.to_string(),
            source: "system".to_string(),
            derived_from: DerivedFrom {
                phase1_run_id: phase1_run_id.to_string(),
                event_refs: Vec::new(),
                extensions: Map::new(),
            },
            notes: Vec::new(),
            confidence: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Phase2Meta {
    pub source_phase1_run_id: String,
    pub phase1_total_events: i64,
    pub phase1_last_seq: i64,
    pub phase1_finalized_present: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase2Section {
    pub run_id: StageRunId,
    pub industry_candidates: Vec<IndustryCandidate>,
    pub notes: Vec<Value>,
    pub meta: Phase2Meta,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl Phase2Section {
    #[must_use]
    pub fn template(run_id: StageRunId, meta: Phase2Meta) -> Self {
        Self {
            run_id,
            industry_candidates: vec![IndustryCandidate::template(&meta.source_phase1_run_id)],
            notes: Vec::new(),
            meta,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Positioning {
    pub target_customers: Vec<Value>,
    pub value_prop: String,
    pub key_competitors: Vec<Value>,
    pub differentiators: Vec<Value>,
    pub notes: Vec<Value>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Phase3Meta {
    pub source_phase2_run_id: String,
    pub phase2_industry_candidates_count: u64,
    pub phase2_template_present: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase3Section {
    pub run_id: StageRunId,
    pub positioning: Positioning,
    pub notes: Vec<Value>,
    pub meta: Phase3Meta,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl Phase3Section {
    #[must_use]
    pub fn template(run_id: StageRunId, meta: Phase3Meta) -> Self {
        Self {
            run_id,
            positioning: Positioning::default(),
            notes: Vec::new(),
            meta,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanSources {
    pub primary: Vec<Value>,
    pub secondary: Vec<Value>,
    pub data: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanArtifacts {
    pub notes_template_md: String,
    pub checklist: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResearchPlan {
    pub key_questions: Vec<Value>,
    pub hypotheses: Vec<Value>,
    pub info_needs: Vec<Value>,
    pub sources: PlanSources,
    pub artifacts: PlanArtifacts,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Phase4Meta {
    pub source_phase3_run_id: String,
    pub phase3_positioning_present: bool,
    pub source_phase2_run_id: String,
    pub phase2_industry_candidates_count: u64,
    pub phase2_template_present: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase4Section {
    pub run_id: StageRunId,
    pub research_plan: ResearchPlan,
    pub notes: Vec<Value>,
    pub meta: Phase4Meta,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl Phase4Section {
    #[must_use]
    pub fn template(run_id: StageRunId, meta: Phase4Meta) -> Self {
        Self {
            run_id,
            research_plan: ResearchPlan::default(),
            notes: Vec::new(),
            meta,
            extensions: Map::new(),
        }
    }
}
