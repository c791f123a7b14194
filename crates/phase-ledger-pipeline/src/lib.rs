//! Orchestration over the phase ledger stores.
//!
//! - [`Ledger`] creates, reads and finalizes runs and appends/list their events.
//! - [`HandoffService`] validates a phase-1 handoff, enriches it with the run's
//!   projection and persists it.
//! - [`StagePipeline`] advances an accepted packet through phases 2, 3 and 4.
//!
//! Every service validates its input before it touches storage.

#![forbid(unsafe_code)]

use phase_ledger_core::LedgerError;

mod fetchers;
mod handoff;
mod ledger;
mod stages;
#[cfg(test)]
mod test_support;

pub use fetchers::{default_registry, StubFetcher};
pub use handoff::{AttachedCase, HandoffCreated, HandoffService};
pub use ledger::{AppendReceipt, Ledger, RunView, HANDOFF_EVENT_WINDOW};
pub use stages::{PersistPolicy, StageOutput, StagePipeline};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<LedgerError> for PipelineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Validation(message) | LedgerError::Configuration(message) => {
                Self::Validation(message)
            }
            LedgerError::Encoding(message) => Self::Storage(anyhow::anyhow!(message)),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_errors_map_onto_the_pipeline_taxonomy() {
        let validation = PipelineError::from(LedgerError::Validation("bad".to_string()));
        assert_eq!(validation.kind(), "validation");
        assert_eq!(validation.to_string(), "bad");

        let encoding = PipelineError::from(LedgerError::Encoding("boom".to_string()));
        assert_eq!(encoding.kind(), "storage");

        let missing = PipelineError::NotFound("run 01J0SQQP7M70P6Y3R4T8D8G8M2".to_string());
        assert_eq!(missing.to_string(), "run 01J0SQQP7M70P6Y3R4T8D8G8M2 not found");
    }
}
