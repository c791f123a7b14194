//! Domain model for the phase ledger: runs, the append-only per-run event ledger,
//! the phase-1 projection, the handoff packet envelope and the phase sections the
//! pipeline stages append to it.
//!
//! Everything in this crate is storage-agnostic. Persistence is reached only through
//! the traits in [`store`], and the document-fetch capability through [`fetch`].

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod fetch;
pub mod handoff;
pub mod lock;
pub mod packet;
pub mod sections;
pub mod store;

pub use fetch::{Document, DocumentFetcher, FetchConfig, FetcherRegistry};
pub use handoff::{
    phase1_section, validate_handoff, HandoffEnvelope, HandoffPayload, HandoffRequest,
    HandoffType, HeavyPayload, LightPayload, ValidatedHandoff,
};
pub use lock::{KeyedLocks, NamedLock, NamedLockGuard};
pub use packet::Packet;
pub use sections::{
    IndustryCandidate, Phase1Section, Phase2Meta, Phase2Section, Phase3Meta, Phase3Section,
    Phase4Meta, Phase4Section, PipelinePhase, Positioning, ResearchPlan, INDUSTRY_SENTINEL,
};
pub use store::{HandoffStore, LedgerStore, StageRunStore};

/// Maximum page size accepted by event listing.
pub const MAX_EVENT_PAGE: u32 = 200;
/// Page size used when a caller does not ask for one.
pub const DEFAULT_EVENT_PAGE: u32 = 50;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl LedgerError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = LedgerError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
                    LedgerError::Validation(format!(
                        "invalid {} '{raw}': {err}",
                        stringify!($name)
                    ))
                })
            }
        }
    };
}

ulid_id!(
    /// Identity of one workflow run and its event ledger.
    RunId
);
ulid_id!(HandoffId);
ulid_id!(
    /// Identity of one pipeline stage invocation (phase 2, 3 or 4).
    StageRunId
);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LedgerEventType {
    #[serde(rename = "run.finalized")]
    RunFinalized,
    #[serde(rename = "doc.fetched")]
    DocFetched,
    #[serde(rename = "note.added")]
    NoteAdded,
    #[serde(rename = "signal.detected")]
    SignalDetected,
    #[serde(rename = "universe.member_added")]
    UniverseMemberAdded,
}

impl LedgerEventType {
    pub const ALL: [Self; 5] = [
        Self::RunFinalized,
        Self::DocFetched,
        Self::NoteAdded,
        Self::SignalDetected,
        Self::UniverseMemberAdded,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunFinalized => "run.finalized",
            Self::DocFetched => "doc.fetched",
            Self::NoteAdded => "note.added",
            Self::SignalDetected => "signal.detected",
            Self::UniverseMemberAdded => "universe.member_added",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "run.finalized" => Some(Self::RunFinalized),
            "doc.fetched" => Some(Self::DocFetched),
            "note.added" => Some(Self::NoteAdded),
            "signal.detected" => Some(Self::SignalDetected),
            "universe.member_added" => Some(Self::UniverseMemberAdded),
            _ => None,
        }
    }
}

impl Display for LedgerEventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Manual,
    System,
    Sec,
    Edinet,
    Other,
}

impl EventSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::System => "system",
            Self::Sec => "sec",
            Self::Edinet => "edinet",
            Self::Other => "other",
        }
    }

    /// Maps a free-form source label onto the closed source set. Never fails:
    /// blank input is `manual`, anything unrecognised is `other`.
    #[must_use]
    pub fn normalize(value: &str) -> Self {
        match value.trim() {
            "" | "manual" => Self::Manual,
            "system" => Self::System,
            "sec" => Self::Sec,
            "edinet" => Self::Edinet,
            _ => Self::Other,
        }
    }
}

impl Display for EventSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub mode: String,
    pub status: RunStatus,
    pub config: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEvent {
    pub run_id: RunId,
    pub seq: i64,
    pub event_type: LedgerEventType,
    pub source: EventSource,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    pub payload: Map<String, Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A validated append request. The sequence number and creation time are
/// assigned by the ledger store, never by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEventInput {
    pub run_id: RunId,
    pub event_type: LedgerEventType,
    pub source: EventSource,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    pub payload: Map<String, Value>,
}

impl LedgerEventInput {
    /// Builds an append request from loosely typed caller input, applying the
    /// ledger defaults: blank source is `manual`, missing timestamp is now,
    /// missing or null payload is an empty object.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the event type is empty or not one
    /// of the allowed literals, or when the payload is not a JSON object.
    pub fn from_raw(
        run_id: RunId,
        event_type: &str,
        source: Option<&str>,
        occurred_at: Option<OffsetDateTime>,
        payload: Option<Value>,
    ) -> Result<Self, LedgerError> {
        if event_type.trim().is_empty() {
            return Err(LedgerError::invalid("event_type required"));
        }
        let Some(event_type) = LedgerEventType::parse(event_type) else {
            return Err(LedgerError::Validation(format!(
                "unknown event_type: {}",
                event_type.trim()
            )));
        };

        let payload = match payload {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(LedgerError::invalid("payload must be an object")),
        };

        Ok(Self {
            run_id,
            event_type,
            source: EventSource::normalize(source.unwrap_or_default()),
            occurred_at: occurred_at.map_or_else(now_utc, |value| value.to_offset(UtcOffset::UTC)),
            payload,
        })
    }
}

/// Paging request for [`store::LedgerStore::list_events`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventPageRequest {
    pub limit: Option<u32>,
    /// Exclusive upper bound on creation time.
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub cursor: Option<OffsetDateTime>,
}

impl EventPageRequest {
    #[must_use]
    pub fn latest(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            cursor: None,
        }
    }

    #[must_use]
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .map_or(DEFAULT_EVENT_PAGE, |limit| limit.clamp(1, MAX_EVENT_PAGE))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventPage {
    pub items: Vec<LedgerEvent>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub next_cursor: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandoffRecord {
    pub id: HandoffId,
    pub run_id: RunId,
    pub case_id: Option<String>,
    pub handoff_type: HandoffType,
    pub from_phase: u8,
    pub to_phase: u8,
    pub packet: Packet,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Everything needed to persist an accepted handoff.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHandoff {
    pub run_id: RunId,
    pub case_id: Option<String>,
    pub handoff_type: HandoffType,
    pub from_phase: u8,
    pub to_phase: u8,
    pub packet: Packet,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageRunRecord {
    pub id: StageRunId,
    pub phase: PipelinePhase,
    pub packet: Packet,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Summary of a run's ledger consumed by the later phases. Never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Phase1Projection {
    pub total_events: u64,
    pub counts_by_type: BTreeMap<String, u64>,
    pub counts_by_source: BTreeMap<String, u64>,
    pub doc_fetched_count: u64,
    pub finalized_present: bool,
    pub last_seq: i64,
}

/// Folds ledger events into a [`Phase1Projection`].
///
/// The fold is order-independent: `last_seq` is the maximum sequence number seen,
/// not the sequence of whichever event happens to come last in `events`.
#[must_use]
pub fn project_phase1_events(events: &[LedgerEvent]) -> Phase1Projection {
    let mut projection = Phase1Projection::default();

    for event in events {
        projection.total_events += 1;
        *projection
            .counts_by_type
            .entry(event.event_type.as_str().to_string())
            .or_insert(0) += 1;
        *projection
            .counts_by_source
            .entry(event.source.as_str().to_string())
            .or_insert(0) += 1;

        match event.event_type {
            LedgerEventType::DocFetched => projection.doc_fetched_count += 1,
            LedgerEventType::RunFinalized => projection.finalized_present = true,
            _ => {}
        }

        projection.last_seq = projection.last_seq.max(event.seq);
    }

    projection
}

/// Parses an RFC3339 timestamp with any offset and normalizes it to UTC.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when parsing fails.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, LedgerError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        .map_err(|err| LedgerError::Validation(format!("invalid RFC3339 timestamp: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::Encoding`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Encoding(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_run_id() -> RunId {
        must("01J0SQQP7M70P6Y3R4T8D8G8M2".parse())
    }

    fn fixture_event(seq: i64, event_type: LedgerEventType, source: EventSource) -> LedgerEvent {
        let at = must(parse_rfc3339("2026-01-24T00:00:00Z"));
        LedgerEvent {
            run_id: fixture_run_id(),
            seq,
            event_type,
            source,
            occurred_at: at,
            payload: Map::new(),
            created_at: at,
        }
    }

    #[test]
    fn empty_projection_is_zeroed() {
        let projection = project_phase1_events(&[]);
        assert_eq!(projection.total_events, 0);
        assert_eq!(projection.last_seq, 0);
        assert!(!projection.finalized_present);
        assert!(projection.counts_by_type.is_empty());
        assert!(projection.counts_by_source.is_empty());
        assert_eq!(projection.doc_fetched_count, 0);
    }

    #[test]
    fn doc_fetched_and_finalized_are_counted() {
        let events = vec![
            fixture_event(1, LedgerEventType::DocFetched, EventSource::Manual),
            fixture_event(2, LedgerEventType::RunFinalized, EventSource::System),
        ];

        let projection = project_phase1_events(&events);
        assert_eq!(projection.total_events, 2);
        assert_eq!(projection.doc_fetched_count, 1);
        assert!(projection.finalized_present);
        assert_eq!(projection.last_seq, 2);
        assert_eq!(projection.counts_by_type.get("doc.fetched"), Some(&1));
        assert_eq!(projection.counts_by_source.get("system"), Some(&1));
    }

    #[test]
    fn last_seq_is_the_maximum_not_the_last_element() {
        let events = vec![
            fixture_event(7, LedgerEventType::NoteAdded, EventSource::Manual),
            fixture_event(3, LedgerEventType::NoteAdded, EventSource::Manual),
        ];
        assert_eq!(project_phase1_events(&events).last_seq, 7);
    }

    #[test]
    fn projection_serializes_with_wire_field_names() {
        let projection = project_phase1_events(&[fixture_event(
            1,
            LedgerEventType::DocFetched,
            EventSource::Sec,
        )]);
        let value = must(serde_json::to_value(&projection));
        assert_eq!(value["total_events"], serde_json::json!(1));
        assert_eq!(value["doc_fetched_count"], serde_json::json!(1));
        assert_eq!(value["counts_by_source"]["sec"], serde_json::json!(1));
        assert_eq!(value["finalized_present"], serde_json::json!(false));
    }

    #[test]
    fn source_normalization_follows_closed_set() {
        assert_eq!(EventSource::normalize(""), EventSource::Manual);
        assert_eq!(EventSource::normalize("   "), EventSource::Manual);
        assert_eq!(EventSource::normalize("edinet"), EventSource::Edinet);
        assert_eq!(EventSource::normalize("unknown"), EventSource::Other);
        assert_eq!(EventSource::normalize("SEC"), EventSource::Other);
    }

    #[test]
    fn event_input_rejects_unknown_and_empty_types() {
        let unknown = LedgerEventInput::from_raw(fixture_run_id(), "doc.deleted", None, None, None);
        assert_eq!(
            unknown,
            Err(LedgerError::Validation(
                "unknown event_type: doc.deleted".to_string()
            ))
        );

        let empty = LedgerEventInput::from_raw(fixture_run_id(), "  ", None, None, None);
        assert_eq!(
            empty,
            Err(LedgerError::Validation("event_type required".to_string()))
        );
    }

    #[test]
    fn event_input_applies_defaults() {
        let input = must(LedgerEventInput::from_raw(
            fixture_run_id(),
            " note.added ",
            Some(""),
            None,
            Some(Value::Null),
        ));
        assert_eq!(input.event_type, LedgerEventType::NoteAdded);
        assert_eq!(input.source, EventSource::Manual);
        assert!(input.payload.is_empty());
        assert_eq!(input.occurred_at.offset(), UtcOffset::UTC);
    }

    #[test]
    fn event_input_rejects_non_object_payload() {
        let result = LedgerEventInput::from_raw(
            fixture_run_id(),
            "note.added",
            None,
            None,
            Some(serde_json::json!([1, 2])),
        );
        assert!(matches!(result, Err(LedgerError::Validation(_))));
    }

    #[test]
    fn event_input_normalizes_offsets_to_utc() {
        let occurred = must(OffsetDateTime::parse(
            "2026-01-24T09:00:00+09:00",
            &time::format_description::well_known::Rfc3339,
        ));
        let input = must(LedgerEventInput::from_raw(
            fixture_run_id(),
            "signal.detected",
            Some("sec"),
            Some(occurred),
            None,
        ));
        assert_eq!(input.occurred_at.offset(), UtcOffset::UTC);
        assert_eq!(input.occurred_at, occurred);
    }

    #[test]
    fn page_limit_is_clamped() {
        assert_eq!(EventPageRequest::default().effective_limit(), 50);
        assert_eq!(EventPageRequest::latest(0).effective_limit(), 1);
        assert_eq!(EventPageRequest::latest(500).effective_limit(), 200);
        assert_eq!(EventPageRequest::latest(75).effective_limit(), 75);
    }

    #[test]
    fn ledger_event_wire_shape_uses_dotted_types_and_rfc3339() {
        let event = fixture_event(1, LedgerEventType::UniverseMemberAdded, EventSource::Other);
        let value = must(serde_json::to_value(&event));
        assert_eq!(value["event_type"], serde_json::json!("universe.member_added"));
        assert_eq!(value["source"], serde_json::json!("other"));
        assert_eq!(value["occurred_at"], serde_json::json!("2026-01-24T00:00:00Z"));
        assert_eq!(value["run_id"], serde_json::json!("01J0SQQP7M70P6Y3R4T8D8G8M2"));
    }

    fn event_type_from_code(code: u8) -> LedgerEventType {
        LedgerEventType::ALL[usize::from(code) % LedgerEventType::ALL.len()]
    }

    fn source_from_code(code: u8) -> EventSource {
        match code % 5 {
            0 => EventSource::Manual,
            1 => EventSource::System,
            2 => EventSource::Sec,
            3 => EventSource::Edinet,
            _ => EventSource::Other,
        }
    }

    proptest! {
        #[test]
        fn prop_projection_is_order_invariant(
            stream in prop::collection::vec((0u8..5, 0u8..5, 1i64..10_000), 0..60),
            rotation in 0usize..60,
        ) {
            let events: Vec<LedgerEvent> = stream
                .iter()
                .map(|(kind, source, seq)| {
                    fixture_event(*seq, event_type_from_code(*kind), source_from_code(*source))
                })
                .collect();

            let mut reordered = events.clone();
            reordered.reverse();
            if !reordered.is_empty() {
                let shift = rotation % reordered.len();
                reordered.rotate_left(shift);
            }

            let forward = project_phase1_events(&events);
            let shuffled = project_phase1_events(&reordered);
            prop_assert_eq!(&forward, &shuffled);

            let expected_max = events.iter().map(|event| event.seq).max().unwrap_or(0);
            prop_assert_eq!(forward.last_seq, expected_max);
        }
    }
}
