//! The packet envelope passed from phase to phase.
//!
//! A [`Packet`] is an ordered JSON object. Stages only ever add a section under
//! `phases` (and default `version`), so the packet at any boundary is a complete history
//! of the workflow. Reads of upstream sections are lenient: a section that is missing or
//! mistyped yields default metadata rather than an error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::sections::{Phase2Meta, Phase3Meta, Phase4Meta, INDUSTRY_SENTINEL};
use crate::LedgerError;

pub const PACKET_VERSION: u64 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Packet(Map<String, Value>);

impl Packet {
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// # Errors
    /// Returns [`LedgerError::Validation`] when `value` is not a JSON object.
    pub fn from_value(value: Value) -> Result<Self, LedgerError> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            _ => Err(LedgerError::invalid("packet must be object")),
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    #[must_use]
    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Accepts a missing version or any numeric representation equal to 1.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for any other `version`.
    pub fn check_version_one(&self) -> Result<(), LedgerError> {
        match self.0.get("version") {
            None => Ok(()),
            Some(value) if is_version_one(value) => Ok(()),
            Some(_) => Err(LedgerError::invalid("packet.version must be number 1")),
        }
    }

    /// Returns a copy of `phases`, or an empty map when the packet has none.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when `phases` is present but not an object.
    pub fn phases(&self) -> Result<Map<String, Value>, LedgerError> {
        match self.0.get("phases") {
            None => Ok(Map::new()),
            Some(Value::Object(phases)) => Ok(phases.clone()),
            Some(_) => Err(LedgerError::invalid("packet.phases must be object")),
        }
    }

    /// Adds (or overwrites) one named section under `phases` and defaults `version`
    /// to 1. Every other key is left untouched.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when `phases` is present but not an object.
    pub fn set_phase_section(&mut self, name: &str, section: Value) -> Result<(), LedgerError> {
        let mut phases = self.phases()?;
        phases.insert(name.to_string(), section);
        self.0.insert("phases".to_string(), Value::Object(phases));
        self.0
            .entry("version")
            .or_insert_with(|| Value::from(PACKET_VERSION));
        Ok(())
    }
}

impl From<Packet> for Value {
    fn from(packet: Packet) -> Self {
        packet.into_value()
    }
}

#[must_use]
pub fn is_version_one(value: &Value) -> bool {
    match value {
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                int == 1
            } else if let Some(uint) = number.as_u64() {
                uint == 1
            } else {
                number
                    .as_f64()
                    .is_some_and(|float| (float - 1.0).abs() < f64::EPSILON)
            }
        }
        _ => false,
    }
}

/// Reads an integer leniently: integral numbers as-is, floats truncated toward zero.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn lenient_int(value: Option<&Value>) -> Option<i64> {
    let Some(Value::Number(number)) = value else {
        return None;
    };
    if let Some(int) = number.as_i64() {
        return Some(int);
    }
    if let Some(uint) = number.as_u64() {
        return Some(i64::try_from(uint).unwrap_or(i64::MAX));
    }
    number.as_f64().map(|float| float.trunc() as i64)
}

fn lenient_str(section: &Map<String, Value>, key: &str) -> String {
    section
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn object<'a>(phases: &'a Map<String, Value>, name: &str) -> Option<&'a Map<String, Value>> {
    phases.get(name).and_then(Value::as_object)
}

impl Phase2Meta {
    /// Extracts phase-1 metadata from `phases.phase1`.
    #[must_use]
    pub fn from_phases(phases: &Map<String, Value>) -> Self {
        let Some(phase1) = object(phases, "phase1") else {
            return Self::default();
        };
        let meta = phase1.get("meta").and_then(Value::as_object);
        Self {
            source_phase1_run_id: lenient_str(phase1, "run_id"),
            phase1_total_events: meta
                .and_then(|meta| lenient_int(meta.get("total_events")))
                .unwrap_or_default(),
            phase1_last_seq: meta
                .and_then(|meta| lenient_int(meta.get("last_seq")))
                .unwrap_or_default(),
            phase1_finalized_present: meta
                .and_then(|meta| meta.get("finalized_present"))
                .and_then(Value::as_bool)
                .unwrap_or_default(),
        }
    }
}

impl Phase3Meta {
    /// Extracts phase-2 metadata from `phases.phase2`, flagging a candidate list that
    /// still carries the sentinel template.
    #[must_use]
    pub fn from_phases(phases: &Map<String, Value>) -> Self {
        let Some(phase2) = object(phases, "phase2") else {
            return Self::default();
        };
        let candidates = phase2
            .get("industry_candidates")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let template_present = candidates.iter().any(|candidate| {
            candidate.get("industry_id").and_then(Value::as_str) == Some(INDUSTRY_SENTINEL)
        });
        Self {
            source_phase2_run_id: lenient_str(phase2, "run_id"),
            phase2_industry_candidates_count: candidates.len() as u64,
            phase2_template_present: template_present,
        }
    }
}

impl Phase4Meta {
    #[must_use]
    pub fn from_phases(phases: &Map<String, Value>) -> Self {
        let phase2 = Phase3Meta::from_phases(phases);
        let (source_phase3_run_id, phase3_positioning_present) = object(phases, "phase3")
            .map(|phase3| {
                (
                    lenient_str(phase3, "run_id"),
                    phase3.get("positioning").is_some_and(Value::is_object),
                )
            })
            .unwrap_or_default();
        Self {
            source_phase3_run_id,
            phase3_positioning_present,
            source_phase2_run_id: phase2.source_phase2_run_id,
            phase2_industry_candidates_count: phase2.phase2_industry_candidates_count,
            phase2_template_present: phase2.phase2_template_present,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn packet(value: Value) -> Packet {
        must(Packet::from_value(value))
    }

    #[test]
    fn version_accepts_any_numeric_one() {
        assert!(is_version_one(&json!(1)));
        assert!(is_version_one(&json!(1.0)));
        assert!(!is_version_one(&json!(2)));
        assert!(!is_version_one(&json!("1")));
        assert!(!is_version_one(&json!(null)));
    }

    #[test]
    fn non_numeric_version_is_rejected_regardless_of_phases() {
        let candidate = packet(json!({"version": "one", "phases": {"phase1": {}}}));
        assert_eq!(
            candidate.check_version_one(),
            Err(LedgerError::Validation(
                "packet.version must be number 1".to_string()
            ))
        );
    }

    #[test]
    fn phases_default_to_empty_and_reject_non_objects() {
        assert!(must(packet(json!({})).phases()).is_empty());
        assert!(packet(json!({"phases": []})).phases().is_err());
    }

    #[test]
    fn set_phase_section_keeps_existing_sections_and_keys() {
        let mut candidate = packet(json!({
            "keep": true,
            "phases": {"phase1": {"run_id": "a"}}
        }));
        must(candidate.set_phase_section("phase2", json!({"run_id": "b"})));

        assert_eq!(candidate.get("keep"), Some(&json!(true)));
        assert_eq!(candidate.get("version"), Some(&json!(1)));
        let phases = must(candidate.phases());
        assert_eq!(phases.get("phase1"), Some(&json!({"run_id": "a"})));
        assert_eq!(phases.get("phase2"), Some(&json!({"run_id": "b"})));
    }

    #[test]
    fn set_phase_section_leaves_existing_version_alone() {
        let mut candidate = packet(json!({"version": 1.0}));
        must(candidate.set_phase_section("phase3", json!({})));
        assert_eq!(candidate.get("version"), Some(&json!(1.0)));
    }

    #[test]
    fn phase2_meta_reads_float_counts_leniently() {
        let phases = packet(json!({
            "phase1": {
                "run_id": "run-a",
                "meta": {"total_events": 4.0, "last_seq": 9.7, "finalized_present": true}
            }
        }))
        .into_fields();
        let meta = Phase2Meta::from_phases(&phases);
        assert_eq!(meta.source_phase1_run_id, "run-a");
        assert_eq!(meta.phase1_total_events, 4);
        assert_eq!(meta.phase1_last_seq, 9);
        assert!(meta.phase1_finalized_present);
    }

    #[test]
    fn phase2_meta_defaults_when_section_is_mistyped() {
        let phases = packet(json!({"phase1": "nope"})).into_fields();
        assert_eq!(Phase2Meta::from_phases(&phases), Phase2Meta::default());
    }

    #[test]
    fn phase3_meta_detects_sentinel_candidates() {
        let phases = packet(json!({
            "phase2": {
                "run_id": "stage-2",
                "industry_candidates": [
                    {"industry_id": "utilities"},
                    {"industry_id": "__unset__"}
                ]
            }
        }))
        .into_fields();
        let meta = Phase3Meta::from_phases(&phases);
        assert_eq!(meta.source_phase2_run_id, "stage-2");
        assert_eq!(meta.phase2_industry_candidates_count, 2);
        assert!(meta.phase2_template_present);
    }

    #[test]
    fn phase4_meta_reads_phase3_and_phase2_transitively() {
        let phases = packet(json!({
            "phase2": {"run_id": "s2", "industry_candidates": [{"industry_id": "x"}]},
            "phase3": {"run_id": "s3", "positioning": {}}
        }))
        .into_fields();
        let meta = Phase4Meta::from_phases(&phases);
        assert_eq!(meta.source_phase3_run_id, "s3");
        assert!(meta.phase3_positioning_present);
        assert_eq!(meta.source_phase2_run_id, "s2");
        assert_eq!(meta.phase2_industry_candidates_count, 1);
        assert!(!meta.phase2_template_present);
    }
}
