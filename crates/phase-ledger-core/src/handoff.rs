//! Validation and enrichment of the phase-1 handoff packet.
//!
//! [`validate_handoff`] applies the handoff rules in a fixed order and reports the first
//! violated rule. On success the packet is lifted into a [`HandoffEnvelope`], whose known
//! fields are typed and whose unknown fields ride along untouched in `extensions`.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::packet::Packet;
use crate::sections::Phase1Section;
use crate::{parse_rfc3339, LedgerError, LedgerEvent, RunId};

const REQUIRED_PACKET_FIELDS: [&str; 8] = [
    "handoff_type",
    "from_phase",
    "to_phase",
    "universe_item_ids",
    "event_ids",
    "trigger_decision_id",
    "created_at",
    "payload",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HandoffType {
    Light,
    Heavy,
}

impl HandoffType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Heavy => "heavy",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "light" => Some(Self::Light),
            "heavy" => Some(Self::Heavy),
            _ => None,
        }
    }

    /// Light handoffs go to screening (phase 5), heavy ones to industry review (phase 3).
    #[must_use]
    pub fn target_phase(self) -> u8 {
        match self {
            Self::Light => 5,
            Self::Heavy => 3,
        }
    }
}

impl Display for HandoffType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handoff as submitted by a caller, before any rule has been checked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandoffRequest {
    pub run_id: String,
    #[serde(default)]
    pub case_id: Option<String>,
    pub handoff_type: String,
    pub from_phase: i64,
    pub to_phase: i64,
    #[serde(default)]
    pub packet: Packet,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LightPayload {
    pub summary_md: String,
    pub hypothesis_seeds: Vec<Value>,
    pub key_metrics: Map<String, Value>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeavyPayload {
    pub summary_md: String,
    pub industry_scope: String,
    pub value_pool_notes: String,
    pub key_questions: Vec<Value>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum HandoffPayload {
    Light(LightPayload),
    Heavy(HeavyPayload),
}

impl HandoffPayload {
    fn from_map(
        handoff_type: HandoffType,
        mut fields: Map<String, Value>,
    ) -> Result<Self, LedgerError> {
        let prefix = handoff_type.as_str();
        let summary_md = take_string(&mut fields, prefix, "summary_md")?;
        match handoff_type {
            HandoffType::Light => {
                let hypothesis_seeds = take_array(&mut fields, prefix, "hypothesis_seeds")?;
                let key_metrics = match fields.remove("key_metrics") {
                    Some(Value::Object(metrics)) => metrics,
                    _ => return Err(missing(prefix, "key_metrics")),
                };
                Ok(Self::Light(LightPayload {
                    summary_md,
                    hypothesis_seeds,
                    key_metrics,
                    extensions: fields,
                }))
            }
            HandoffType::Heavy => {
                let industry_scope = take_string(&mut fields, prefix, "industry_scope")?;
                let value_pool_notes = take_string(&mut fields, prefix, "value_pool_notes")?;
                let key_questions = take_array(&mut fields, prefix, "key_questions")?;
                Ok(Self::Heavy(HeavyPayload {
                    summary_md,
                    industry_scope,
                    value_pool_notes,
                    key_questions,
                    extensions: fields,
                }))
            }
        }
    }
}

fn missing(prefix: &str, field: &str) -> LedgerError {
    LedgerError::Validation(format!("{prefix}.payload.{field} required"))
}

fn take_string(
    fields: &mut Map<String, Value>,
    prefix: &str,
    field: &str,
) -> Result<String, LedgerError> {
    match fields.remove(field) {
        Some(Value::String(value)) => Ok(value),
        _ => Err(missing(prefix, field)),
    }
}

fn take_array(
    fields: &mut Map<String, Value>,
    prefix: &str,
    field: &str,
) -> Result<Vec<Value>, LedgerError> {
    match fields.remove(field) {
        Some(Value::Array(values)) => Ok(values),
        _ => Err(missing(prefix, field)),
    }
}

/// An accepted handoff packet with typed envelope fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandoffEnvelope {
    pub handoff_type: HandoffType,
    pub from_phase: u8,
    pub to_phase: u8,
    pub universe_item_ids: Value,
    pub event_ids: Value,
    pub trigger_decision_id: Value,
    pub created_at: String,
    pub payload: HandoffPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase1: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_events: Option<Value>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl HandoffEnvelope {
    /// Attaches the run's ledger page and its projection: `run_events`, the legacy
    /// top-level `phase1`, `phases.phase1` and `version = 1`. Other sections already
    /// present under `phases` are kept.
    ///
    /// # Errors
    /// Returns [`LedgerError::Encoding`] when the events or section cannot be serialized.
    pub fn enrich(mut self, section: &Phase1Section) -> Result<Self, LedgerError> {
        let events = serde_json::to_value(&section.events)
            .map_err(|err| LedgerError::Encoding(format!("failed to encode run events: {err}")))?;
        let phase1 = serde_json::to_value(section).map_err(|err| {
            LedgerError::Encoding(format!("failed to encode phase1 section: {err}"))
        })?;

        self.run_events = Some(events);
        self.phase1 = Some(phase1.clone());
        self.version = Some(Number::from(1));
        self.phases
            .get_or_insert_with(Map::new)
            .insert("phase1".to_string(), phase1);
        Ok(self)
    }

    /// # Errors
    /// Returns [`LedgerError::Encoding`] when the envelope cannot be serialized.
    pub fn into_packet(self) -> Result<Packet, LedgerError> {
        let value = serde_json::to_value(&self)
            .map_err(|err| LedgerError::Encoding(format!("failed to encode packet: {err}")))?;
        Packet::from_value(value)
    }
}

/// Output of [`validate_handoff`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedHandoff {
    pub run_id: RunId,
    pub case_id: Option<String>,
    pub envelope: HandoffEnvelope,
}

impl ValidatedHandoff {
    #[must_use]
    pub fn handoff_type(&self) -> HandoffType {
        self.envelope.handoff_type
    }
}

fn invalid(message: &str) -> LedgerError {
    LedgerError::Validation(message.to_string())
}

fn number_equals(value: Option<&Value>, expected: i64) -> bool {
    let Some(Value::Number(number)) = value else {
        return false;
    };
    if let Some(int) = number.as_i64() {
        return int == expected;
    }
    #[allow(clippy::cast_precision_loss)]
    let expected = expected as f64;
    number
        .as_f64()
        .is_some_and(|float| float.fract() == 0.0 && (float - expected).abs() < f64::EPSILON)
}

fn check_phase1_entry(raw: &Value, run_id: &str) -> Result<(), LedgerError> {
    let Some(phase1) = raw.as_object() else {
        return Err(invalid("packet.phase1 must be object"));
    };
    if let Some(entry_run_id) = phase1.get("run_id") {
        let Some(entry_run_id) = entry_run_id.as_str() else {
            return Err(invalid("packet.phase1.run_id must be string"));
        };
        if entry_run_id != run_id {
            return Err(invalid("packet.phase1.run_id mismatch"));
        }
    }
    if let Some(events) = phase1.get("events") {
        if !events.is_array() {
            return Err(invalid("packet.phase1.events must be array"));
        }
    }
    Ok(())
}

/// Checks a handoff request against the transition rules, first failure wins:
/// phase numbers, handoff type, type/target agreement, required packet fields, packet
/// agreement with the request, `created_at`, `payload`, `version`, embedded phase-1
/// sections, then the payload shape for the handoff type.
///
/// # Errors
/// Returns [`LedgerError::Validation`] naming the violated rule.
pub fn validate_handoff(request: &HandoffRequest) -> Result<ValidatedHandoff, LedgerError> {
    if request.from_phase != 1 {
        return Err(invalid("from_phase must be 1"));
    }
    if request.to_phase != 3 && request.to_phase != 5 {
        return Err(invalid("to_phase must be 3 or 5"));
    }
    let Some(handoff_type) = HandoffType::parse(&request.handoff_type) else {
        return Err(invalid("handoff_type must be light or heavy"));
    };
    if i64::from(handoff_type.target_phase()) != request.to_phase {
        return Err(match handoff_type {
            HandoffType::Light => invalid("light must go to phase 5"),
            HandoffType::Heavy => invalid("heavy must go to phase 3"),
        });
    }

    let packet = &request.packet;
    if let Some(field) = REQUIRED_PACKET_FIELDS
        .iter()
        .find(|field| !packet.contains(field))
    {
        return Err(LedgerError::Validation(format!("packet missing {field}")));
    }

    if packet.get("handoff_type").and_then(Value::as_str) != Some(handoff_type.as_str()) {
        return Err(invalid("packet.handoff_type mismatch"));
    }
    if !number_equals(packet.get("from_phase"), request.from_phase) {
        return Err(invalid("packet.from_phase mismatch"));
    }
    if !number_equals(packet.get("to_phase"), request.to_phase) {
        return Err(invalid("packet.to_phase mismatch"));
    }

    let Some(created_at) = packet.get("created_at").and_then(Value::as_str) else {
        return Err(invalid("packet.created_at must be string"));
    };
    if parse_rfc3339(created_at).is_err() {
        return Err(invalid("packet.created_at must be RFC3339"));
    }

    let Some(payload) = packet.get("payload").and_then(Value::as_object) else {
        return Err(invalid("packet.payload must be object"));
    };

    let version = match packet.get("version") {
        None => None,
        Some(Value::Number(number)) => Some(number.clone()),
        Some(_) => return Err(invalid("packet.version must be number")),
    };

    let phases = match packet.get("phases") {
        None => None,
        Some(Value::Object(phases)) => Some(phases.clone()),
        Some(_) => return Err(invalid("packet.phases must be object")),
    };
    if let Some(phase1) = phases.as_ref().and_then(|phases| phases.get("phase1")) {
        check_phase1_entry(phase1, &request.run_id)?;
    }
    if let Some(phase1) = packet.get("phase1") {
        check_phase1_entry(phase1, &request.run_id)?;
    }

    let payload = HandoffPayload::from_map(handoff_type, payload.clone())?;
    let run_id: RunId = request.run_id.parse()?;

    let mut extensions = packet.fields().clone();
    for known in REQUIRED_PACKET_FIELDS
        .iter()
        .chain(["version", "phases", "phase1", "run_events"].iter())
    {
        extensions.remove(*known);
    }

    let envelope = HandoffEnvelope {
        handoff_type,
        from_phase: 1,
        to_phase: handoff_type.target_phase(),
        universe_item_ids: packet.get("universe_item_ids").cloned().unwrap_or_default(),
        event_ids: packet.get("event_ids").cloned().unwrap_or_default(),
        trigger_decision_id: packet.get("trigger_decision_id").cloned().unwrap_or_default(),
        created_at: created_at.to_string(),
        payload,
        version,
        phases,
        phase1: packet.get("phase1").cloned(),
        run_events: packet.get("run_events").cloned(),
        extensions,
    };

    Ok(ValidatedHandoff {
        run_id,
        case_id: request.case_id.clone(),
        envelope,
    })
}

/// Builds the phase-1 section for a run from one page of its ledger.
#[must_use]
pub fn phase1_section(run_id: RunId, events: Vec<LedgerEvent>) -> Phase1Section {
    let meta = crate::project_phase1_events(&events);
    Phase1Section::new(run_id, events, meta)
}
