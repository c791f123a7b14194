use std::fs;
use std::path::{Path, PathBuf};

use jsonschema::JSONSchema;
use phase_ledger_core::{FetcherRegistry, HandoffRequest, Packet, PipelinePhase};
use phase_ledger_pipeline::{HandoffService, Ledger, PipelineError, StagePipeline};
use phase_ledger_store_sqlite::SqliteLedgerStore;
use serde_json::{json, Value};

fn contract_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../contracts/packet/v1")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize contract dir: {err}"))
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn assert_schema(schema_name: &str, value: &Value) {
    let schema_path = contract_dir().join("schemas").join(schema_name);
    let schema = read_json(&schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

fn store() -> SqliteLedgerStore {
    let store = must(SqliteLedgerStore::open(Path::new(":memory:")));
    must(store.migrate());
    store
}

fn request(run_id: &str, fixture: &str, handoff_type: &str, to_phase: i64) -> HandoffRequest {
    let packet = read_json(&contract_dir().join("fixtures").join(fixture));
    HandoffRequest {
        run_id: run_id.to_string(),
        case_id: None,
        handoff_type: handoff_type.to_string(),
        from_phase: 1,
        to_phase,
        packet: must(Packet::from_value(packet)),
    }
}

#[test]
fn stored_handoff_packets_match_contract() {
    let store = store();
    let registry = FetcherRegistry::new();
    let ledger = Ledger::new(&store, &registry);
    let run_id = must(ledger.create_run("manual", &json!({})));
    must(ledger.append_event(run_id, "signal.detected", Some("edinet"), None, None));
    must(ledger.append_event(run_id, "run.finalized", Some("system"), None, None));

    let service = HandoffService::new(&store, &store);
    for (fixture, handoff_type, to_phase) in [
        ("heavy-handoff.sample.json", "heavy", 3),
        ("light-handoff.sample.json", "light", 5),
    ] {
        let created = must(service.create(&request(
            &run_id.to_string(),
            fixture,
            handoff_type,
            to_phase,
        )));
        let record = must(service.get(created.id));
        assert_schema("handoff-packet.schema.json", &record.packet.into_value());
    }
}

#[test]
fn stage_outputs_match_contract() {
    let store = store();
    let registry = FetcherRegistry::new();
    let ledger = Ledger::new(&store, &registry);
    let run_id = must(ledger.create_run("manual", &json!({})));
    let service = HandoffService::new(&store, &store);
    let created = must(service.create(&request(
        &run_id.to_string(),
        "heavy-handoff.sample.json",
        "heavy",
        3,
    )));

    let pipeline = StagePipeline::new(&store);
    let mut packet = must(service.get(created.id)).packet;
    for phase in PipelinePhase::ALL {
        let output = must(pipeline.advance(phase, Some(packet)));
        let encoded = must(serde_json::to_value(&output));
        assert_schema("stage-output.schema.json", &encoded);
        packet = output.packet;
    }
}

#[test]
fn schemas_carry_absolute_ids_and_compile() {
    for schema_name in [
        "handoff-packet.schema.json",
        "stage-output.schema.json",
        "error-envelope.schema.json",
    ] {
        let schema = read_json(&contract_dir().join("schemas").join(schema_name));
        let id = schema["$id"].as_str().unwrap_or_default();
        let (scheme, rest) = id
            .split_once("://")
            .unwrap_or_else(|| panic!("{schema_name} $id is not an absolute URI: {id:?}"));
        assert_eq!(scheme, "https", "{schema_name} $id scheme");
        assert!(
            rest.ends_with(&format!("/packet/v1/schemas/{schema_name}")),
            "{schema_name} $id does not name its own file: {id}"
        );
        if let Err(err) = JSONSchema::compile(&schema) {
            panic!("failed to compile {schema_name}: {err}");
        }
    }
}

#[test]
fn error_envelopes_match_contract() {
    for err in [
        PipelineError::Validation("packet required".to_string()),
        PipelineError::NotFound("handoff 01J0SQQP7M70P6Y3R4T8D8G8M2".to_string()),
        PipelineError::Storage(anyhow::anyhow!("database is locked")),
    ] {
        let envelope = phase_ledger_cli::error_envelope(&anyhow::Error::new(err));
        assert_schema("error-envelope.schema.json", &envelope);
    }
}
