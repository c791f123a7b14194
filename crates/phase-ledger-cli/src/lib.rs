//! Command surface for the phase ledger.
//!
//! Every subcommand prints one pretty JSON document on stdout. Failures print an
//! `{"error": {"kind", "message"}}` envelope instead (see [`error_envelope`]) and the
//! binary exits non-zero. Logs go to stderr.
//!
//! Hosts that embed the ledger call [`run_cli`] with a parsed [`Cli`]; only the `pl`
//! binary installs a tracing subscriber.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use phase_ledger_core::{
    parse_rfc3339, EventPageRequest, HandoffId, HandoffRequest, LedgerError, Packet,
    PipelinePhase, RunStatus, StageRunId,
};
use phase_ledger_pipeline::{
    default_registry, HandoffService, Ledger, PipelineError, PipelineResult, StagePipeline,
};
use phase_ledger_store_sqlite::SqliteLedgerStore;

/// Environment variable holding the log filter; `RUST_LOG` is read when it is unset.
pub const LOG_ENV: &str = "PHASE_LEDGER_LOG";

#[derive(Debug, Parser)]
#[command(name = "pl")]
#[command(about = "Phase ledger: run events, handoffs and pipeline stages")]
pub struct Cli {
    #[arg(long, default_value = "./phase_ledger.sqlite3")]
    pub db: PathBuf,

    /// Emit log lines as JSON.
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Run {
        #[command(subcommand)]
        command: RunCommand,
    },
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },
    Handoff {
        #[command(subcommand)]
        command: HandoffCommand,
    },
    Stage {
        #[command(subcommand)]
        command: StageCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum RunCommand {
    Create {
        #[arg(long, default_value = "manual")]
        mode: String,
        #[arg(long, default_value = "{}")]
        config_json: String,
    },
    Show {
        #[arg(long)]
        run_id: String,
    },
    Finalize {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        status: FinalStatusArg,
        #[arg(long)]
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FinalStatusArg {
    Success,
    Failed,
}

impl From<FinalStatusArg> for RunStatus {
    fn from(value: FinalStatusArg) -> Self {
        match value {
            FinalStatusArg::Success => Self::Success,
            FinalStatusArg::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    Append(AppendArgs),
    List {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        limit: Option<u32>,
        /// RFC3339 `next_cursor` from a previous page.
        #[arg(long)]
        cursor: Option<String>,
    },
    Project {
        #[arg(long)]
        run_id: String,
    },
}

#[derive(Debug, Args)]
pub struct AppendArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long = "type")]
    event_type: String,
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    occurred_at: Option<String>,
    #[arg(long)]
    payload_json: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum HandoffCommand {
    Create(HandoffCreateArgs),
    Show {
        #[arg(long)]
        id: String,
    },
    List {
        #[arg(long)]
        run_id: String,
    },
    AttachCase {
        #[arg(long)]
        id: String,
        #[arg(long)]
        case_id: String,
    },
}

#[derive(Debug, Args)]
pub struct HandoffCreateArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long = "type")]
    handoff_type: String,
    #[arg(long, default_value_t = 1)]
    from_phase: i64,
    #[arg(long)]
    to_phase: i64,
    #[arg(long)]
    case_id: Option<String>,
    #[command(flatten)]
    packet: PacketSource,
}

#[derive(Debug, Args)]
pub struct PacketSource {
    #[arg(long, conflicts_with = "packet_file")]
    packet_json: Option<String>,
    #[arg(long)]
    packet_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum StageCommand {
    Advance {
        #[arg(long, value_parser = clap::value_parser!(u8).range(2..=4))]
        phase: u8,
        #[command(flatten)]
        packet: PacketSource,
    },
    Show {
        #[arg(long, value_parser = clap::value_parser!(u8).range(2..=4))]
        phase: u8,
        #[arg(long)]
        id: String,
    },
}

/// Installs the stderr subscriber used by the `pl` binary. A subscriber that is already
/// installed is left in place.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Opens (and migrates) the database named by `--db` and executes the command.
///
/// # Errors
/// Returns an error when the store cannot be opened or the command fails. Command
/// failures carry a [`PipelineError`] that [`error_envelope`] classifies.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = SqliteLedgerStore::open(&cli.db)?;
    store.migrate()?;
    debug!(db = %cli.db.display(), "ledger database ready");
    let output = execute(cli.command, &store)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Executes one command against an open store and returns its JSON result.
///
/// # Errors
/// Returns the [`PipelineError`] of the failed operation.
pub fn execute(command: Command, store: &SqliteLedgerStore) -> PipelineResult<Value> {
    match command {
        Command::Run { command } => run_command(command, store),
        Command::Events { command } => events_command(command, store),
        Command::Handoff { command } => handoff_command(command, store),
        Command::Stage { command } => stage_command(command, store),
    }
}

fn run_command(command: RunCommand, store: &SqliteLedgerStore) -> PipelineResult<Value> {
    let registry = default_registry();
    let ledger = Ledger::new(store, &registry);
    match command {
        RunCommand::Create { mode, config_json } => {
            let config = parse_json("config_json", &config_json)?;
            let run_id = ledger.create_run(&mode, &config)?;
            Ok(json!({ "run_id": run_id }))
        }
        RunCommand::Show { run_id } => to_json(&ledger.get_run(parse_id(&run_id)?)?),
        RunCommand::Finalize {
            run_id,
            status,
            error,
        } => to_json(&ledger.finalize_run(
            parse_id(&run_id)?,
            status.into(),
            error.as_deref(),
        )?),
    }
}

fn events_command(command: EventsCommand, store: &SqliteLedgerStore) -> PipelineResult<Value> {
    let registry = default_registry();
    let ledger = Ledger::new(store, &registry);
    match command {
        EventsCommand::Append(args) => {
            let occurred_at = args
                .occurred_at
                .as_deref()
                .map(parse_rfc3339)
                .transpose()?;
            let payload = args
                .payload_json
                .as_deref()
                .map(|raw| parse_json("payload_json", raw))
                .transpose()?;
            to_json(&ledger.append_event(
                parse_id(&args.run_id)?,
                &args.event_type,
                args.source.as_deref(),
                occurred_at,
                payload,
            )?)
        }
        EventsCommand::List {
            run_id,
            limit,
            cursor,
        } => {
            let page = EventPageRequest {
                limit,
                cursor: cursor.as_deref().map(parse_rfc3339).transpose()?,
            };
            to_json(&ledger.list_events(parse_id(&run_id)?, page)?)
        }
        EventsCommand::Project { run_id } => to_json(&ledger.project_run(parse_id(&run_id)?)?),
    }
}

fn handoff_command(command: HandoffCommand, store: &SqliteLedgerStore) -> PipelineResult<Value> {
    let service = HandoffService::new(store, store);
    match command {
        HandoffCommand::Create(args) => {
            let packet = match args.packet.read()? {
                Some(value) => Packet::from_value(value)?,
                None => Packet::default(),
            };
            let request = HandoffRequest {
                run_id: args.run_id,
                case_id: args.case_id,
                handoff_type: args.handoff_type,
                from_phase: args.from_phase,
                to_phase: args.to_phase,
                packet,
            };
            to_json(&service.create(&request)?)
        }
        HandoffCommand::Show { id } => to_json(&service.get(parse_id::<HandoffId>(&id)?)?),
        HandoffCommand::List { run_id } => to_json(&service.list_for_run(parse_id(&run_id)?)?),
        HandoffCommand::AttachCase { id, case_id } => {
            to_json(&service.attach_case(parse_id(&id)?, &case_id)?)
        }
    }
}

fn stage_command(command: StageCommand, store: &SqliteLedgerStore) -> PipelineResult<Value> {
    let pipeline = StagePipeline::new(store);
    match command {
        StageCommand::Advance { phase, packet } => {
            let phase = PipelinePhase::try_from(phase)?;
            let packet = packet.read()?.map(Packet::from_value).transpose()?;
            to_json(&pipeline.advance(phase, packet)?)
        }
        StageCommand::Show { phase, id } => {
            let phase = PipelinePhase::try_from(phase)?;
            to_json(&pipeline.get(phase, parse_id::<StageRunId>(&id)?)?)
        }
    }
}

impl PacketSource {
    fn read(&self) -> PipelineResult<Option<Value>> {
        if let Some(raw) = &self.packet_json {
            return parse_json("packet_json", raw).map(Some);
        }
        match &self.packet_file {
            Some(path) => Ok(Some(read_json_file(path)?)),
            None => Ok(None),
        }
    }
}

fn read_json_file(path: &Path) -> PipelineResult<Value> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read packet file {}", path.display()))?;
    parse_json(&path.display().to_string(), &body)
}

fn parse_json(label: &str, raw: &str) -> PipelineResult<Value> {
    serde_json::from_str(raw)
        .map_err(|err| PipelineError::Validation(format!("{label} must be valid JSON: {err}")))
}

fn parse_id<T>(raw: &str) -> PipelineResult<T>
where
    T: std::str::FromStr<Err = LedgerError>,
{
    Ok(raw.parse::<T>()?)
}

fn to_json<T: serde::Serialize>(value: &T) -> PipelineResult<Value> {
    serde_json::to_value(value)
        .context("failed to encode command output")
        .map_err(PipelineError::Storage)
}

/// Maps a failure onto the `{"error": {"kind", "message"}}` envelope printed by `pl`.
#[must_use]
pub fn error_envelope(err: &anyhow::Error) -> Value {
    let kind = if let Some(pipeline) = err.downcast_ref::<PipelineError>() {
        pipeline.kind()
    } else if err.downcast_ref::<LedgerError>().is_some() {
        "validation"
    } else {
        "storage"
    };
    json!({ "error": { "kind": kind, "message": format!("{err:#}") } })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn memory_store() -> SqliteLedgerStore {
        let store = must(SqliteLedgerStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn parse(args: &[&str]) -> Cli {
        must(Cli::try_parse_from(std::iter::once("pl").chain(args.iter().copied())))
    }

    fn exec(store: &SqliteLedgerStore, args: &[&str]) -> PipelineResult<Value> {
        execute(parse(args).command, store)
    }

    #[test]
    fn defaults_match_documented_values() {
        let cli = parse(&["run", "create"]);
        assert_eq!(cli.db, PathBuf::from("./phase_ledger.sqlite3"));
        assert!(!cli.log_json);
    }

    #[test]
    fn stage_phase_is_range_checked_by_the_parser() {
        let parsed = Cli::try_parse_from(["pl", "stage", "advance", "--phase", "5"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn packet_sources_are_mutually_exclusive() {
        let parsed = Cli::try_parse_from([
            "pl",
            "stage",
            "advance",
            "--phase",
            "2",
            "--packet-json",
            "{}",
            "--packet-file",
            "packet.json",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn run_events_and_projection_flow() {
        let store = memory_store();
        let created = must(exec(&store, &["run", "create"]));
        let run_id = created["run_id"].as_str().unwrap_or_default().to_string();

        let receipt = must(exec(
            &store,
            &["events", "append", "--run-id", &run_id, "--type", " note.added "],
        ));
        assert_eq!(receipt["seq"], json!(1));

        let projection = must(exec(&store, &["events", "project", "--run-id", &run_id]));
        assert_eq!(projection["total_events"], json!(1));
        assert_eq!(projection["counts_by_source"]["manual"], json!(1));
    }

    #[test]
    fn invalid_input_is_a_validation_error() {
        let store = memory_store();
        let created = must(exec(&store, &["run", "create"]));
        let run_id = created["run_id"].as_str().unwrap_or_default().to_string();

        let bad_payload = exec(
            &store,
            &[
                "events", "append", "--run-id", &run_id, "--type", "note.added", "--payload-json",
                "{oops",
            ],
        );
        assert!(matches!(bad_payload, Err(PipelineError::Validation(_))));

        let bad_id = exec(&store, &["run", "show", "--run-id", "not-a-ulid"]);
        assert!(matches!(bad_id, Err(PipelineError::Validation(_))));
    }

    #[test]
    fn envelope_classifies_errors() {
        let missing = anyhow::Error::new(PipelineError::NotFound("run x".to_string()));
        assert_eq!(
            error_envelope(&missing),
            json!({"error": {"kind": "not_found", "message": "run x not found"}})
        );

        let ledger = anyhow::Error::new(LedgerError::Validation("bad".to_string()));
        assert_eq!(error_envelope(&ledger)["error"]["kind"], json!("validation"));

        let other = anyhow::anyhow!("disk gone");
        assert_eq!(error_envelope(&other)["error"]["kind"], json!("storage"));
    }
}
