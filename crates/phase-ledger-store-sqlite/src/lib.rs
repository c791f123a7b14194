#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use phase_ledger_core::{
    format_rfc3339, now_utc, parse_rfc3339, EventPage, EventPageRequest, EventSource, HandoffId,
    HandoffRecord, HandoffStore, HandoffType, KeyedLocks, LedgerError, LedgerEvent,
    LedgerEventInput, LedgerEventType, LedgerStore, NamedLock, NamedLockGuard, NewHandoff,
    Packet, PipelinePhase, RunId, RunRecord, RunStatus, StageRunId, StageRunRecord,
    StageRunStore,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

const LEDGER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  mode TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('running', 'success', 'failed')),
  config_json TEXT NOT NULL DEFAULT '{}',
  started_at TEXT NOT NULL,
  finished_at TEXT,
  error TEXT
);

CREATE TABLE IF NOT EXISTS ledger_events (
  run_id TEXT NOT NULL,
  seq INTEGER NOT NULL CHECK (seq >= 1),
  event_type TEXT NOT NULL CHECK (
    event_type IN (
      'run.finalized',
      'doc.fetched',
      'note.added',
      'signal.detected',
      'universe.member_added'
    )
  ),
  source TEXT NOT NULL CHECK (source IN ('manual', 'system', 'sec', 'edinet', 'other')),
  occurred_at TEXT NOT NULL,
  payload_json TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL,
  created_at_ns INTEGER NOT NULL,
  PRIMARY KEY (run_id, seq),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TRIGGER IF NOT EXISTS trg_ledger_events_no_update
BEFORE UPDATE ON ledger_events
BEGIN
  SELECT RAISE(FAIL, 'ledger_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_ledger_events_no_delete
BEFORE DELETE ON ledger_events
BEGIN
  SELECT RAISE(FAIL, 'ledger_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_ledger_events_run_created
  ON ledger_events(run_id, created_at_ns DESC);

CREATE TABLE IF NOT EXISTS handoff_packets (
  handoff_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  case_id TEXT,
  handoff_type TEXT NOT NULL CHECK (handoff_type IN ('light', 'heavy')),
  from_phase INTEGER NOT NULL CHECK (from_phase = 1),
  to_phase INTEGER NOT NULL CHECK (to_phase IN (3, 5)),
  packet_json TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'created',
  created_at TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE INDEX IF NOT EXISTS idx_handoff_packets_run
  ON handoff_packets(run_id);

CREATE TABLE IF NOT EXISTS stage_runs (
  stage_run_id TEXT PRIMARY KEY,
  phase INTEGER NOT NULL CHECK (phase IN (2, 3, 4)),
  packet_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

const EVENT_COLUMNS: &str =
    "run_id, seq, event_type, source, occurred_at, payload_json, created_at";

const HANDOFF_COLUMNS: &str = "handoff_id, run_id, case_id, handoff_type, from_phase, to_phase,
     packet_json, status, created_at";

/// Lock name serializing sequence assignment for one run.
#[must_use]
pub fn run_lock_key(run_id: RunId) -> String {
    format!("ledger:run:{run_id}")
}

pub struct SqliteLedgerStore {
    conn: Connection,
    lock: Arc<dyn NamedLock>,
}

impl SqliteLedgerStore {
    /// Opens a store with its own in-process run lock. Stores opened on the same file
    /// still serialize appends through the `SQLite` write transaction.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_lock(path, Arc::new(KeyedLocks::new()))
    }

    /// Opens a store that takes per-run locks from `lock`, typically shared by every
    /// store handle in the process.
    pub fn open_with_lock(path: &Path, lock: Arc<dyn NamedLock>) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, lock })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LEDGER_V1)
            .context("failed to apply ledger schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, timestamp(now_utc())?],
            )
            .context("failed to register ledger schema migration")?;

        Ok(())
    }

    /// Opens and migrates in one step.
    pub fn open_migrated(path: &Path, lock: Arc<dyn NamedLock>) -> Result<Self> {
        let store = Self::open_with_lock(path, lock)?;
        store.migrate()?;
        Ok(store)
    }

    fn acquire_run_lock(&self, run_id: RunId) -> Result<NamedLockGuard<'_>> {
        let lock_name = run_lock_key(run_id);
        self.lock
            .acquire(&lock_name)
            .with_context(|| format!("failed to acquire {lock_name}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn create_run(&self, mode: &str, config: &Value) -> Result<RunId> {
        let run_id = RunId::new();
        let config_json = serde_json::to_string(config).context("failed to serialize run config")?;

        self.conn
            .execute(
                "INSERT INTO runs(run_id, mode, status, config_json, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id.to_string(),
                    mode,
                    RunStatus::Running.as_str(),
                    config_json,
                    timestamp(now_utc())?,
                ],
            )
            .context("failed to insert run")?;

        Ok(run_id)
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
        self.conn
            .query_row(
                "SELECT run_id, mode, status, config_json, started_at, finished_at, error
                 FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
                parse_run_row,
            )
            .optional()
            .context("failed to load run")
    }

    fn finalize_run(
        &self,
        finalized: &LedgerEventInput,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<Option<i64>> {
        if !status.is_terminal() {
            return Err(anyhow!("cannot finish a run with status {}", status.as_str()));
        }
        if finalized.event_type != LedgerEventType::RunFinalized {
            return Err(anyhow!(
                "cannot finalize a run with a {} event",
                finalized.event_type.as_str()
            ));
        }

        let _guard = self.acquire_run_lock(finalized.run_id)?;
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("failed to start finalize transaction")?;

        let changed = tx
            .execute(
                "UPDATE runs SET status = ?2, finished_at = ?3, error = ?4
                 WHERE run_id = ?1 AND status = 'running'",
                params![
                    finalized.run_id.to_string(),
                    status.as_str(),
                    timestamp(now_utc())?,
                    error
                ],
            )
            .context("failed to finish run")?;
        if changed == 0 {
            return Ok(None);
        }

        let seq = insert_event(&tx, finalized)?;
        tx.commit().context("failed to commit finalize transaction")?;

        debug!(
            run_id = %finalized.run_id,
            seq,
            status = status.as_str(),
            "run finalized"
        );
        Ok(Some(seq))
    }

    fn append_event(&self, input: &LedgerEventInput) -> Result<i64> {
        let _guard = self.acquire_run_lock(input.run_id)?;

        // Rolls back on drop, so an error anywhere below reserves nothing.
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("failed to start append transaction")?;
        let seq = insert_event(&tx, input)?;
        tx.commit().context("failed to commit append transaction")?;

        debug!(
            run_id = %input.run_id,
            seq,
            event_type = input.event_type.as_str(),
            "ledger event committed"
        );
        Ok(seq)
    }

    fn list_events(&self, run_id: RunId, page: EventPageRequest) -> Result<EventPage> {
        let limit = page.effective_limit();
        let cursor_ns = page
            .cursor
            .map(|cursor| i64::try_from(cursor.unix_timestamp_nanos()))
            .transpose()
            .context("cursor out of range")?
            .unwrap_or(i64::MAX);

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS}
                 FROM ledger_events
                 WHERE run_id = ?1 AND created_at_ns < ?2
                 ORDER BY created_at_ns DESC
                 LIMIT ?3"
            ))
            .context("failed to prepare event page query")?;
        let rows = stmt
            .query_map(
                params![run_id.to_string(), cursor_ns, i64::from(limit) + 1],
                parse_event_row,
            )
            .context("failed to query event page")?;
        let mut items = collect_rows(rows)?;

        let limit = usize::try_from(limit).context("page limit out of range")?;
        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|event| event.created_at)
        } else {
            None
        };

        Ok(EventPage { items, next_cursor })
    }
}

impl HandoffStore for SqliteLedgerStore {
    fn create_handoff(&self, handoff: &NewHandoff) -> Result<HandoffId> {
        let id = HandoffId::new();
        let packet_json =
            serde_json::to_string(&handoff.packet).context("failed to serialize handoff packet")?;

        self.conn
            .execute(
                "INSERT INTO handoff_packets(
                    handoff_id, run_id, case_id, handoff_type, from_phase, to_phase,
                    packet_json, status, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'created', ?8)",
                params![
                    id.to_string(),
                    handoff.run_id.to_string(),
                    handoff.case_id,
                    handoff.handoff_type.as_str(),
                    i64::from(handoff.from_phase),
                    i64::from(handoff.to_phase),
                    packet_json,
                    timestamp(now_utc())?,
                ],
            )
            .context("failed to insert handoff")?;

        Ok(id)
    }

    fn get_handoff(&self, id: HandoffId) -> Result<Option<HandoffRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {HANDOFF_COLUMNS} FROM handoff_packets WHERE handoff_id = ?1"),
                params![id.to_string()],
                parse_handoff_row,
            )
            .optional()
            .context("failed to load handoff")
    }

    fn list_handoffs_for_run(&self, run_id: RunId) -> Result<Vec<HandoffRecord>> {
        // Handoff rows are never deleted, so rowid follows insertion order. ULIDs minted
        // within one millisecond do not.
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {HANDOFF_COLUMNS} FROM handoff_packets
                 WHERE run_id = ?1
                 ORDER BY rowid DESC"
            ))
            .context("failed to prepare handoff list query")?;
        let rows = stmt
            .query_map(params![run_id.to_string()], parse_handoff_row)
            .context("failed to query handoffs")?;
        collect_rows(rows)
    }

    fn attach_case(&self, id: HandoffId, case_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE handoff_packets SET case_id = ?2 WHERE handoff_id = ?1",
                params![id.to_string(), case_id],
            )
            .context("failed to attach case to handoff")?;
        Ok(changed == 1)
    }
}

impl StageRunStore for SqliteLedgerStore {
    fn create_stage_run(&self, phase: PipelinePhase, packet: &Packet) -> Result<StageRunId> {
        let id = StageRunId::new();
        let now = timestamp(now_utc())?;
        self.conn
            .execute(
                "INSERT INTO stage_runs(stage_run_id, phase, packet_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![
                    id.to_string(),
                    i64::from(phase.number()),
                    serde_json::to_string(packet).context("failed to serialize stage packet")?,
                    now,
                ],
            )
            .with_context(|| format!("failed to insert {phase} stage run"))?;
        Ok(id)
    }

    fn update_stage_run_packet(
        &self,
        phase: PipelinePhase,
        id: StageRunId,
        packet: &Packet,
    ) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE stage_runs SET packet_json = ?3, updated_at = ?4
                 WHERE stage_run_id = ?1 AND phase = ?2",
                params![
                    id.to_string(),
                    i64::from(phase.number()),
                    serde_json::to_string(packet).context("failed to serialize stage packet")?,
                    timestamp(now_utc())?,
                ],
            )
            .with_context(|| format!("failed to update {phase} stage run packet"))?;

        if changed == 0 {
            return Err(anyhow!("{phase} stage run {id} does not exist"));
        }
        Ok(())
    }

    fn get_stage_run(
        &self,
        phase: PipelinePhase,
        id: StageRunId,
    ) -> Result<Option<StageRunRecord>> {
        self.conn
            .query_row(
                "SELECT stage_run_id, phase, packet_json, created_at, updated_at
                 FROM stage_runs WHERE stage_run_id = ?1 AND phase = ?2",
                params![id.to_string(), i64::from(phase.number())],
                parse_stage_run_row,
            )
            .optional()
            .context("failed to load stage run")
    }
}

/// Inserts `input` as the run's next event inside `tx`, which must hold the write lock.
fn insert_event(tx: &Transaction<'_>, input: &LedgerEventInput) -> Result<i64> {
    let run_key = input.run_id.to_string();
    let (seq, last_created_ns): (i64, Option<i64>) = tx
        .query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1, MAX(created_at_ns)
             FROM ledger_events WHERE run_id = ?1",
            params![run_key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .context("failed to compute next ledger seq")?;

    // Creation times strictly increase within a run so that they page exactly.
    let now_ns = i64::try_from(now_utc().unix_timestamp_nanos())
        .context("current time does not fit nanosecond storage")?;
    let created_ns = last_created_ns.map_or(now_ns, |last| now_ns.max(last + 1));
    let created_at = OffsetDateTime::from_unix_timestamp_nanos(i128::from(created_ns))
        .context("invalid ledger creation time")?;

    tx.execute(
        "INSERT INTO ledger_events(
            run_id, seq, event_type, source, occurred_at,
            payload_json, created_at, created_at_ns
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            run_key,
            seq,
            input.event_type.as_str(),
            input.source.as_str(),
            timestamp(input.occurred_at)?,
            serde_json::to_string(&input.payload).context("failed to serialize payload")?,
            timestamp(created_at)?,
            created_ns,
        ],
    )
    .context("failed to append ledger event")?;

    Ok(seq)
}

fn timestamp(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn invalid_column(index: usize, column_type: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        column_type,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn to_sql_error(index: usize, err: &LedgerError) -> rusqlite::Error {
    invalid_column(index, Type::Text, err.to_string())
}

fn parse_ulid(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Ulid> {
    let raw: String = row.get(index)?;
    Ulid::from_string(&raw)
        .map_err(|_| invalid_column(index, Type::Text, format!("invalid ULID: {raw}")))
}

fn parse_time(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339(&raw).map_err(|err| to_sql_error(index, &err))
}

fn parse_json(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw)
        .map_err(|err| invalid_column(index, Type::Text, format!("invalid stored JSON: {err}")))
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let status_raw: String = row.get(2)?;
    let status = RunStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(2, Type::Text, format!("invalid run status: {status_raw}")))?;
    let finished_at = row
        .get::<_, Option<String>>(5)?
        .map(|raw| parse_rfc3339(&raw).map_err(|err| to_sql_error(5, &err)))
        .transpose()?;

    Ok(RunRecord {
        run_id: RunId(parse_ulid(row, 0)?),
        mode: row.get(1)?,
        status,
        config: parse_json(row, 3)?,
        started_at: parse_time(row, 4)?,
        finished_at,
        error: row.get(6)?,
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEvent> {
    let event_type_raw: String = row.get(2)?;
    let event_type = LedgerEventType::parse(&event_type_raw).ok_or_else(|| {
        invalid_column(2, Type::Text, format!("invalid event_type: {event_type_raw}"))
    })?;
    let source_raw: String = row.get(3)?;

    let payload = match parse_json(row, 5)? {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(invalid_column(
                5,
                Type::Text,
                format!("payload_json is not an object: {other}"),
            ))
        }
    };

    Ok(LedgerEvent {
        run_id: RunId(parse_ulid(row, 0)?),
        seq: row.get(1)?,
        event_type,
        source: EventSource::normalize(&source_raw),
        occurred_at: parse_time(row, 4)?,
        payload,
        created_at: parse_time(row, 6)?,
    })
}

fn parse_handoff_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HandoffRecord> {
    let handoff_type_raw: String = row.get(3)?;
    let handoff_type = HandoffType::parse(&handoff_type_raw).ok_or_else(|| {
        invalid_column(
            3,
            Type::Text,
            format!("invalid handoff_type: {handoff_type_raw}"),
        )
    })?;
    let phase = |index: usize| -> rusqlite::Result<u8> {
        let raw: i64 = row.get(index)?;
        u8::try_from(raw)
            .map_err(|_| invalid_column(index, Type::Integer, format!("invalid phase: {raw}")))
    };
    let packet = Packet::from_value(parse_json(row, 6)?).map_err(|err| to_sql_error(6, &err))?;

    Ok(HandoffRecord {
        id: HandoffId(parse_ulid(row, 0)?),
        run_id: RunId(parse_ulid(row, 1)?),
        case_id: row.get(2)?,
        handoff_type,
        from_phase: phase(4)?,
        to_phase: phase(5)?,
        packet,
        status: row.get(7)?,
        created_at: parse_time(row, 8)?,
    })
}

fn parse_stage_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StageRunRecord> {
    let phase_raw: i64 = row.get(1)?;
    let phase = u8::try_from(phase_raw)
        .ok()
        .and_then(|number| PipelinePhase::try_from(number).ok())
        .ok_or_else(|| invalid_column(1, Type::Integer, format!("invalid phase: {phase_raw}")))?;
    let packet = Packet::from_value(parse_json(row, 2)?).map_err(|err| to_sql_error(2, &err))?;

    Ok(StageRunRecord {
        id: StageRunId(parse_ulid(row, 0)?),
        phase,
        packet,
        created_at: parse_time(row, 3)?,
        updated_at: parse_time(row, 4)?,
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
