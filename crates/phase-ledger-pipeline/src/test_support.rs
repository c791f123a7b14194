#![allow(clippy::missing_panics_doc)]

use std::cell::{Cell, RefCell};
use std::fmt::Display;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use phase_ledger_core::{
    now_utc, Document, DocumentFetcher, FetchConfig, Packet, PipelinePhase, RunId, StageRunId,
    StageRunRecord, StageRunStore,
};
use phase_ledger_store_sqlite::SqliteLedgerStore;

pub fn must<T, E: Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

pub fn must_some<T>(value: Option<T>) -> T {
    match value {
        Some(value) => value,
        None => panic!("expected Some(..), got None"),
    }
}

pub fn fixture_store() -> SqliteLedgerStore {
    let store = must(SqliteLedgerStore::open(Path::new(":memory:")));
    must(store.migrate());
    store
}

pub fn temp_db_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("phase-ledger-{label}-{}.sqlite3", RunId::new()))
}

pub fn remove_db(path: &Path) {
    let _ = std::fs::remove_file(path);
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(sidecar);
    }
}

/// Fetcher whose every fetch fails.
pub struct FailingFetcher;

impl DocumentFetcher for FailingFetcher {
    fn source(&self) -> &str {
        "failing"
    }

    fn fetch(&self, _config: &FetchConfig) -> anyhow::Result<Vec<Document>> {
        Err(anyhow!("upstream unavailable"))
    }
}

/// In-memory stage store that can be told to fail every packet update.
#[derive(Default)]
pub struct FakeStageStore {
    records: RefCell<Vec<StageRunRecord>>,
    fail_updates: Cell<bool>,
}

impl FakeStageStore {
    pub fn failing_updates() -> Self {
        let store = Self::default();
        store.fail_updates.set(true);
        store
    }

    pub fn created(&self) -> usize {
        self.records.borrow().len()
    }
}

impl StageRunStore for FakeStageStore {
    fn create_stage_run(
        &self,
        phase: PipelinePhase,
        packet: &Packet,
    ) -> anyhow::Result<StageRunId> {
        let id = StageRunId::new();
        let now = now_utc();
        self.records.borrow_mut().push(StageRunRecord {
            id,
            phase,
            packet: packet.clone(),
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    fn update_stage_run_packet(
        &self,
        phase: PipelinePhase,
        id: StageRunId,
        packet: &Packet,
    ) -> anyhow::Result<()> {
        if self.fail_updates.get() {
            return Err(anyhow!("disk full"));
        }
        let mut records = self.records.borrow_mut();
        let record = records
            .iter_mut()
            .find(|record| record.phase == phase && record.id == id)
            .ok_or_else(|| anyhow!("{phase} run {id} not found"))?;
        record.packet = packet.clone();
        record.updated_at = now_utc();
        Ok(())
    }

    fn get_stage_run(
        &self,
        phase: PipelinePhase,
        id: StageRunId,
    ) -> anyhow::Result<Option<StageRunRecord>> {
        Ok(self
            .records
            .borrow()
            .iter()
            .find(|record| record.phase == phase && record.id == id)
            .cloned())
    }
}
