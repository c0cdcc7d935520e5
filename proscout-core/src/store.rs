//! Durable storage for run rows and their research artifacts.
//!
//! Row updates are whole-row writes, except for the control flags: `update`
//! always keeps the stored `pause_requested` / `cancel_requested`, which only
//! change through the dedicated setters. Every read-modify-write runs under the
//! store's lock; for [`FileRunStore`] that lock is an advisory file lock shared
//! by every process pointed at the same state directory.
//!
//! Evidence is written in numbered batches, one per completed phase. Writing a
//! batch again replaces it, so a phase replayed from its checkpoint never
//! duplicates evidence.

use crate::error::StoreError;
use crate::persistence::{FileLock, atomic_write_json, load_json, load_json_dir};
use crate::run::types::{Conclusions, Evidence, ResearchResult, ResearchRun};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Evidence batches of one run, keyed by batch number.
type EvidenceBatches = BTreeMap<u32, Vec<Evidence>>;

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create(&self, run: &ResearchRun) -> Result<(), StoreError>;

    async fn get(&self, run_id: Uuid) -> Result<Option<ResearchRun>, StoreError>;

    /// Write every column except the control flags.
    async fn update(&self, run: &ResearchRun) -> Result<(), StoreError>;

    /// `update`, applied only while the stored row's `updated_at` still equals
    /// `expected`. Returns whether the row was written.
    async fn update_if(
        &self,
        run: &ResearchRun,
        expected: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn set_pause_requested(&self, run_id: Uuid, value: bool) -> Result<(), StoreError>;

    async fn set_cancel_requested(&self, run_id: Uuid, value: bool) -> Result<(), StoreError>;

    /// All rows, oldest first.
    async fn list(&self) -> Result<Vec<ResearchRun>, StoreError>;

    /// Store `evidence` as batch number `batch`, replacing that batch and any
    /// later one.
    async fn put_evidence_batch(
        &self,
        run_id: Uuid,
        batch: u32,
        evidence: &[Evidence],
    ) -> Result<(), StoreError>;

    /// Every stored evidence record, in batch order.
    async fn load_evidence(&self, run_id: Uuid) -> Result<Vec<Evidence>, StoreError>;

    async fn save_conclusions(&self, conclusions: &Conclusions) -> Result<(), StoreError>;

    async fn load_conclusions(&self, run_id: Uuid) -> Result<Option<Conclusions>, StoreError>;

    async fn save_result(&self, result: &ResearchResult) -> Result<(), StoreError>;

    async fn load_result(&self, run_id: Uuid) -> Result<Option<ResearchResult>, StoreError>;

    async fn get_required(&self, run_id: Uuid) -> Result<ResearchRun, StoreError> {
        self.get(run_id)
            .await?
            .ok_or(StoreError::Missing { run_id })
    }
}

fn merge_update(stored: &ResearchRun, incoming: &ResearchRun) -> ResearchRun {
    let mut row = incoming.clone();
    row.pause_requested = stored.pause_requested;
    row.cancel_requested = stored.cancel_requested;
    row
}

fn replace_batch(batches: &mut EvidenceBatches, batch: u32, evidence: &[Evidence]) {
    batches.retain(|&n, _| n < batch);
    batches.insert(batch, evidence.to_vec());
}

fn flatten(batches: EvidenceBatches) -> Vec<Evidence> {
    batches.into_values().flatten().collect()
}

fn sort_rows(rows: &mut [ResearchRun]) {
    rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryTables {
    runs: HashMap<Uuid, ResearchRun>,
    evidence: HashMap<Uuid, EvidenceBatches>,
    conclusions: HashMap<Uuid, Conclusions>,
    results: HashMap<Uuid, ResearchResult>,
}

/// Process-local store, used by tests and embedding callers.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    tables: Mutex<MemoryTables>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, run: &ResearchRun) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.runs.contains_key(&run.id) {
            return Err(StoreError::Duplicate { run_id: run.id });
        }
        tables.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<ResearchRun>, StoreError> {
        Ok(self.tables.lock().await.runs.get(&run_id).cloned())
    }

    async fn update(&self, run: &ResearchRun) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .runs
            .get(&run.id)
            .ok_or(StoreError::Missing { run_id: run.id })?;
        let merged = merge_update(stored, run);
        tables.runs.insert(run.id, merged);
        Ok(())
    }

    async fn update_if(
        &self,
        run: &ResearchRun,
        expected: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .runs
            .get(&run.id)
            .ok_or(StoreError::Missing { run_id: run.id })?;
        if stored.updated_at != expected {
            return Ok(false);
        }
        let merged = merge_update(stored, run);
        tables.runs.insert(run.id, merged);
        Ok(true)
    }

    async fn set_pause_requested(&self, run_id: Uuid, value: bool) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::Missing { run_id })?;
        row.pause_requested = value;
        Ok(())
    }

    async fn set_cancel_requested(&self, run_id: Uuid, value: bool) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::Missing { run_id })?;
        row.cancel_requested = value;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ResearchRun>, StoreError> {
        let mut rows: Vec<ResearchRun> = self.tables.lock().await.runs.values().cloned().collect();
        sort_rows(&mut rows);
        Ok(rows)
    }

    async fn put_evidence_batch(
        &self,
        run_id: Uuid,
        batch: u32,
        evidence: &[Evidence],
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        replace_batch(tables.evidence.entry(run_id).or_default(), batch, evidence);
        Ok(())
    }

    async fn load_evidence(&self, run_id: Uuid) -> Result<Vec<Evidence>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .evidence
            .get(&run_id)
            .cloned()
            .map(flatten)
            .unwrap_or_default())
    }

    async fn save_conclusions(&self, conclusions: &Conclusions) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .conclusions
            .insert(conclusions.run_id, conclusions.clone());
        Ok(())
    }

    async fn load_conclusions(&self, run_id: Uuid) -> Result<Option<Conclusions>, StoreError> {
        Ok(self.tables.lock().await.conclusions.get(&run_id).cloned())
    }

    async fn save_result(&self, result: &ResearchResult) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .results
            .insert(result.run_id, result.clone());
        Ok(())
    }

    async fn load_result(&self, run_id: Uuid) -> Result<Option<ResearchResult>, StoreError> {
        Ok(self.tables.lock().await.results.get(&run_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// JSON-file store rooted at a state directory:
///
/// ```text
/// <root>/.lock
/// <root>/runs/<run_id>.json
/// <root>/evidence/<run_id>.json
/// <root>/conclusions/<run_id>.json
/// <root>/results/<run_id>.json
/// ```
#[derive(Debug)]
pub struct FileRunStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

fn persistence_err(e: std::io::Error) -> StoreError {
    StoreError::Persistence {
        message: e.to_string(),
    }
}

impl FileRunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Serialize with this process's tasks, then with other processes.
    async fn exclusive(&self) -> Result<(FileLock, MutexGuard<'_, ()>), StoreError> {
        let guard = self.write_lock.lock().await;
        let lock = FileLock::acquire(&self.root.join(".lock")).map_err(persistence_err)?;
        Ok((lock, guard))
    }

    fn path(&self, table: &str, run_id: Uuid) -> PathBuf {
        self.root.join(table).join(format!("{run_id}.json"))
    }

    fn read_run(&self, run_id: Uuid) -> Result<Option<ResearchRun>, StoreError> {
        load_json(&self.path("runs", run_id)).map_err(persistence_err)
    }

    fn write_run(&self, run: &ResearchRun) -> Result<(), StoreError> {
        atomic_write_json(&self.path("runs", run.id), run).map_err(persistence_err)
    }

    async fn modify_flags(
        &self,
        run_id: Uuid,
        apply: impl FnOnce(&mut ResearchRun) + Send,
    ) -> Result<(), StoreError> {
        let _lock = self.exclusive().await?;
        let mut row = self.read_run(run_id)?.ok_or(StoreError::Missing { run_id })?;
        apply(&mut row);
        self.write_run(&row)
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn create(&self, run: &ResearchRun) -> Result<(), StoreError> {
        let _lock = self.exclusive().await?;
        if self.read_run(run.id)?.is_some() {
            return Err(StoreError::Duplicate { run_id: run.id });
        }
        self.write_run(run)
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<ResearchRun>, StoreError> {
        self.read_run(run_id)
    }

    async fn update(&self, run: &ResearchRun) -> Result<(), StoreError> {
        let _lock = self.exclusive().await?;
        let stored = self
            .read_run(run.id)?
            .ok_or(StoreError::Missing { run_id: run.id })?;
        self.write_run(&merge_update(&stored, run))
    }

    async fn update_if(
        &self,
        run: &ResearchRun,
        expected: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let _lock = self.exclusive().await?;
        let stored = self
            .read_run(run.id)?
            .ok_or(StoreError::Missing { run_id: run.id })?;
        if stored.updated_at != expected {
            return Ok(false);
        }
        self.write_run(&merge_update(&stored, run))?;
        Ok(true)
    }

    async fn set_pause_requested(&self, run_id: Uuid, value: bool) -> Result<(), StoreError> {
        self.modify_flags(run_id, move |row| row.pause_requested = value)
            .await
    }

    async fn set_cancel_requested(&self, run_id: Uuid, value: bool) -> Result<(), StoreError> {
        self.modify_flags(run_id, move |row| row.cancel_requested = value)
            .await
    }

    async fn list(&self) -> Result<Vec<ResearchRun>, StoreError> {
        let mut rows: Vec<ResearchRun> =
            load_json_dir(&self.root.join("runs")).map_err(persistence_err)?;
        sort_rows(&mut rows);
        Ok(rows)
    }

    async fn put_evidence_batch(
        &self,
        run_id: Uuid,
        batch: u32,
        evidence: &[Evidence],
    ) -> Result<(), StoreError> {
        let _lock = self.exclusive().await?;
        let path = self.path("evidence", run_id);
        let mut batches: EvidenceBatches =
            load_json(&path).map_err(persistence_err)?.unwrap_or_default();
        replace_batch(&mut batches, batch, evidence);
        atomic_write_json(&path, &batches).map_err(persistence_err)
    }

    async fn load_evidence(&self, run_id: Uuid) -> Result<Vec<Evidence>, StoreError> {
        let batches: Option<EvidenceBatches> =
            load_json(&self.path("evidence", run_id)).map_err(persistence_err)?;
        Ok(batches.map(flatten).unwrap_or_default())
    }

    async fn save_conclusions(&self, conclusions: &Conclusions) -> Result<(), StoreError> {
        atomic_write_json(&self.path("conclusions", conclusions.run_id), conclusions)
            .map_err(persistence_err)
    }

    async fn load_conclusions(&self, run_id: Uuid) -> Result<Option<Conclusions>, StoreError> {
        load_json(&self.path("conclusions", run_id)).map_err(persistence_err)
    }

    async fn save_result(&self, result: &ResearchResult) -> Result<(), StoreError> {
        atomic_write_json(&self.path("results", result.run_id), result).map_err(persistence_err)
    }

    async fn load_result(&self, run_id: Uuid) -> Result<Option<ResearchResult>, StoreError> {
        load_json(&self.path("results", run_id)).map_err(persistence_err)
    }
}
