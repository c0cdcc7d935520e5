//! Job queue with stable-key deduplication.
//!
//! Each run has at most one queue entry, keyed by [`job_key`]. Enqueueing a key
//! that is already waiting is a no-op; enqueueing a key whose job is being
//! processed marks it for one more delivery once the current one completes.
//!
//! [`FileJobQueue`] takes an advisory file lock around every load-modify-save,
//! so workers in separate processes never dequeue the same entry.

use crate::error::QueueError;
use crate::persistence::{FileLock, atomic_write_json, load_json};
use crate::run::types::{Job, job_key};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub key: String,
    pub job: Job,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub deliveries: u32,
    /// Re-deliver after the active delivery completes.
    #[serde(default)]
    pub redeliver: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// An entry with the same key already exists.
    Deduplicated,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, QueueError>;

    /// Take the oldest waiting job and mark it active.
    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError>;

    /// Acknowledge a delivered job.
    async fn complete(&self, key: &str) -> Result<(), QueueError>;

    /// Drop an entry regardless of state. Returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool, QueueError>;

    async fn get(&self, key: &str) -> Result<Option<QueuedJob>, QueueError>;

    /// Waiting and active entries, oldest first.
    async fn list(&self) -> Result<Vec<QueuedJob>, QueueError>;

    async fn contains_run(&self, run_id: Uuid) -> Result<bool, QueueError> {
        Ok(self.get(&job_key(run_id)).await?.is_some())
    }
}

/// Queue contents and the operations on them, shared by both backends.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct QueueTable {
    entries: Vec<QueuedJob>,
}

impl QueueTable {
    fn enqueue(&mut self, job: Job) -> EnqueueOutcome {
        let key = job.key();
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            if entry.state == JobState::Active {
                entry.redeliver = true;
                entry.job = job;
            }
            tracing::debug!(key = %key, "Job deduplicated");
            return EnqueueOutcome::Deduplicated;
        }
        self.entries.push(QueuedJob {
            key,
            job,
            state: JobState::Waiting,
            enqueued_at: Utc::now(),
            deliveries: 0,
            redeliver: false,
        });
        EnqueueOutcome::Enqueued
    }

    fn dequeue(&mut self) -> Option<QueuedJob> {
        let entry = self
            .entries
            .iter_mut()
            .filter(|e| e.state == JobState::Waiting)
            .min_by_key(|e| e.enqueued_at)?;
        entry.state = JobState::Active;
        entry.deliveries += 1;
        Some(entry.clone())
    }

    fn complete(&mut self, key: &str) -> Result<(), QueueError> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.key == key)
            .ok_or_else(|| QueueError::NotFound { key: key.to_string() })?;
        let entry = &mut self.entries[pos];
        if entry.redeliver {
            entry.redeliver = false;
            entry.state = JobState::Waiting;
            entry.enqueued_at = Utc::now();
        } else {
            self.entries.remove(pos);
        }
        Ok(())
    }

    fn remove(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.key != key);
        self.entries.len() != before
    }

    fn get(&self, key: &str) -> Option<QueuedJob> {
        self.entries.iter().find(|e| e.key == key).cloned()
    }

    fn list(&self) -> Vec<QueuedJob> {
        let mut entries = self.entries.clone();
        entries.sort_by_key(|e| e.enqueued_at);
        entries
    }
}

/// Process-local queue.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    table: Mutex<QueueTable>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, QueueError> {
        Ok(self.table.lock().await.enqueue(job))
    }

    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        Ok(self.table.lock().await.dequeue())
    }

    async fn complete(&self, key: &str) -> Result<(), QueueError> {
        self.table.lock().await.complete(key)
    }

    async fn remove(&self, key: &str) -> Result<bool, QueueError> {
        Ok(self.table.lock().await.remove(key))
    }

    async fn get(&self, key: &str) -> Result<Option<QueuedJob>, QueueError> {
        Ok(self.table.lock().await.get(key))
    }

    async fn list(&self) -> Result<Vec<QueuedJob>, QueueError> {
        Ok(self.table.lock().await.list())
    }
}

/// Queue persisted as a single JSON file, rewritten atomically on every change.
/// JSON-file queue; `<path>` holds the entries, `<path>` with a `lock`
/// extension is the lock file.
#[derive(Debug)]
pub struct FileJobQueue {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileJobQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<QueueTable, QueueError> {
        load_json(&self.path)
            .map(Option::unwrap_or_default)
            .map_err(|e| QueueError::Persistence {
                message: e.to_string(),
            })
    }

    fn save(&self, table: &QueueTable) -> Result<(), QueueError> {
        atomic_write_json(&self.path, table).map_err(|e| QueueError::Persistence {
            message: e.to_string(),
        })
    }

    async fn with_table<R>(
        &self,
        apply: impl FnOnce(&mut QueueTable) -> R + Send,
    ) -> Result<R, QueueError> {
        let _guard = self.lock.lock().await;
        let _file = FileLock::acquire(&self.path.with_extension("lock")).map_err(|e| {
            QueueError::Persistence {
                message: e.to_string(),
            }
        })?;
        let mut table = self.load()?;
        let out = apply(&mut table);
        self.save(&table)?;
        Ok(out)
    }
}

#[async_trait]
impl JobQueue for FileJobQueue {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, QueueError> {
        self.with_table(|t| t.enqueue(job)).await
    }

    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        self.with_table(QueueTable::dequeue).await
    }

    async fn complete(&self, key: &str) -> Result<(), QueueError> {
        self.with_table(|t| t.complete(key)).await?
    }

    async fn remove(&self, key: &str) -> Result<bool, QueueError> {
        self.with_table(|t| t.remove(key)).await
    }

    async fn get(&self, key: &str) -> Result<Option<QueuedJob>, QueueError> {
        let _guard = self.lock.lock().await;
        Ok(self.load()?.get(key))
    }

    async fn list(&self) -> Result<Vec<QueuedJob>, QueueError> {
        let _guard = self.lock.lock().await;
        Ok(self.load()?.list())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::types::RunKind;
    use tempfile::TempDir;

    fn job() -> Job {
        Job {
            run_id: Uuid::new_v4(),
            subject_id: "item-1".into(),
            owner_id: "owner-1".into(),
            run_kind: RunKind::Fresh,
        }
    }

    async fn exercise(queue: &dyn JobQueue) {
        let a = job();
        let b = job();
        assert_eq!(queue.enqueue(a.clone()).await.unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(
            queue.enqueue(a.clone()).await.unwrap(),
            EnqueueOutcome::Deduplicated
        );
        queue.enqueue(b.clone()).await.unwrap();
        assert_eq!(queue.list().await.unwrap().len(), 2);

        let delivered = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(delivered.job.run_id, a.run_id);
        assert_eq!(delivered.state, JobState::Active);
        assert!(queue.contains_run(a.run_id).await.unwrap());

        queue.complete(&delivered.key).await.unwrap();
        assert!(!queue.contains_run(a.run_id).await.unwrap());

        assert!(queue.remove(&b.key()).await.unwrap());
        assert!(!queue.remove(&b.key()).await.unwrap());
        assert!(queue.dequeue().await.unwrap().is_none());
        assert!(matches!(
            queue.complete("resume-nothing").await,
            Err(QueueError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_memory_queue() {
        exercise(&InMemoryJobQueue::new()).await;
    }

    #[tokio::test]
    async fn test_file_queue() {
        let dir = TempDir::new().unwrap();
        exercise(&FileJobQueue::new(dir.path().join("queue.json"))).await;
    }

    #[tokio::test]
    async fn test_enqueue_while_active_redelivers_once() {
        let queue = InMemoryJobQueue::new();
        let mut j = job();
        queue.enqueue(j.clone()).await.unwrap();
        let delivered = queue.dequeue().await.unwrap().unwrap();

        j.run_kind = RunKind::Resume;
        assert_eq!(queue.enqueue(j.clone()).await.unwrap(), EnqueueOutcome::Deduplicated);
        assert!(queue.dequeue().await.unwrap().is_none());

        queue.complete(&delivered.key).await.unwrap();
        let again = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(again.job.run_kind, RunKind::Resume);
        assert_eq!(again.deliveries, 2);
        queue.complete(&again.key).await.unwrap();
        assert!(queue.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_queues_sharing_a_path_deliver_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        let first = std::sync::Arc::new(FileJobQueue::new(&path));
        let second = std::sync::Arc::new(FileJobQueue::new(&path));
        for _ in 0..8 {
            first.enqueue(job()).await.unwrap();
        }

        let drain = |queue: std::sync::Arc<FileJobQueue>| {
            tokio::task::spawn_blocking(move || {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                rt.block_on(async move {
                    let mut keys = Vec::new();
                    while let Some(entry) = queue.dequeue().await.unwrap() {
                        keys.push(entry.key);
                    }
                    keys
                })
            })
        };
        let (a, b) = tokio::join!(drain(first), drain(second));
        let mut keys = a.unwrap();
        keys.extend(b.unwrap());
        let unique: std::collections::HashSet<_> = keys.iter().cloned().collect();
        assert_eq!(keys.len(), 8);
        assert_eq!(unique.len(), 8);
    }

    #[tokio::test]
    async fn test_file_queue_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        let j = job();
        FileJobQueue::new(&path).enqueue(j.clone()).await.unwrap();
        let reopened = FileJobQueue::new(&path);
        assert!(reopened.contains_run(j.run_id).await.unwrap());
    }
}
