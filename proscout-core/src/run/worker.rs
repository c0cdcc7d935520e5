//! Queue-driven workers.
//!
//! Each worker dequeues one job at a time, hands it to the orchestrator and
//! acknowledges it. The queue's stable per-run key keeps at most one job per
//! run in flight.

use super::orchestrator::{ExecutionOutcome, Orchestrator};
use super::types::Job;
use crate::error::{QueueError, ScoutError};
use crate::queue::JobQueue;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<dyn JobQueue>,
    concurrency: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(orchestrator: Arc<Orchestrator>, queue: Arc<dyn JobQueue>, concurrency: usize) -> Self {
        Self {
            orchestrator,
            queue,
            concurrency: concurrency.max(1),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Dequeue and execute one job. Returns `None` when the queue had nothing waiting.
    pub async fn process_next(&self) -> Result<Option<(Job, ExecutionOutcome)>, ScoutError> {
        let Some(entry) = self.queue.dequeue().await? else {
            return Ok(None);
        };
        debug!(
            key = %entry.key,
            run_kind = %entry.job.run_kind,
            deliveries = entry.deliveries,
            "Job dequeued"
        );

        let result = self.orchestrator.execute(&entry.job).await;

        match self.queue.complete(&entry.key).await {
            // Removed by a cancel or reconciliation while it ran.
            Ok(()) | Err(QueueError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        match result {
            Ok(outcome) => {
                debug!(run_id = %entry.job.run_id, outcome = ?outcome, "Job finished");
                Ok(Some((entry.job, outcome)))
            }
            Err(e) => {
                error!(run_id = %entry.job.run_id, error = %e, "Job execution failed");
                Err(e)
            }
        }
    }

    /// Run `concurrency` workers until the queue has nothing waiting.
    /// Returns the number of jobs processed.
    pub async fn run_until_idle(&self) -> Result<usize, ScoutError> {
        let workers = (0..self.concurrency).map(|worker| self.drain(worker));
        let mut processed = 0;
        for result in join_all(workers).await {
            processed += result?;
        }
        Ok(processed)
    }

    async fn drain(&self, worker: usize) -> Result<usize, ScoutError> {
        let mut processed = 0;
        while self.process_next().await?.is_some() {
            processed += 1;
        }
        debug!(worker, processed, "Worker idle");
        Ok(processed)
    }

    /// Spawn long-lived workers that poll the queue until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.concurrency)
            .map(|worker| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.worker_loop(worker, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.process_next().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(worker, error = %e, "Worker iteration failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        info!(worker, "Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoutConfig;
    use crate::events::EventBus;
    use crate::queue::InMemoryJobQueue;
    use crate::run::control::RunController;
    use crate::run::fixtures;
    use crate::run::types::RunStatus;
    use crate::store::{InMemoryRunStore, RunStore};
    use crate::tools::ScriptedTools;

    fn setup(concurrency: usize) -> (Arc<InMemoryRunStore>, RunController, WorkerPool) {
        let store = Arc::new(InMemoryRunStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let mut script = fixtures::script();
        let mut second = script.subjects[0].clone();
        second.subject_id = "item-2".into();
        script.subjects.push(second);
        let config = Arc::new(ScoutConfig::default());
        let events = EventBus::default();
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(ScriptedTools::new(script)),
            events.clone(),
            config.clone(),
        ));
        let control = RunController::new(store.clone(), queue.clone(), events, config.graph.clone());
        let pool = WorkerPool::new(orchestrator, queue, concurrency);
        (store, control, pool)
    }

    #[tokio::test]
    async fn test_run_until_idle_drains_queue() {
        let (store, control, pool) = setup(2);
        let a = control.trigger(fixtures::SUBJECT, fixtures::OWNER).await.unwrap();
        let b = control.trigger("item-2", fixtures::OWNER).await.unwrap();

        let processed = pool.run_until_idle().await.unwrap();
        assert_eq!(processed, 2);
        for id in [a.id, b.id] {
            let row = store.get_required(id).await.unwrap();
            assert_eq!(row.status, RunStatus::Success);
        }
        assert_eq!(pool.run_until_idle().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_queue_is_idle() {
        let (_, _, pool) = setup(1);
        assert!(pool.process_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_spawned_workers_stop_on_shutdown() {
        let (store, control, pool) = setup(1);
        let pool = Arc::new(pool.with_poll_interval(Duration::from_millis(10)));
        let (tx, rx) = watch::channel(false);
        let handles = pool.clone().spawn(rx);

        let run = control.trigger(fixtures::SUBJECT, fixtures::OWNER).await.unwrap();
        let mut finished = false;
        for _ in 0..200 {
            if store.get_required(run.id).await.unwrap().status == RunStatus::Success {
                finished = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(finished);

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
