//! Abstract async job queue.
//!
//! The core never runs jobs itself; it enqueues named jobs with JSON
//! payloads onto whatever queue the host provides, with at-least-once
//! dispatch semantics. Jobs referenced by the core: the periodic outbox
//! processing job, the long-process continuation job, and the
//! behaviour-workflow run job.

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::Result;

/// At-least-once dispatch of named jobs, optionally delayed.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Enqueue a job for immediate dispatch.
    async fn enqueue(&self, name: &str, payload: Value, group: &str) -> Result<()>;

    /// Enqueue a job to run no earlier than `run_at`.
    async fn enqueue_at(
        &self,
        run_at: OffsetDateTime,
        name: &str,
        payload: Value,
        group: &str,
    ) -> Result<()>;
}

/// A job held by the in-memory queue.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    /// The job name.
    pub name: String,
    /// The job payload.
    pub payload: Value,
    /// The queue group the job was enqueued on.
    pub group: String,
    /// Earliest dispatch time; `None` for immediate jobs.
    pub run_at: Option<OffsetDateTime>,
    /// When the job was enqueued.
    pub enqueued_at: OffsetDateTime,
}

/// In-process queue backed by a vector. Used by tests and embedded
/// deployments where the host polls jobs itself.
#[derive(Default)]
pub struct MemoryQueue {
    jobs: Mutex<Vec<QueuedJob>>,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all jobs, in enqueue order.
    pub async fn jobs(&self) -> Vec<QueuedJob> {
        self.jobs.lock().await.clone()
    }

    /// Number of jobs held.
    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Whether the queue holds no jobs.
    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    /// Remove and return the jobs due at `now`, leaving future-scheduled
    /// jobs in place.
    pub async fn take_due(&self, now: OffsetDateTime) -> Vec<QueuedJob> {
        let mut jobs = self.jobs.lock().await;
        let (due, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *jobs)
            .into_iter()
            .partition(|job| job.run_at.map_or(true, |at| at <= now));
        *jobs = rest;
        due
    }

    /// Remove all jobs.
    pub async fn clear(&self) {
        self.jobs.lock().await.clear();
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, name: &str, payload: Value, group: &str) -> Result<()> {
        self.jobs.lock().await.push(QueuedJob {
            name: name.to_owned(),
            payload,
            group: group.to_owned(),
            run_at: None,
            enqueued_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    async fn enqueue_at(
        &self,
        run_at: OffsetDateTime,
        name: &str,
        payload: Value,
        group: &str,
    ) -> Result<()> {
        self.jobs.lock().await.push(QueuedJob {
            name: name.to_owned(),
            payload,
            group: group.to_owned(),
            run_at: Some(run_at),
            enqueued_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }
}

#[async_trait]
impl<Q: JobQueue> JobQueue for std::sync::Arc<Q> {
    async fn enqueue(&self, name: &str, payload: Value, group: &str) -> Result<()> {
        (**self).enqueue(name, payload, group).await
    }

    async fn enqueue_at(
        &self,
        run_at: OffsetDateTime,
        name: &str,
        payload: Value,
        group: &str,
    ) -> Result<()> {
        (**self).enqueue_at(run_at, name, payload, group).await
    }
}
