//! The outbox processor: claim-and-publish worker loop.

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{OutboxPublisher, OutboxStore, RetryPolicy};
use crate::config::OutboxConfig;
use crate::Result;

/// Outcome counts for one processor batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingReport {
    /// Entries published and marked completed.
    pub completed: u64,
    /// Entries that failed and were scheduled for retry.
    pub failed: u64,
    /// Entries moved to the dead letter queue.
    pub dlq: u64,
    /// Entries claimed in this batch.
    pub total: u64,
}

/// Derive a worker id from the host name and process id.
///
/// Falls back to a random id when the platform exposes no host name.
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    format!("{host}-{}", std::process::id())
}

/// Drains the outbox on a schedule.
///
/// Each [`process_batch`](Self::process_batch) invocation:
///
/// 1. Releases stale claims left by crashed workers.
/// 2. Claims up to `batch_size` due entries under a lease.
/// 3. Publishes each entry with the correlation envelope injected; marks
///    it completed, schedules a retry, or moves it to the DLQ.
///
/// Publish failures are absorbed per entry — one poisoned payload never
/// takes down the batch.
pub struct OutboxProcessor<S, P>
where
    S: OutboxStore,
    P: OutboxPublisher,
{
    store: S,
    publisher: P,
    config: OutboxConfig,
    policy: RetryPolicy,
    worker_id: String,
}

impl<S, P> OutboxProcessor<S, P>
where
    S: OutboxStore,
    P: OutboxPublisher,
{
    /// Create a processor with a derived worker id.
    pub fn new(store: S, publisher: P, config: OutboxConfig) -> Self {
        let worker_id = default_worker_id();
        Self::with_worker_id(store, publisher, config, worker_id)
    }

    /// Create a processor with an explicit worker id.
    pub fn with_worker_id(
        store: S,
        publisher: P,
        config: OutboxConfig,
        worker_id: String,
    ) -> Self {
        let policy = config.retry_policy();
        Self {
            store,
            publisher,
            config,
            policy,
            worker_id,
        }
    }

    /// The worker id used for claim leases.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run one batch; see the type-level docs for the steps.
    pub async fn process_batch(&self) -> Result<ProcessingReport> {
        let released = self
            .store
            .release_stale_locks(self.config.lock_timeout())
            .await?;
        if released > 0 {
            warn!(released, "Reclaimed stale outbox leases");
        }

        let entries = self
            .store
            .fetch_pending(
                self.config.batch_size,
                &self.worker_id,
                self.config.lock_timeout(),
            )
            .await?;

        let mut report = ProcessingReport {
            total: entries.len() as u64,
            ..Default::default()
        };
        if entries.is_empty() {
            return Ok(report);
        }

        for entry in entries {
            let wrapped = Value::Object(entry.wrapped_payload());

            match self.publisher.publish(&entry, wrapped).await {
                Ok(()) => {
                    self.store.mark_completed(entry.event_id).await?;
                    report.completed += 1;
                    debug!(
                        event_id = %entry.event_id,
                        event_type = %entry.event_type,
                        "Outbox entry published"
                    );
                }
                Err(error) => {
                    let message = error.to_string();
                    let new_attempts = entry.attempts + 1;

                    if new_attempts >= entry.max_attempts {
                        warn!(
                            event_id = %entry.event_id,
                            event_type = %entry.event_type,
                            attempts = new_attempts,
                            error = %message,
                            "Outbox entry exhausted retries, moving to DLQ"
                        );
                        self.store.move_to_dlq(entry.event_id, &message).await?;
                        report.dlq += 1;
                    } else {
                        let backoff = self.policy.delay_for_attempt(new_attempts);
                        debug!(
                            event_id = %entry.event_id,
                            attempts = new_attempts,
                            backoff_secs = backoff.as_secs(),
                            error = %message,
                            "Outbox entry failed, retry scheduled"
                        );
                        self.store
                            .mark_failed(entry.event_id, &self.worker_id, &message, backoff)
                            .await?;
                        report.failed += 1;
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_carries_the_pid() {
        let id = default_worker_id();
        assert!(id.ends_with(&format!("-{}", std::process::id())));
    }
}
