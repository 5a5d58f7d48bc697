//! The outbox worker runtime.
//!
//! Runs one or more [`OutboxProcessor`] loops as tokio tasks, polling on
//! the configured interval and shutting down gracefully on signal. One
//! worker per host instance is the design point; more are safe because
//! claims are leased row by row.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::OutboxConfig;
use crate::outbox::{default_worker_id, OutboxProcessor, OutboxPublisher, OutboxStore};

/// Coordinates outbox workers.
pub struct OutboxRuntime<S, P>
where
    S: OutboxStore,
    P: OutboxPublisher + 'static,
{
    store: S,
    publisher: Arc<P>,
    config: OutboxConfig,
    workers: usize,
}

impl<S, P> OutboxRuntime<S, P>
where
    S: OutboxStore,
    P: OutboxPublisher + 'static,
{
    /// Create a runtime with a single worker.
    pub fn new(store: S, publisher: P, config: OutboxConfig) -> Self {
        Self {
            store,
            publisher: Arc::new(publisher),
            config,
            workers: 1,
        }
    }

    /// Number of parallel workers to spawn.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Run until the shutdown future completes.
    ///
    /// Each worker claims and processes batches independently; the row
    /// leases keep them from processing the same entry twice. On
    /// shutdown, workers finish their current batch before exiting.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let base_worker_id = default_worker_id();

        info!(
            workers = self.workers,
            interval_secs = self.config.processor_interval_seconds,
            "Outbox runtime starting"
        );

        let mut handles = Vec::with_capacity(self.workers);
        for i in 0..self.workers {
            let worker_id = if self.workers == 1 {
                base_worker_id.clone()
            } else {
                format!("{base_worker_id}-{i}")
            };
            let processor = OutboxProcessor::with_worker_id(
                self.store.clone(),
                SharedPublisher(Arc::clone(&self.publisher)),
                self.config.clone(),
                worker_id,
            );
            let mut worker_shutdown = shutdown_rx.clone();
            let poll = self.config.processor_interval();

            handles.push(tokio::spawn(async move {
                let mut ticks = interval(poll);
                ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = ticks.tick() => {
                            match processor.process_batch().await {
                                Ok(report) if report.total > 0 => {
                                    info!(
                                        worker_id = processor.worker_id(),
                                        completed = report.completed,
                                        failed = report.failed,
                                        dlq = report.dlq,
                                        "Outbox batch processed"
                                    );
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    error!(
                                        worker_id = processor.worker_id(),
                                        error = %e,
                                        "Outbox batch failed"
                                    );
                                }
                            }
                        }
                        _ = worker_shutdown.changed() => {
                            if *worker_shutdown.borrow() {
                                info!(worker_id = processor.worker_id(), "Outbox worker stopping");
                                break;
                            }
                        }
                    }
                }
            }));
        }

        shutdown.await;
        let _ = shutdown_tx.send(true);

        for handle in handles {
            if handle.await.is_err() {
                warn!("Outbox worker task panicked during shutdown");
            }
        }
        info!("Outbox runtime stopped");
    }
}

/// Clones of one publisher shared across workers.
struct SharedPublisher<P: OutboxPublisher>(Arc<P>);

#[async_trait::async_trait]
impl<P: OutboxPublisher> OutboxPublisher for SharedPublisher<P> {
    async fn publish(
        &self,
        entry: &crate::outbox::OutboxEntry,
        wrapped: serde_json::Value,
    ) -> crate::Result<()> {
        self.0.publish(entry, wrapped).await
    }
}
