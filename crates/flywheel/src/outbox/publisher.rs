//! Publisher routing: hand claimed entries to a transport.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;

use super::OutboxEntry;
use crate::config::OutboxConfig;
use crate::event::Transport;
use crate::queue::JobQueue;
use crate::{Error, Result};

/// Hands one claimed entry to a transport.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    /// Publish the entry. `wrapped` is the stored payload with the
    /// correlation envelope keys injected.
    async fn publish(&self, entry: &OutboxEntry, wrapped: Value) -> Result<()>;
}

/// A replaceable handler for entries routed to an external bus.
///
/// Returns `true` when the sink accepted the entry. When an entry
/// *requires* external transport and no sink handles it, the publish
/// fails so retries and the DLQ surface the misconfiguration.
#[async_trait]
pub trait ExternalSink: Send + Sync {
    /// Attempt delivery; `Ok(false)` means the sink declined the entry.
    async fn publish(&self, entry: &OutboxEntry, wrapped: &Value) -> Result<bool>;
}

/// Extensibility hook resolving the transport an entry is actually sent
/// on. The default uses the transport stored on the entry.
pub trait TransportResolver: Send + Sync {
    /// The transport to use for this entry.
    fn resolve(&self, entry: &OutboxEntry) -> Transport;
}

/// The built-in publisher: routes entries to the in-process async queue,
/// or to the external sink for external transport and oversized payloads.
pub struct QueuePublisher<Q: JobQueue> {
    queue: Q,
    external: Option<Arc<dyn ExternalSink>>,
    resolver: Option<Arc<dyn TransportResolver>>,
    config: OutboxConfig,
}

impl<Q: JobQueue> QueuePublisher<Q> {
    /// Create a publisher over the in-process queue only.
    pub fn new(queue: Q, config: OutboxConfig) -> Self {
        Self {
            queue,
            external: None,
            resolver: None,
            config,
        }
    }

    /// Attach an external sink for entries with external transport.
    pub fn with_external(mut self, sink: Arc<dyn ExternalSink>) -> Self {
        self.external = Some(sink);
        self
    }

    /// Override transport resolution.
    pub fn with_resolver(mut self, resolver: Arc<dyn TransportResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Job name handed to the queue: `{prefix}_integration_{action}`.
    fn job_name(&self, entry: &OutboxEntry) -> String {
        format!(
            "{}_integration_{}",
            self.config.job_prefix, entry.integration_action
        )
    }
}

#[async_trait]
impl<Q: JobQueue> OutboxPublisher for QueuePublisher<Q> {
    async fn publish(&self, entry: &OutboxEntry, wrapped: Value) -> Result<()> {
        let effective = match &self.resolver {
            Some(resolver) => resolver.resolve(entry),
            None => entry.transport,
        };
        let oversized = self.config.route_large_payloads_external
            && entry.payload_bytes > self.config.max_in_process_bytes;

        if effective == Transport::External || oversized {
            if let Some(sink) = &self.external {
                if sink.publish(entry, &wrapped).await? {
                    debug!(
                        event_id = %entry.event_id,
                        action = %entry.integration_action,
                        "Entry handled by external sink"
                    );
                    return Ok(());
                }
            }

            if effective == Transport::External {
                return Err(Error::ExternalPublish(format!(
                    "no external sink handled '{}'",
                    entry.integration_action
                )));
            }
            // Oversized but in-process transport: the sink declined, fall
            // through to the queue.
        }

        let group = entry
            .queue
            .as_deref()
            .unwrap_or(&self.config.default_group);
        let name = self.job_name(entry);

        if entry.delay_seconds > 0 {
            let run_at =
                OffsetDateTime::now_utc() + time::Duration::seconds(entry.delay_seconds);
            self.queue.enqueue_at(run_at, &name, wrapped, group).await
        } else {
            self.queue.enqueue(&name, wrapped, group).await
        }
    }
}
