//! Transactional outbox: durable integration-event storage.
//!
//! Integration events are written to the outbox table in the same database
//! transaction as the command's business writes, then drained by the
//! [`OutboxProcessor`] and handed to a transport by the
//! [`OutboxPublisher`]. Entries that exhaust their retry budget move to
//! the dead letter queue for inspection and redrive.

mod processor;
mod publisher;
mod retry;
mod store;

use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

pub use processor::{default_worker_id, OutboxProcessor, ProcessingReport};
pub use publisher::{ExternalSink, OutboxPublisher, QueuePublisher, TransportResolver};
pub use retry::RetryPolicy;
pub use store::{AutocommitOutbox, OutboxStore, OutboxWriter};

use crate::config::OutboxConfig;
use crate::correlation::CorrelationContext;
use crate::event::{scalarize, IntegrationEvent, MessageKind, Transport};
use crate::{Error, Result};

/// Lifecycle status of an outbox entry.
///
/// `Completed`, `Dlq`, and `Cancelled` are terminal — an entry never
/// transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    /// Waiting to be claimed (or waiting for its retry backoff to elapse).
    Pending,
    /// Claimed by a worker holding an unexpired lease.
    Processing,
    /// Published successfully.
    Completed,
    /// Last attempt failed; a retry is scheduled.
    Failed,
    /// Moved to the dead letter queue after exhausting attempts.
    Dlq,
    /// Superseded by a newer unique entry of the same type.
    Cancelled,
}

impl OutboxStatus {
    /// Database string representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dlq => "dlq",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from the database string representation.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dlq" => Ok(Self::Dlq),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(Error::Invariant(format!("invalid outbox status: {s}"))),
        }
    }

    /// Whether the status permits no further transitions.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Dlq | Self::Cancelled)
    }
}

/// A row in the outbox table.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    /// Monotonic row id.
    pub id: i64,
    /// Globally unique event id (UUIDv4).
    pub event_id: Uuid,
    /// The domain event name.
    pub event_type: String,
    /// The stable wire name for downstream consumers.
    pub integration_action: String,
    /// Event or command semantics for the consumer.
    pub message_kind: MessageKind,
    /// Preferred transport.
    pub transport: Transport,
    /// Optional queue group.
    pub queue: Option<String>,
    /// Serialized payload size in bytes.
    pub payload_bytes: i64,
    /// Correlation id of the originating operation.
    pub correlation_id: Uuid,
    /// Sequence within the correlation (strictly increasing).
    pub sequence: i64,
    /// Link to the command audit row, when known.
    pub command_id: Option<Uuid>,
    /// The event payload.
    pub payload: Value,
    /// Publication delay requested by the event.
    pub delay_seconds: i64,
    /// Earliest time the entry becomes claimable.
    pub scheduled_at: OffsetDateTime,
    /// Whether this entry supersedes pending entries of its type.
    pub is_unique: bool,
    /// Lifecycle status.
    pub status: OutboxStatus,
    /// Publish attempts made so far.
    pub attempts: u32,
    /// Attempts permitted before the entry moves to the DLQ.
    pub max_attempts: u32,
    /// Earliest time of the next retry, when a retry is scheduled.
    pub next_attempt_at: Option<OffsetDateTime>,
    /// Lease expiry of the current claim.
    pub locked_until: Option<OffsetDateTime>,
    /// Worker holding the current claim.
    pub locked_by: Option<String>,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// JSON list of prior failures.
    pub error_history: Value,
    /// Row creation time.
    pub created_at: OffsetDateTime,
    /// Time of successful publication.
    pub processed_at: Option<OffsetDateTime>,
    /// Tenant scope.
    pub blog_id: i64,
}

impl OutboxEntry {
    /// The published payload: the stored payload with the correlation
    /// envelope keys injected.
    pub fn wrapped_payload(&self) -> Map<String, Value> {
        let mut map = match &self.payload {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_owned(), other.clone());
                map
            }
        };
        crate::correlation::Envelope {
            correlation_id: self.correlation_id,
            sequence: self.sequence,
            event_id: self.event_id,
        }
        .apply(&mut map);
        map
    }
}

/// The fields of an outbox entry known at write time. The store fills in
/// `event_id`, `scheduled_at`, and the bookkeeping columns.
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    /// The domain event name.
    pub event_type: String,
    /// The stable wire name.
    pub integration_action: String,
    /// Event or command semantics.
    pub message_kind: MessageKind,
    /// Preferred transport.
    pub transport: Transport,
    /// Optional queue group.
    pub queue: Option<String>,
    /// The scalarized payload.
    pub payload: Value,
    /// Accepted for future exact-match supersession; unused by the
    /// baseline type-level matching.
    pub payload_signature: Option<String>,
    /// Publication delay in seconds (never negative).
    pub delay_seconds: i64,
    /// Supersession flag.
    pub is_unique: bool,
    /// Correlation id of the originating operation.
    pub correlation_id: Uuid,
    /// Sequence within the correlation.
    pub sequence: i64,
    /// Link to the command audit row.
    pub command_id: Option<Uuid>,
    /// Retry budget.
    pub max_attempts: u32,
    /// Tenant scope.
    pub blog_id: i64,
}

impl NewOutboxEntry {
    /// Build an entry from a typed integration event and the current
    /// correlation context. Consumes the next sequence number.
    pub fn from_event(
        event: &dyn IntegrationEvent,
        ctx: &mut CorrelationContext,
        config: &OutboxConfig,
        blog_id: i64,
    ) -> Result<Self> {
        let payload = scalarize(event.payload());

        Ok(Self {
            event_type: event.name().to_owned(),
            integration_action: event.integration_action().to_owned(),
            message_kind: event.message_kind(),
            transport: event.transport(),
            queue: event.queue().map(str::to_owned),
            payload,
            payload_signature: None,
            delay_seconds: event.delay_seconds().max(0),
            is_unique: event.is_unique(),
            correlation_id: ctx.get(),
            sequence: ctx.next_sequence(),
            command_id: ctx.command_id(),
            max_attempts: config.max_attempts,
            blog_id,
        })
    }
}

/// An entry that exceeded its retry budget, copied to the DLQ table.
///
/// DLQ rows are append-only; only `resolved_at` is ever updated.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    /// Monotonic row id.
    pub id: i64,
    /// The outbox event id the row was copied from.
    pub event_id: Uuid,
    /// The domain event name.
    pub event_type: String,
    /// The stable wire name.
    pub integration_action: String,
    /// The event payload at the time of the move.
    pub payload: Value,
    /// Correlation id of the originating operation.
    pub correlation_id: Uuid,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// The error that exhausted the budget.
    pub final_error: String,
    /// When the entry was moved here.
    pub moved_at: OffsetDateTime,
    /// When an operator marked the entry handled.
    pub resolved_at: Option<OffsetDateTime>,
    /// Tenant scope.
    pub blog_id: i64,
}

/// Grouped counts over the outbox plus the unresolved DLQ backlog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxStats {
    /// Entries waiting to be claimed.
    pub pending: u64,
    /// Entries currently claimed.
    pub processing: u64,
    /// Entries published successfully.
    pub completed: u64,
    /// Entries awaiting a retry.
    pub failed: u64,
    /// Entries moved to the DLQ.
    pub dlq: u64,
    /// Entries superseded by a unique write.
    pub cancelled: u64,
    /// DLQ rows not yet resolved.
    pub unresolved_dlq: u64,
}
