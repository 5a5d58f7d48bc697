//! Per-operation correlation state.
//!
//! A [`CorrelationContext`] links every event, outbox row, and audit record
//! produced while handling one command back to the user action that caused
//! it. The context is an owned value carried by the current task — there is
//! no process-wide singleton — so parallel commands never share state.
//!
//! Durable job payloads carry the correlation as three envelope keys
//! ([`CORRELATION_ID_KEY`], [`SEQUENCE_KEY`], [`EVENT_ID_KEY`]) so a
//! context can be restored when a job resumes on another worker.

use serde_json::{Map, Value};
use uuid::Uuid;

/// Envelope key carrying the correlation id on durable payloads.
pub const CORRELATION_ID_KEY: &str = "__correlation_id";
/// Envelope key carrying the event sequence on durable payloads.
pub const SEQUENCE_KEY: &str = "__sequence";
/// Envelope key carrying the outbox event id on durable payloads.
pub const EVENT_ID_KEY: &str = "__event_id";

/// Correlation state for one logical operation.
#[derive(Debug, Clone, Default)]
pub struct CorrelationContext {
    correlation_id: Option<Uuid>,
    command_id: Option<Uuid>,
    sequence: i64,
}

impl CorrelationContext {
    /// Create an empty context. The correlation id is generated lazily on
    /// the first [`get`](Self::get).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context seeded with the given correlation id, or empty if
    /// `None`.
    pub fn init(correlation_id: Option<Uuid>) -> Self {
        Self {
            correlation_id,
            command_id: None,
            sequence: 0,
        }
    }

    /// The correlation id, generating and caching a fresh UUIDv4 if none
    /// has been set yet.
    pub fn get(&mut self) -> Uuid {
        *self.correlation_id.get_or_insert_with(Uuid::new_v4)
    }

    /// The correlation id if one exists. Never generates.
    pub fn peek(&self) -> Option<Uuid> {
        self.correlation_id
    }

    /// Replace the correlation id.
    pub fn set(&mut self, correlation_id: Uuid) {
        self.correlation_id = Some(correlation_id);
    }

    /// Attach the id of the command currently being handled.
    pub fn set_command_id(&mut self, command_id: Uuid) {
        self.command_id = Some(command_id);
    }

    /// The id of the command currently being handled, if any.
    pub fn command_id(&self) -> Option<Uuid> {
        self.command_id
    }

    /// The next sequence number within this correlation.
    ///
    /// The counter starts at 0; the first call returns 1 and every call
    /// after that returns a strictly larger value. Used to order events
    /// that share a correlation id.
    pub fn next_sequence(&mut self) -> i64 {
        self.sequence += 1;
        self.sequence
    }

    /// The last sequence number handed out (0 if none yet).
    pub fn current_sequence(&self) -> i64 {
        self.sequence
    }

    /// Clear all state so nothing leaks into the next operation.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Restore a context from the envelope keys of a durable payload.
    ///
    /// Unknown or malformed keys are ignored; a job without an envelope
    /// yields an empty context.
    pub fn from_envelope(payload: &Map<String, Value>) -> Self {
        let correlation_id = payload
            .get(CORRELATION_ID_KEY)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        let sequence = payload
            .get(SEQUENCE_KEY)
            .and_then(Value::as_i64)
            .unwrap_or(0);

        Self {
            correlation_id,
            command_id: None,
            sequence,
        }
    }
}

/// The wire envelope injected into published payloads by the outbox
/// processor and stripped by queue consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Correlation id of the originating operation.
    pub correlation_id: Uuid,
    /// Sequence of the event within the correlation.
    pub sequence: i64,
    /// The outbox event id.
    pub event_id: Uuid,
}

impl Envelope {
    /// Write the envelope keys into a payload object.
    pub fn apply(&self, payload: &mut Map<String, Value>) {
        payload.insert(
            CORRELATION_ID_KEY.to_owned(),
            Value::String(self.correlation_id.to_string()),
        );
        payload.insert(SEQUENCE_KEY.to_owned(), Value::from(self.sequence));
        payload.insert(
            EVENT_ID_KEY.to_owned(),
            Value::String(self.event_id.to_string()),
        );
    }

    /// Remove and parse the envelope keys from a payload object.
    ///
    /// Returns `None` (leaving the payload untouched apart from removed
    /// keys) if any key is missing or malformed.
    pub fn strip(payload: &mut Map<String, Value>) -> Option<Self> {
        let correlation_id = payload
            .remove(CORRELATION_ID_KEY)
            .and_then(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()));
        let sequence = payload.remove(SEQUENCE_KEY).and_then(|v| v.as_i64());
        let event_id = payload
            .remove(EVENT_ID_KEY)
            .and_then(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()));

        Some(Self {
            correlation_id: correlation_id?,
            sequence: sequence?,
            event_id: event_id?,
        })
    }
}
