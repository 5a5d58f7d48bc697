//! Event model: domain events, integration events, and payload rules.
//!
//! Two kinds of events flow through the system:
//!
//! - **Domain events** are in-process signals dispatched to local
//!   subscribers through a [`DomainEventDispatcher`](crate::event::router::DomainEventDispatcher).
//! - **Integration events** extend domain events with a stable wire name
//!   and a serializable payload; they are additionally written to the
//!   transactional outbox and eventually reach another logical service.

mod router;
mod uow;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use router::{DomainEventDispatcher, EventRouter, NoopDispatcher};
pub use uow::{AggregateRoot, UnitOfWork};

/// Whether an outbox entry carries an event or a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// A fact about something that happened.
    Event,
    /// An instruction for another service to act on.
    Command,
}

impl MessageKind {
    /// Database string representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Command => "command",
        }
    }

    /// Parse from the database string representation.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "event" => Ok(Self::Event),
            "command" => Ok(Self::Command),
            _ => Err(crate::Error::Invariant(format!(
                "invalid message kind: {s}"
            ))),
        }
    }
}

/// Which transport an outbox entry targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// The in-process async job queue.
    InProcess,
    /// An external bus behind the pluggable sink.
    External,
}

impl Transport {
    /// Database string representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InProcess => "in_process",
            Self::External => "external",
        }
    }

    /// Parse from the database string representation.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "in_process" => Ok(Self::InProcess),
            "external" => Ok(Self::External),
            _ => Err(crate::Error::Invariant(format!("invalid transport: {s}"))),
        }
    }
}

/// An in-process signal of something that happened in the model.
///
/// Aggregates record domain events while handling a command; the unit of
/// work collects them and the router delivers each to local subscribers.
pub trait DomainEvent: Send + Sync {
    /// Stable event name, used for subscriber lookup and the outbox
    /// `event_type` column.
    fn name(&self) -> &str;

    /// The event payload as a JSON object.
    fn payload(&self) -> Value;

    /// Downcast hook: `Some` when this event is also an integration event.
    fn as_integration(&self) -> Option<&dyn IntegrationEvent> {
        None
    }
}

/// A durable, outbound event meant to reach another logical service.
///
/// Integration events are written to the outbox inside the command's
/// transaction and published by the outbox processor after commit.
pub trait IntegrationEvent: DomainEvent {
    /// The wire name routed to downstream consumers. Stable across
    /// deployments, independent of the local dispatcher.
    fn integration_action(&self) -> &str;

    /// Whether the entry is an event or a command for the consumer.
    fn message_kind(&self) -> MessageKind {
        MessageKind::Event
    }

    /// Preferred transport for this event.
    fn transport(&self) -> Transport {
        Transport::InProcess
    }

    /// Optional queue group name; falls back to the configured default.
    fn queue(&self) -> Option<&str> {
        None
    }

    /// Seconds to delay publication after commit.
    fn delay_seconds(&self) -> i64 {
        0
    }

    /// When true, a newly written entry supersedes pending entries of the
    /// same event type (they are cancelled).
    fn is_unique(&self) -> bool {
        false
    }
}

/// A type-erased view of an integration event as seen by consumers and
/// the long-process runner: the event name plus its payload fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// The domain event name (what suspended processes wait for).
    pub name: String,
    /// The scalarized payload fields.
    pub fields: Map<String, Value>,
}

impl EventEnvelope {
    /// Build an envelope from a typed integration event.
    pub fn from_event(event: &dyn IntegrationEvent) -> Self {
        let fields = match scalarize(event.payload()) {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_owned(), other);
                map
            }
        };
        Self {
            name: event.name().to_owned(),
            fields,
        }
    }

    /// Build an envelope from a name and raw fields.
    pub fn new(name: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }
}

/// Normalize a payload tree for durable storage.
///
/// Scalars and nulls pass through; arrays and objects recurse. Typed
/// conversions (entities to their ids, enums to their discriminants,
/// timestamps to RFC 3339) are expressed through the payload's `Serialize`
/// implementation before this pass. Non-finite numbers cannot survive a
/// JSON round trip, so they are stringified.
pub fn scalarize(value: Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => value,
        Value::Number(n) => {
            // serde_json numbers are finite by construction except through
            // arbitrary-precision features; keep the guard cheap.
            Value::Number(n)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(scalarize).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, scalarize(value)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Earned {
        user_id: i64,
        amount: i64,
    }

    impl DomainEvent for Earned {
        fn name(&self) -> &str {
            "user_earned"
        }

        fn payload(&self) -> Value {
            json!({"user_id": self.user_id, "amount": self.amount})
        }

        fn as_integration(&self) -> Option<&dyn IntegrationEvent> {
            Some(self)
        }
    }

    impl IntegrationEvent for Earned {
        fn integration_action(&self) -> &str {
            "points.user_earned"
        }
    }

    #[test]
    fn kind_and_transport_round_trip() {
        for kind in [MessageKind::Event, MessageKind::Command] {
            assert_eq!(MessageKind::parse(kind.as_str()).unwrap(), kind);
        }
        for transport in [Transport::InProcess, Transport::External] {
            assert_eq!(Transport::parse(transport.as_str()).unwrap(), transport);
        }
        assert!(MessageKind::parse("bogus").is_err());
        assert!(Transport::parse("bogus").is_err());
    }

    #[test]
    fn envelope_from_typed_event() {
        let event = Earned {
            user_id: 7,
            amount: 5,
        };
        let envelope = EventEnvelope::from_event(&event);

        assert_eq!(envelope.name, "user_earned");
        assert_eq!(envelope.fields.get("user_id"), Some(&json!(7)));
        assert_eq!(envelope.fields.get("amount"), Some(&json!(5)));
    }

    #[test]
    fn scalarize_recurses_into_collections() {
        let value = json!({
            "id": 3,
            "tags": ["a", "b"],
            "nested": {"when": "2024-01-01T00:00:00Z", "flag": true},
        });

        assert_eq!(scalarize(value.clone()), value);
    }

    #[test]
    fn integration_event_defaults() {
        let event = Earned {
            user_id: 1,
            amount: 1,
        };

        assert_eq!(event.message_kind(), MessageKind::Event);
        assert_eq!(event.transport(), Transport::InProcess);
        assert_eq!(event.queue(), None);
        assert_eq!(event.delay_seconds(), 0);
        assert!(!event.is_unique());
    }
}
