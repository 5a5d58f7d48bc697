//! Per-command event buffer.

use std::sync::Arc;

use super::DomainEvent;

/// An aggregate root records domain events while it is mutated; the unit
/// of work drains them before the command commits.
pub trait AggregateRoot {
    /// Remove and return the events recorded since the last drain.
    fn take_events(&mut self) -> Vec<Arc<dyn DomainEvent>>;
}

/// Buffers the events produced while handling one command.
///
/// The publish stage of the pipeline drains the buffer after the handler
/// returns and routes each event; drained events are kept on a `published`
/// log for the audit record.
#[derive(Default)]
pub struct UnitOfWork {
    queued: Vec<Arc<dyn DomainEvent>>,
    published: Vec<Arc<dyn DomainEvent>>,
}

impl UnitOfWork {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard all queued and published events.
    pub fn reset(&mut self) {
        self.queued.clear();
        self.published.clear();
    }

    /// Queue a single event.
    pub fn record(&mut self, event: Arc<dyn DomainEvent>) {
        self.queued.push(event);
    }

    /// Drain the events an aggregate recorded into this buffer.
    pub fn collect_from(&mut self, aggregate: &mut dyn AggregateRoot) {
        self.queued.extend(aggregate.take_events());
    }

    /// Take the queued events, appending them to the published log.
    pub fn drain(&mut self) -> Vec<Arc<dyn DomainEvent>> {
        let drained = std::mem::take(&mut self.queued);
        self.published.extend(drained.iter().cloned());
        drained
    }

    /// The events drained so far, in publish order (the audit view).
    pub fn published(&self) -> &[Arc<dyn DomainEvent>] {
        &self.published
    }

    /// Names of the events drained so far.
    pub fn published_names(&self) -> Vec<String> {
        self.published
            .iter()
            .map(|event| event.name().to_owned())
            .collect()
    }

    /// Whether any events are waiting to be drained.
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    struct Ping;

    impl DomainEvent for Ping {
        fn name(&self) -> &str {
            "ping"
        }

        fn payload(&self) -> Value {
            json!({})
        }
    }

    struct Counter {
        events: Vec<Arc<dyn DomainEvent>>,
    }

    impl AggregateRoot for Counter {
        fn take_events(&mut self) -> Vec<Arc<dyn DomainEvent>> {
            std::mem::take(&mut self.events)
        }
    }

    #[test]
    fn drain_moves_queued_to_published() {
        let mut uow = UnitOfWork::new();
        uow.record(Arc::new(Ping));
        uow.record(Arc::new(Ping));

        let drained = uow.drain();

        assert_eq!(drained.len(), 2);
        assert!(uow.is_empty());
        assert_eq!(uow.published_names(), vec!["ping", "ping"]);
    }

    #[test]
    fn collect_from_empties_the_aggregate() {
        let mut aggregate = Counter {
            events: vec![Arc::new(Ping)],
        };
        let mut uow = UnitOfWork::new();

        uow.collect_from(&mut aggregate);
        uow.collect_from(&mut aggregate);

        assert_eq!(uow.drain().len(), 1);
    }

    #[test]
    fn reset_clears_both_buffers() {
        let mut uow = UnitOfWork::new();
        uow.record(Arc::new(Ping));
        uow.drain();
        uow.record(Arc::new(Ping));

        uow.reset();

        assert!(uow.is_empty());
        assert!(uow.published().is_empty());
    }
}
