//! Event routing: local dispatch plus outbox publication.

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::DomainEvent;
use crate::correlation::CorrelationContext;
use crate::config::OutboxConfig;
use crate::outbox::{NewOutboxEntry, OutboxWriter};
use crate::Result;

/// Delivers domain events to in-process subscribers.
///
/// The concrete dispatcher is host-specific (a hook bus, an observer list,
/// a subscriber map); the core only requires delivery by event name.
#[async_trait]
pub trait DomainEventDispatcher: Send + Sync {
    /// Deliver an event to local subscribers.
    async fn dispatch(&self, event: &dyn DomainEvent) -> Result<()>;
}

/// Dispatcher that drops every event. Useful for tests and for services
/// without local subscribers.
pub struct NoopDispatcher;

#[async_trait]
impl DomainEventDispatcher for NoopDispatcher {
    async fn dispatch(&self, _event: &dyn DomainEvent) -> Result<()> {
        Ok(())
    }
}

/// Routes events produced by command handlers.
///
/// Every event is dispatched locally. Integration events are additionally
/// written to the outbox through the supplied [`OutboxWriter`] — which is
/// the command's open transaction, so the write commits atomically with
/// the command's business writes.
pub struct EventRouter {
    dispatcher: std::sync::Arc<dyn DomainEventDispatcher>,
    config: OutboxConfig,
}

impl EventRouter {
    /// Create a router over a local dispatcher.
    pub fn new(dispatcher: std::sync::Arc<dyn DomainEventDispatcher>, config: OutboxConfig) -> Self {
        Self { dispatcher, config }
    }

    /// Publish one event.
    ///
    /// Returns the outbox `event_id` when the event was an integration
    /// event, `None` for a purely local event. A unique integration event
    /// first cancels pending entries of the same type.
    pub async fn publish(
        &self,
        event: &dyn DomainEvent,
        outbox: &mut dyn OutboxWriter,
        ctx: &mut CorrelationContext,
        blog_id: i64,
    ) -> Result<Option<Uuid>> {
        self.dispatcher.dispatch(event).await?;

        let Some(integration) = event.as_integration() else {
            return Ok(None);
        };

        if integration.is_unique() {
            let cancelled = outbox
                .cancel_duplicates(event.name(), None)
                .await?;
            if cancelled > 0 {
                debug!(
                    event_type = event.name(),
                    cancelled, "Superseded pending unique entries"
                );
            }
        }

        let entry = NewOutboxEntry::from_event(integration, ctx, &self.config, blog_id)?;
        let event_id = outbox.write_entry(entry).await?;

        debug!(
            event_type = event.name(),
            event_id = %event_id,
            "Integration event written to outbox"
        );

        Ok(Some(event_id))
    }
}
