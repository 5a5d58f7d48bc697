//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use flywheel::event::{DomainEvent, IntegrationEvent};
use flywheel::outbox::OutboxPublisher;
use flywheel::{MessageKind, OutboxConfig, OutboxEntry, Result, Transport};

/// An integration event with tweakable delivery knobs.
pub struct UserEarned {
    pub user_id: i64,
    pub amount: i64,
    pub delay: i64,
    pub unique: bool,
}

impl UserEarned {
    pub fn new(user_id: i64, amount: i64) -> Self {
        Self {
            user_id,
            amount,
            delay: 0,
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

impl DomainEvent for UserEarned {
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

impl IntegrationEvent for UserEarned {
    fn integration_action(&self) -> &str {
        "points.user_earned"
    }

    fn message_kind(&self) -> MessageKind {
        MessageKind::Event
    }

    fn transport(&self) -> Transport {
        Transport::InProcess
    }

    fn delay_seconds(&self) -> i64 {
        self.delay
    }

    fn is_unique(&self) -> bool {
        self.unique
    }
}

/// A publisher that fails the first `fail_times` publishes, then
/// succeeds, recording everything it accepted.
#[derive(Default)]
pub struct FlakyPublisher {
    fail_times: AtomicU32,
    pub published: Mutex<Vec<(OutboxEntry, Value)>>,
}

impl FlakyPublisher {
    pub fn failing(times: u32) -> Self {
        Self {
            fail_times: AtomicU32::new(times),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing(u32::MAX)
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

#[async_trait]
impl OutboxPublisher for FlakyPublisher {
    async fn publish(&self, entry: &OutboxEntry, wrapped: Value) -> Result<()> {
        let remaining = self.fail_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_times
                .store(remaining.saturating_sub(1), Ordering::SeqCst);
            return Err(flywheel::Error::Publish("transport unavailable".into()));
        }
        self.published.lock().unwrap().push((entry.clone(), wrapped));
        Ok(())
    }
}

/// Outbox config tuned for tests: immediate retries, tiny batches.
pub fn fast_outbox_config() -> OutboxConfig {
    OutboxConfig {
        base_retry_delay_seconds: 0,
        max_retry_delay_seconds: 0,
        ..OutboxConfig::default()
    }
}
