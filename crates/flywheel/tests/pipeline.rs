//! Command pipeline scenarios: atomicity, audit, correlation.

mod support;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use flywheel::bus::AuditStatus;
use flywheel::{
    Command, CommandBus, CommandHandler, CommandScope, DispatchOptions, Error, MemoryStore,
    OutboxStatus, Result,
};

use support::UserEarned;

#[derive(Debug, Serialize, Deserialize)]
struct AwardPoints {
    user_id: i64,
    amount: i64,
    api_key: String,
    fail: bool,
}

impl Command for AwardPoints {
    type Output = i64;

    const NAME: &'static str = "award_points";
    const TRANSACTIONAL: bool = true;
}

struct AwardPointsHandler;

#[async_trait]
impl CommandHandler<MemoryStore> for AwardPointsHandler {
    type Command = AwardPoints;

    async fn handle(
        &self,
        command: AwardPoints,
        scope: &mut CommandScope<MemoryStore>,
    ) -> Result<i64> {
        scope.record(Arc::new(UserEarned::new(command.user_id, command.amount)));
        if command.fail {
            return Err(Error::BusinessConstraint("points budget exhausted".into()));
        }
        Ok(command.amount)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AwardTwice {
    user_id: i64,
}

impl Command for AwardTwice {
    type Output = ();

    const NAME: &'static str = "award_twice";
    const TRANSACTIONAL: bool = true;
}

struct AwardTwiceHandler;

#[async_trait]
impl CommandHandler<MemoryStore> for AwardTwiceHandler {
    type Command = AwardTwice;

    async fn handle(
        &self,
        command: AwardTwice,
        scope: &mut CommandScope<MemoryStore>,
    ) -> Result<()> {
        scope.record(Arc::new(UserEarned::new(command.user_id, 1)));
        scope.record(Arc::new(UserEarned::new(command.user_id, 2)));
        Ok(())
    }
}

fn bus(store: &MemoryStore) -> CommandBus<MemoryStore> {
    CommandBus::builder(store.clone())
        .audit(Arc::new(store.clone()))
        .environment("test")
        .register(AwardPointsHandler)
        .register(AwardTwiceHandler)
        .build()
        .unwrap()
}

fn award(fail: bool) -> AwardPoints {
    AwardPoints {
        user_id: 7,
        amount: 5,
        api_key: "sk-sensitive".into(),
        fail,
    }
}

#[tokio::test]
async fn successful_command_commits_outbox_write_with_the_business_result() {
    let store = MemoryStore::new();
    let bus = bus(&store);

    let amount = bus.dispatch(award(false)).await.unwrap();
    assert_eq!(amount, 5);

    let rows = store.outbox_snapshot();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, OutboxStatus::Pending);
    assert_eq!(rows[0].event_type, "user_earned");
    assert!(rows[0].command_id.is_some());
}

#[tokio::test]
async fn failed_command_rolls_back_its_outbox_writes() {
    let store = MemoryStore::new();
    let bus = bus(&store);

    let err = bus.dispatch(award(true)).await.unwrap_err();
    assert!(matches!(err, Error::BusinessConstraint(_)));

    // The event was recorded but never published: no orphan outbox row.
    assert!(store.outbox_snapshot().is_empty());
}

#[tokio::test]
async fn audit_rows_reflect_both_outcomes_with_redacted_parameters() {
    let store = MemoryStore::new();
    let bus = bus(&store);

    bus.dispatch(award(false)).await.unwrap();
    let _ = bus.dispatch(award(true)).await;

    let audits = store.audit_snapshot();
    assert_eq!(audits.len(), 2);

    let success = &audits[0];
    assert_eq!(success.command_name, "award_points");
    assert_eq!(success.status, AuditStatus::Success);
    assert_eq!(success.events, vec!["user_earned"]);
    assert!(success.duration_ms.is_some());
    assert_eq!(success.environment, "test");
    assert_eq!(success.parameters.get("api_key"), Some(&json!("[redacted]")));
    assert_eq!(success.parameters.get("user_id"), Some(&json!(7)));

    let failure = &audits[1];
    assert_eq!(failure.status, AuditStatus::Error);
    let error = failure.error.as_ref().unwrap();
    assert_eq!(error.kind, "business_constraint");
    assert!(error.message.contains("points budget exhausted"));
    assert!(failure.events.is_empty());

    // The audit command id links to the committed outbox row.
    let row = &store.outbox_snapshot()[0];
    assert_eq!(row.command_id, Some(success.command_id));
    assert_eq!(row.correlation_id, success.correlation_id);
}

#[tokio::test]
async fn events_in_one_command_share_the_correlation_with_increasing_sequence() {
    let store = MemoryStore::new();
    let bus = bus(&store);

    bus.dispatch(AwardTwice { user_id: 3 }).await.unwrap();

    let rows = store.outbox_snapshot();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].correlation_id, rows[1].correlation_id);
    assert_eq!(rows[0].sequence, 1);
    assert_eq!(rows[1].sequence, 2);
}

#[tokio::test]
async fn commands_get_distinct_correlations_unless_one_is_supplied() {
    let store = MemoryStore::new();
    let bus = bus(&store);

    bus.dispatch(award(false)).await.unwrap();
    bus.dispatch(award(false)).await.unwrap();

    let rows = store.outbox_snapshot();
    assert_ne!(rows[0].correlation_id, rows[1].correlation_id);
    assert_eq!(rows[0].sequence, 1);
    assert_eq!(rows[1].sequence, 1);

    // Joining an existing correlation continues it.
    let shared = uuid::Uuid::new_v4();
    bus.dispatch_with(
        award(false),
        DispatchOptions {
            correlation_id: Some(shared),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let rows = store.outbox_snapshot();
    assert_eq!(rows[2].correlation_id, shared);
}

#[tokio::test]
async fn dynamic_dispatch_reenters_by_name() {
    let store = MemoryStore::new();
    let bus = bus(&store);

    let output = bus
        .dispatch_dynamic(
            "award_points",
            json!({"user_id": 1, "amount": 3, "api_key": "k", "fail": false}),
            DispatchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(output, json!(3));

    let err = bus
        .dispatch_dynamic("no_such_command", json!({}), DispatchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownCommand(_)));
}
