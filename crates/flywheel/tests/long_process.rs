//! Long-process runner scenarios: await/resume, compensation,
//! rescheduling.

use std::sync::{Arc, Mutex};

use serde_json::{json, Map};

use flywheel::event::EventEnvelope;
use flywheel::process::PROCESS_CONTINUE_JOB;
use flywheel::store::ProcessStore;
use flywheel::{
    AwaitEvent, Error, MemoryQueue, MemoryStore, NewProcess, ProcessDefinition, ProcessRegistry,
    ProcessRunner, ProcessStatus, RunnerConfig, StepOutcome,
};

type Trace = Arc<Mutex<Vec<String>>>;

fn runner_with(
    definition: ProcessDefinition,
) -> (ProcessRunner<MemoryStore, Arc<MemoryQueue>>, MemoryStore, Arc<MemoryQueue>) {
    let mut registry = ProcessRegistry::new();
    registry.register(definition).unwrap();

    let store = MemoryStore::new();
    let queue = Arc::new(MemoryQueue::new());
    let runner = ProcessRunner::new(
        Arc::new(registry),
        store.clone(),
        Arc::clone(&queue),
        RunnerConfig::default(),
    );
    (runner, store, queue)
}

fn payment_event(order_id: i64) -> EventEnvelope {
    let mut fields = Map::new();
    fields.insert("order_id".to_owned(), json!(order_id));
    fields.insert("amount".to_owned(), json!(10));
    EventEnvelope::new("payment_received", fields)
}

#[tokio::test]
async fn process_suspends_on_await_and_resumes_on_matching_event() {
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    let (t1, t2, t3) = (trace.clone(), trace.clone(), trace.clone());

    let definition = ProcessDefinition::builder("order_flow")
        .step("reserve", move |_ctx| {
            let trace = t1.clone();
            async move {
                trace.lock().unwrap().push("reserve".into());
                StepOutcome::new().with_payload(json!({"reservation": "r-1"}))
            }
        })
        .step("collect_payment", move |ctx| {
            let trace = t2.clone();
            async move {
                trace.lock().unwrap().push("collect_payment".into());
                assert_eq!(ctx.payload, Some(json!({"reservation": "r-1"})));
                Ok(StepOutcome::new()
                    .with_payload(json!({"reservation": "r-1"}))?
                    .suspend_until(
                        AwaitEvent::new("payment_received").with_criterion("order_id", 42),
                    ))
            }
        })
        .step("fulfil", move |ctx| {
            let trace = t3.clone();
            async move {
                let event = ctx.event.expect("resume event reaches the next step");
                assert_eq!(event.name, "payment_received");
                assert_eq!(event.fields.get("amount"), Some(&json!(10)));
                assert_eq!(ctx.payload, Some(json!({"reservation": "r-1"})));
                trace.lock().unwrap().push("fulfil".into());
                Ok(StepOutcome::new())
            }
        })
        .build()
        .unwrap();

    let (runner, store, _queue) = runner_with(definition);

    let record = runner
        .start(NewProcess::new("order_flow", json!({"order_id": 42})))
        .await
        .unwrap();
    let process_id = record.id.unwrap();

    // Suspended with the awaited event and criteria persisted.
    let suspended = store.find(process_id).await.unwrap().unwrap();
    assert_eq!(suspended.status, ProcessStatus::Suspended);
    assert_eq!(suspended.waiting_for.as_deref(), Some("payment_received"));
    assert_eq!(suspended.match_criteria, Some(json!({"order_id": 42})));
    assert_eq!(suspended.payload, Some(json!({"reservation": "r-1"})));

    // A non-matching event wakes nothing.
    let resumed = runner.resume_on_event(&payment_event(41)).await.unwrap();
    assert_eq!(resumed, None);
    assert_eq!(
        store.find(process_id).await.unwrap().unwrap().status,
        ProcessStatus::Suspended
    );

    // The matching event resumes exactly this process to completion.
    let resumed = runner.resume_on_event(&payment_event(42)).await.unwrap();
    assert_eq!(resumed, Some(process_id));

    let done = store.find(process_id).await.unwrap().unwrap();
    assert_eq!(done.status, ProcessStatus::Completed);
    assert_eq!(
        *trace.lock().unwrap(),
        vec!["reserve", "collect_payment", "fulfil"]
    );
}

#[tokio::test]
async fn failed_step_compensates_completed_steps_in_reverse() {
    let refunds: Trace = Arc::new(Mutex::new(Vec::new()));
    let refunds_in_comp = refunds.clone();

    let definition = ProcessDefinition::builder("checkout")
        .step("charge", |_ctx| async {
            StepOutcome::new().with_checkpoint(json!({"txn": "t1"}))
        })
        .step("ship", |_ctx| async {
            Err::<StepOutcome, _>(Error::BusinessConstraint("carrier rejected parcel".into()))
        })
        .compensation("charge", "refund_charge", move |ctx| {
            let refunds = refunds_in_comp.clone();
            async move {
                assert_eq!(ctx.checkpoint, Some(json!({"txn": "t1"})));
                assert!(ctx.cause.as_deref().unwrap().contains("carrier rejected"));
                refunds.lock().unwrap().push("refund_charge".into());
                Ok(StepOutcome::new())
            }
        })
        .build()
        .unwrap();

    let (runner, store, _queue) = runner_with(definition);

    let record = runner
        .start(NewProcess::new("checkout", json!({})))
        .await
        .unwrap();
    let process_id = record.id.unwrap();

    let failed = store.find(process_id).await.unwrap().unwrap();
    assert_eq!(failed.status, ProcessStatus::Failed);
    assert!(failed
        .last_error
        .as_deref()
        .unwrap()
        .contains("carrier rejected parcel"));
    assert!(!failed.steps.is_compensating());
    assert_eq!(*refunds.lock().unwrap(), vec!["refund_charge"]);
}

#[tokio::test]
async fn compensation_failure_marks_the_process_failed_and_resurfaces() {
    let definition = ProcessDefinition::builder("doomed")
        .step("charge", |_ctx| async {
            StepOutcome::new().with_checkpoint(json!({"txn": "t2"}))
        })
        .step("ship", |_ctx| async {
            Err::<StepOutcome, _>(Error::BusinessConstraint("out of stock".into()))
        })
        .compensation("charge", "refund_charge", |_ctx| async {
            Err::<StepOutcome, _>(Error::Publish("refund gateway down".into()))
        })
        .build()
        .unwrap();

    let (runner, store, _queue) = runner_with(definition);

    let err = runner
        .start(NewProcess::new("doomed", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CompensationFailed { .. }));

    let processes = store.find(1).await.unwrap().unwrap();
    assert_eq!(processes.status, ProcessStatus::Failed);
    assert!(processes
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("Compensation failed"));
}

#[tokio::test]
async fn async_step_reschedules_and_continues_under_a_worker() {
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    let (t1, t2) = (trace.clone(), trace.clone());

    let definition = ProcessDefinition::builder("import")
        .step("prepare", move |_ctx| {
            let trace = t1.clone();
            async move {
                trace.lock().unwrap().push("prepare".into());
                Ok(StepOutcome::new())
            }
        })
        .async_step("crunch", move |_ctx| {
            let trace = t2.clone();
            async move {
                trace.lock().unwrap().push("crunch".into());
                Ok(StepOutcome::new())
            }
        })
        .build()
        .unwrap();

    let (runner, store, queue) = runner_with(definition);

    let record = runner
        .start(NewProcess::new("import", json!({})))
        .await
        .unwrap();
    let process_id = record.id.unwrap();

    // The async-marked step did not run inline; a continuation is queued.
    assert_eq!(*trace.lock().unwrap(), vec!["prepare"]);
    let scheduled = store.find(process_id).await.unwrap().unwrap();
    assert_eq!(scheduled.status, ProcessStatus::Scheduled);

    let jobs = queue.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].name, PROCESS_CONTINUE_JOB);
    assert_eq!(jobs[0].payload.get("process_id"), Some(&json!(process_id)));

    // The continuation (a queue worker) executes the async step.
    runner.continue_scheduled(process_id).await.unwrap();
    assert_eq!(*trace.lock().unwrap(), vec!["prepare", "crunch"]);
    assert_eq!(
        store.find(process_id).await.unwrap().unwrap().status,
        ProcessStatus::Completed
    );

    // Continuing a terminal process is a harmless no-op.
    runner.continue_scheduled(process_id).await.unwrap();
}

#[tokio::test]
async fn steps_without_compensation_are_skipped_during_unwind() {
    let refunds: Trace = Arc::new(Mutex::new(Vec::new()));
    let refunds_in_comp = refunds.clone();

    let definition = ProcessDefinition::builder("partial_undo")
        .step("log_intent", |_ctx| async { Ok(StepOutcome::new()) })
        .step("charge", |_ctx| async {
            StepOutcome::new().with_checkpoint(json!({"txn": "t3"}))
        })
        .step("notify", |_ctx| async {
            Err::<StepOutcome, _>(Error::Publish("mail server down".into()))
        })
        .compensation("charge", "refund_charge", move |_ctx| {
            let refunds = refunds_in_comp.clone();
            async move {
                refunds.lock().unwrap().push("refund_charge".into());
                Ok(StepOutcome::new())
            }
        })
        .build()
        .unwrap();

    let (runner, store, _queue) = runner_with(definition);
    let record = runner
        .start(NewProcess::new("partial_undo", json!({})))
        .await
        .unwrap();

    // Only the charge step had a compensation; log_intent was skipped.
    assert_eq!(*refunds.lock().unwrap(), vec!["refund_charge"]);
    let failed = store.find(record.id.unwrap()).await.unwrap().unwrap();
    assert_eq!(failed.status, ProcessStatus::Failed);
    assert_eq!(failed.steps.undo_index(), -1);
}

#[tokio::test]
async fn resume_wakes_only_the_first_matching_process() {
    let definition = ProcessDefinition::builder("waiter")
        .step("wait", |_ctx| async {
            Ok(StepOutcome::new()
                .suspend_until(AwaitEvent::new("payment_received").with_criterion("order_id", 42)))
        })
        .build()
        .unwrap();

    let (runner, store, _queue) = runner_with(definition);

    let first = runner
        .start(NewProcess::new("waiter", json!({})))
        .await
        .unwrap();
    let second = runner
        .start(NewProcess::new("waiter", json!({})))
        .await
        .unwrap();

    let resumed = runner.resume_on_event(&payment_event(42)).await.unwrap();
    assert_eq!(resumed, first.id);

    assert_eq!(
        store.find(first.id.unwrap()).await.unwrap().unwrap().status,
        ProcessStatus::Completed
    );
    assert_eq!(
        store.find(second.id.unwrap()).await.unwrap().unwrap().status,
        ProcessStatus::Suspended
    );
}

#[tokio::test]
async fn failing_command_sink_is_logged_but_never_unwinds_the_process() {
    use async_trait::async_trait;
    use flywheel::process::{CommandEnvelope, CommandSink};

    #[derive(Default)]
    struct BufferWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl std::io::Write for BufferWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl CommandSink for BrokenSink {
        async fn dispatch(
            &self,
            _command: CommandEnvelope,
            _correlation_id: uuid::Uuid,
        ) -> flywheel::Result<()> {
            Err(Error::Publish("command bus offline".into()))
        }
    }

    let buffer = Arc::new(Mutex::new(Vec::new()));
    let writer_buffer = Arc::clone(&buffer);
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || BufferWriter {
            buffer: Arc::clone(&writer_buffer),
        })
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let definition = ProcessDefinition::builder("notifier")
        .step("announce", |_ctx| async {
            StepOutcome::new().with_command("send_newsletter", json!({"issue": 12}))
        })
        .build()
        .unwrap();

    let (runner, store, _queue) = runner_with(definition);
    let runner = runner.with_commands(Arc::new(BrokenSink));

    let record = runner
        .start(NewProcess::new("notifier", json!({})))
        .await
        .unwrap();

    // Commands are fire-and-forget: the sink failure is logged and the
    // process still completes.
    assert_eq!(
        store.find(record.id.unwrap()).await.unwrap().unwrap().status,
        ProcessStatus::Completed
    );
    let logs = String::from_utf8_lossy(&buffer.lock().unwrap()).to_string();
    assert!(logs.contains("Step command dispatch failed"));
}

#[tokio::test]
async fn frozen_schema_survives_reload() {
    let definition = ProcessDefinition::builder("frozen")
        .step("a", |_ctx| async {
            Ok(StepOutcome::new()
                .suspend_until(AwaitEvent::new("never_fires")))
        })
        .compensation("a", "undo_a", |_ctx| async { Ok(StepOutcome::new()) })
        .build()
        .unwrap();
    let snapshot = definition.snapshot();

    let (runner, store, _queue) = runner_with(definition);
    let record = runner
        .start(NewProcess::new("frozen", json!({})))
        .await
        .unwrap();

    let reloaded = store.find(record.id.unwrap()).await.unwrap().unwrap();
    assert_eq!(reloaded.steps.total_steps(), snapshot.total_steps());
    assert_eq!(
        reloaded.steps.compensation_for("a"),
        snapshot.compensation_for("a")
    );
}
