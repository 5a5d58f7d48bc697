//! The long-process runner: forward execution, compensation, resume.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::definition::{CommandEnvelope, ProcessRegistry, StepContext};
use super::{ProcessRecord, ProcessStatus};
use crate::budget::ResourceBudget;
use crate::config::RunnerConfig;
use crate::event::EventEnvelope;
use crate::queue::JobQueue;
use crate::store::ProcessStore;
use crate::{Error, Result};

/// Job name of the continuation job enqueued when a process reschedules.
/// The payload is `{"process_id": <id>}` plus the correlation envelope.
pub const PROCESS_CONTINUE_JOB: &str = "flywheel_process_continue";

/// Dispatches the fire-and-forget commands a step hands back.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Dispatch one command, carrying the process correlation.
    async fn dispatch(&self, command: CommandEnvelope, correlation_id: Uuid) -> Result<()>;
}

/// Sink that drops every command. For processes without side commands.
pub struct NullCommandSink;

#[async_trait]
impl CommandSink for NullCommandSink {
    async fn dispatch(&self, _command: CommandEnvelope, _correlation_id: Uuid) -> Result<()> {
        Ok(())
    }
}

/// Arguments for starting a new process instance.
#[derive(Debug, Clone)]
pub struct NewProcess {
    /// The registered process type.
    pub process_type: String,
    /// Constructor arguments made available to every step.
    pub business_data: Value,
    /// Correlation to join; a fresh id is generated when absent.
    pub correlation_id: Option<Uuid>,
    /// Tenant scope.
    pub blog_id: i64,
}

impl NewProcess {
    /// A process with the given type and data in the default tenant.
    pub fn new(process_type: impl Into<String>, business_data: Value) -> Self {
        Self {
            process_type: process_type.into(),
            business_data,
            correlation_id: None,
            blog_id: 0,
        }
    }
}

/// The saga engine.
///
/// Three entry points — [`start`](Self::start),
/// [`continue_scheduled`](Self::continue_scheduled), and
/// [`resume_on_event`](Self::resume_on_event) — all route into one run
/// loop that executes forward steps or, once a step has failed,
/// compensations in reverse order. A process is single-threaded with
/// respect to itself: only `suspended` processes are matched by events
/// and only `scheduled` ones are picked up by continuation jobs.
pub struct ProcessRunner<S, Q>
where
    S: ProcessStore,
    Q: JobQueue,
{
    registry: Arc<ProcessRegistry>,
    store: S,
    queue: Q,
    commands: Arc<dyn CommandSink>,
    config: RunnerConfig,
    queue_group: String,
}

impl<S, Q> ProcessRunner<S, Q>
where
    S: ProcessStore,
    Q: JobQueue,
{
    /// Create a runner without a command sink.
    pub fn new(registry: Arc<ProcessRegistry>, store: S, queue: Q, config: RunnerConfig) -> Self {
        Self {
            registry,
            store,
            queue,
            commands: Arc::new(NullCommandSink),
            config,
            queue_group: "flywheel-processes".to_owned(),
        }
    }

    /// Attach a sink for step commands.
    pub fn with_commands(mut self, commands: Arc<dyn CommandSink>) -> Self {
        self.commands = commands;
        self
    }

    /// Queue group for continuation jobs.
    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = group.into();
        self
    }

    /// Start a new process: freeze the step schema, persist, and run.
    pub async fn start(&self, new: NewProcess) -> Result<ProcessRecord> {
        let definition = self.registry.get(&new.process_type)?;
        let correlation_id = new.correlation_id.unwrap_or_else(Uuid::new_v4);

        let mut record = ProcessRecord::new(
            new.process_type,
            new.business_data,
            definition.snapshot(),
            correlation_id,
            new.blog_id,
        );
        self.store.save(&mut record).await?;

        info!(
            process_type = %record.process_type,
            process_id = record.id,
            correlation_id = %correlation_id,
            "Long process started"
        );

        self.run(&mut record, None).await?;
        Ok(record)
    }

    /// Resume a process from its continuation job.
    ///
    /// Processes already in a terminal state are skipped silently, so a
    /// duplicated job delivery is harmless.
    pub async fn continue_scheduled(&self, process_id: i64) -> Result<()> {
        let Some(mut record) = self.store.find(process_id).await? else {
            return Err(Error::not_found("long process", process_id));
        };

        if record.status.is_terminal() {
            debug!(process_id, status = record.status.as_str(), "Skipping terminal process");
            return Ok(());
        }

        self.run(&mut record, None).await
    }

    /// Wake the first suspended process waiting for this event.
    ///
    /// Candidates are processes with `status = suspended` and
    /// `waiting_for` equal to the event name; the match criteria are
    /// evaluated as strict equality per field. Only one process resumes
    /// per event — fan-out is deliberately not offered.
    pub async fn resume_on_event(&self, event: &EventEnvelope) -> Result<Option<i64>> {
        let candidates = self.store.find_waiting_for(&event.name).await?;

        for mut record in candidates {
            if !matches_criteria(record.match_criteria.as_ref(), &event.fields) {
                continue;
            }

            let process_id = record.id;
            info!(
                process_id,
                process_type = %record.process_type,
                event = %event.name,
                "Resuming suspended process"
            );

            // The awaiting step has now completed.
            if record.steps.is_compensating() {
                record.steps.advance_undo();
            } else {
                record.steps.advance();
            }
            record.status = ProcessStatus::Running;
            record.waiting_for = None;
            record.match_criteria = None;
            self.store.save(&mut record).await?;

            self.run(&mut record, Some(event.clone())).await?;
            return Ok(process_id);
        }

        Ok(None)
    }

    async fn run(
        &self,
        record: &mut ProcessRecord,
        resume_event: Option<EventEnvelope>,
    ) -> Result<()> {
        let definition = self.registry.get(&record.process_type)?;
        let budget = ResourceBudget::start(&self.config);
        // A step marked async only runs under a queue worker; arriving
        // through the scheduler is what grants that.
        let allow_async = record.status == ProcessStatus::Scheduled;

        if record.steps.is_compensating() {
            self.execute_compensation(&definition, record, &budget, allow_async)
                .await
        } else {
            self.execute_forward(&definition, record, resume_event, &budget, allow_async)
                .await
        }
    }

    async fn execute_forward(
        &self,
        definition: &super::ProcessDefinition,
        record: &mut ProcessRecord,
        mut resume_event: Option<EventEnvelope>,
        budget: &ResourceBudget,
        mut allow_async: bool,
    ) -> Result<()> {
        while !record.steps.is_complete() {
            let step_name = record
                .steps
                .current_step()
                .ok_or_else(|| Error::Invariant("forward cursor past the schema".into()))?
                .to_owned();
            let step = definition.step(&step_name).ok_or_else(|| {
                Error::IncorrectUsage(format!(
                    "step '{step_name}' is missing from process '{}'; \
                     a changed step list requires a new process type",
                    record.process_type
                ))
            })?;

            if step.is_async && !allow_async {
                return self.schedule_continuation(record).await;
            }

            let ctx = StepContext {
                data: record.business_data.clone(),
                payload: record.payload.clone(),
                event: resume_event.take(),
                checkpoint: None,
                cause: None,
                correlation_id: record.correlation_id,
            };

            let outcome = match (step.run)(ctx).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    let message = error.to_string();
                    warn!(
                        process_id = record.id,
                        step = %step_name,
                        error = %message,
                        "Forward step failed, starting compensation"
                    );
                    record.steps.begin_undo(message.clone());
                    record.last_error = Some(message);
                    self.store.save(record).await?;
                    return self
                        .execute_compensation(definition, record, budget, false)
                        .await;
                }
            };
            allow_async = false;

            self.dispatch_commands(outcome.commands, record.correlation_id)
                .await;

            if let Some(await_event) = outcome.await_event {
                return self
                    .suspend_for_event(record, await_event, outcome.payload)
                    .await;
            }

            if let Some(checkpoint) = outcome.checkpoint {
                record.steps.record_checkpoint(&step_name, checkpoint);
            }
            record.steps.advance();
            record.status = ProcessStatus::Running;
            if let Some(payload) = outcome.payload {
                record.payload = Some(payload);
            }
            self.store.save(record).await?;

            if !record.steps.is_complete() && budget.exceeded() {
                return self.schedule_continuation(record).await;
            }
        }

        record.status = ProcessStatus::Completed;
        self.store.save(record).await?;
        info!(process_id = record.id, process_type = %record.process_type, "Long process completed");
        Ok(())
    }

    async fn execute_compensation(
        &self,
        definition: &super::ProcessDefinition,
        record: &mut ProcessRecord,
        budget: &ResourceBudget,
        mut allow_async: bool,
    ) -> Result<()> {
        while record.steps.undo_index() >= 0 {
            let step_name = record
                .steps
                .current_undo_step()
                .ok_or_else(|| Error::Invariant("undo cursor past the schema".into()))?
                .to_owned();

            if record.steps.compensation_for(&step_name).is_none() {
                record.steps.advance_undo();
                self.store.save(record).await?;
                continue;
            }

            let compensation = definition.compensation(&step_name).ok_or_else(|| {
                Error::IncorrectUsage(format!(
                    "compensation for step '{step_name}' is missing from process '{}'",
                    record.process_type
                ))
            })?;

            if compensation.is_async && !allow_async {
                return self.schedule_continuation(record).await;
            }

            let ctx = StepContext {
                data: record.business_data.clone(),
                payload: record.payload.clone(),
                event: None,
                checkpoint: record.steps.checkpoint_for(&step_name).cloned(),
                cause: record.steps.failure_msg().map(str::to_owned),
                correlation_id: record.correlation_id,
            };

            let outcome = match (compensation.run)(ctx).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    let message = format!("Compensation failed: {error}");
                    warn!(
                        process_id = record.id,
                        step = %step_name,
                        error = %error,
                        "Compensation step failed, process is stuck"
                    );
                    record.status = ProcessStatus::Failed;
                    record.last_error = Some(message.clone());
                    self.store.save(record).await?;
                    return Err(Error::CompensationFailed {
                        step: step_name,
                        message,
                    });
                }
            };
            allow_async = false;

            self.dispatch_commands(outcome.commands, record.correlation_id)
                .await;

            if let Some(await_event) = outcome.await_event {
                return self
                    .suspend_for_event(record, await_event, outcome.payload)
                    .await;
            }

            if let Some(payload) = outcome.payload {
                record.payload = Some(payload);
            }
            record.steps.advance_undo();
            self.store.save(record).await?;

            if record.steps.undo_index() >= 0 && budget.exceeded() {
                return self.schedule_continuation(record).await;
            }
        }

        record.steps.finish_undo();
        record.status = ProcessStatus::Failed;
        if record.last_error.is_none() {
            record.last_error = record.steps.failure_msg().map(str::to_owned);
        }
        self.store.save(record).await?;
        info!(
            process_id = record.id,
            process_type = %record.process_type,
            "Long process failed after compensation"
        );
        Ok(())
    }

    async fn suspend_for_event(
        &self,
        record: &mut ProcessRecord,
        await_event: super::AwaitEvent,
        payload: Option<Value>,
    ) -> Result<()> {
        debug!(
            process_id = record.id,
            waiting_for = %await_event.event_type,
            "Process suspended on event"
        );
        record.status = ProcessStatus::Suspended;
        record.waiting_for = Some(await_event.event_type);
        record.match_criteria = Some(Value::Object(await_event.match_criteria));
        if let Some(payload) = payload {
            record.payload = Some(payload);
        }
        self.store.save(record).await
    }

    async fn schedule_continuation(&self, record: &mut ProcessRecord) -> Result<()> {
        record.status = ProcessStatus::Scheduled;
        self.store.save(record).await?;

        let process_id = record
            .id
            .ok_or_else(|| Error::Invariant("scheduling an unsaved process".into()))?;
        let payload = json!({
            "process_id": process_id,
            (crate::correlation::CORRELATION_ID_KEY): record.correlation_id.to_string(),
        });

        debug!(process_id, "Process continuation enqueued");
        self.queue
            .enqueue(PROCESS_CONTINUE_JOB, payload, &self.queue_group)
            .await
    }

    async fn dispatch_commands(&self, commands: Vec<CommandEnvelope>, correlation_id: Uuid) {
        for command in commands {
            let name = command.name.clone();
            if let Err(error) = self.commands.dispatch(command, correlation_id).await {
                // Step commands are fire-and-forget; a sink failure must
                // not unwind the process.
                warn!(command = %name, error = %error, "Step command dispatch failed");
            }
        }
    }
}

/// Strict per-field equality of the stored criteria against event fields.
///
/// Empty or absent criteria match every event of the awaited type.
fn matches_criteria(criteria: Option<&Value>, fields: &Map<String, Value>) -> bool {
    match criteria {
        None | Some(Value::Null) => true,
        Some(Value::Object(criteria)) => criteria
            .iter()
            .all(|(key, expected)| fields.get(key) == Some(expected)),
        Some(_) => false,
    }
}
