//! Batched execution of behaviour workflows over the work-item ledger.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{debug, info};

use super::work_item::{WorkItem, WorkItemStatus};
use super::{BehaviourConfigEntry, BehaviourExecutionResult, BehaviourExecutionStatus, BehaviourWorkflow};
use crate::budget::ResourceBudget;
use crate::config::{RunnerConfig, WorkflowConfig};
use crate::queue::JobQueue;
use crate::store::{WorkItemStore, WorkflowStore};
use crate::{Error, Result};

/// Job name of the run job enqueued when a workflow is (re)scheduled.
/// The payload is `{"workflow_id": <id>}`.
pub const WORKFLOW_RUN_JOB: &str = "flywheel_workflow_run";

/// A work item a behaviour asks the runner to create.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    /// Deterministic key, unique within the step.
    pub item_key: String,
    /// Opaque payload for [`BehaviourHandler::execute_item`].
    pub payload: Value,
}

impl NewWorkItem {
    /// An item with an empty payload.
    pub fn new(item_key: impl Into<String>) -> Self {
        Self {
            item_key: item_key.into(),
            payload: Value::Null,
        }
    }

    /// An item carrying a payload.
    pub fn with_payload(item_key: impl Into<String>, payload: Value) -> Self {
        Self {
            item_key: item_key.into(),
            payload,
        }
    }
}

/// Executable logic for one behaviour kind.
#[async_trait]
pub trait BehaviourHandler: Send + Sync {
    /// The kind this handler is registered under.
    fn kind(&self) -> &'static str;

    /// Number of saga phases; `>= 1` gives the behaviour saga semantics
    /// (the cursor advances by phase, `cancelled` completes the saga).
    fn saga_phases(&self) -> u32 {
        0
    }

    /// Whether the behaviour processes its ledger in chunks. Only
    /// batchable behaviours fork their failed items.
    fn is_batchable(&self) -> bool {
        false
    }

    /// Chunk size when batchable. Non-batchable behaviours run one item
    /// per invocation.
    fn default_batch_size(&self) -> usize {
        1
    }

    /// Produce the work items of the current `(behaviour, phase)` step.
    ///
    /// Must be deterministic: a second call for the same step yields the
    /// same item keys, so regenerating is idempotent.
    async fn generate_work_items(
        &self,
        workflow: &BehaviourWorkflow,
        config: &BehaviourConfigEntry,
    ) -> Result<Vec<NewWorkItem>>;

    /// Execute one item. The previous step result (with its history) is
    /// available for retry-aware behaviours. An `Err` counts as a failed
    /// item with the error message recorded on the ledger row.
    async fn execute_item(
        &self,
        config: &BehaviourConfigEntry,
        item: &WorkItem,
        previous: Option<&BehaviourExecutionResult>,
        workflow: &BehaviourWorkflow,
    ) -> Result<BehaviourExecutionStatus>;
}

impl std::fmt::Debug for dyn BehaviourHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviourHandler").field("kind", &self.kind()).finish()
    }
}

/// Registry mapping behaviour kinds to their handlers.
#[derive(Default)]
pub struct BehaviourRegistry {
    handlers: HashMap<&'static str, Arc<dyn BehaviourHandler>>,
}

impl BehaviourRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Each kind registers once.
    pub fn register(&mut self, handler: Arc<dyn BehaviourHandler>) -> Result<()> {
        let kind = handler.kind();
        if self.handlers.contains_key(kind) {
            return Err(Error::DuplicateRegistration(format!("behaviour '{kind}'")));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    /// Look up a handler by kind.
    pub fn get(&self, kind: &str) -> Result<Arc<dyn BehaviourHandler>> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownBehaviour(kind.to_owned()))
    }
}

/// Map an item-level execution status onto the ledger row status.
fn map_item_status(status: BehaviourExecutionStatus) -> WorkItemStatus {
    match status {
        BehaviourExecutionStatus::Completed => WorkItemStatus::Done,
        BehaviourExecutionStatus::Waiting => WorkItemStatus::Waiting,
        BehaviourExecutionStatus::Skipped
        | BehaviourExecutionStatus::Cancelled
        | BehaviourExecutionStatus::Preempted => WorkItemStatus::Skipped,
        BehaviourExecutionStatus::Failed => WorkItemStatus::Failed,
        other => {
            if other.is_success() {
                WorkItemStatus::Done
            } else {
                WorkItemStatus::Failed
            }
        }
    }
}

/// Drives behaviour workflows through their ledgers.
///
/// Per step: ensure the ledger rows exist (generating them once,
/// deterministically), execute a chunk of pending items, resolve the
/// step result from the ledger aggregate, and let the aggregate decide
/// whether the cursor advances. Failed steps retry up to the configured
/// budget; batchable steps whose retries are exhausted fork their failed
/// items into a child workflow.
pub struct BehaviourWorkflowRunner<WS, IS, Q>
where
    WS: WorkflowStore,
    IS: WorkItemStore,
    Q: JobQueue,
{
    registry: Arc<BehaviourRegistry>,
    workflows: WS,
    items: IS,
    queue: Q,
    config: WorkflowConfig,
    runner_config: RunnerConfig,
    queue_group: String,
}

impl<WS, IS, Q> BehaviourWorkflowRunner<WS, IS, Q>
where
    WS: WorkflowStore,
    IS: WorkItemStore,
    Q: JobQueue,
{
    /// Create a runner.
    pub fn new(
        registry: Arc<BehaviourRegistry>,
        workflows: WS,
        items: IS,
        queue: Q,
        config: WorkflowConfig,
        runner_config: RunnerConfig,
    ) -> Self {
        Self {
            registry,
            workflows,
            items,
            queue,
            config,
            runner_config,
            queue_group: "flywheel-workflows".to_owned(),
        }
    }

    /// Queue group for run jobs.
    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = group.into();
        self
    }

    /// Run a command's workflows: the first runs inline, the rest are
    /// persisted and fanned out as zero-delay run jobs.
    pub async fn run(&self, workflows: Vec<BehaviourWorkflow>) -> Result<Option<BehaviourWorkflow>> {
        let mut iter = workflows.into_iter();
        let Some(first) = iter.next() else {
            return Ok(None);
        };

        for mut secondary in iter {
            if secondary.id.is_none() {
                self.workflows.save(&mut secondary).await?;
            }
            self.enqueue_run(&secondary, Duration::ZERO).await?;
        }

        Ok(Some(self.run_one(first).await?))
    }

    /// Run a workflow loaded by id (the run-job entry point). Terminal
    /// workflows are skipped silently.
    pub async fn run_by_id(&self, workflow_id: i64) -> Result<()> {
        let Some(workflow) = self.workflows.get_by_id(workflow_id).await? else {
            return Err(Error::not_found("behaviour workflow", workflow_id));
        };
        if workflow.is_terminal() {
            debug!(workflow_id, "Skipping terminal workflow");
            return Ok(());
        }
        self.run_one(workflow).await?;
        Ok(())
    }

    /// Drive one workflow until it completes, fails, waits, or yields.
    pub async fn run_one(&self, mut workflow: BehaviourWorkflow) -> Result<BehaviourWorkflow> {
        // Persist first so ledger rows can reference the workflow.
        if workflow.id.is_none() {
            self.workflows.save(&mut workflow).await?;
        }

        let budget = ResourceBudget::start(&self.runner_config);
        let mut reschedule = false;

        while !workflow.is_terminal() {
            let Some(config) = workflow.get_current().cloned() else {
                workflow.is_complete = true;
                break;
            };
            let handler = self.registry.get(&config.kind)?;
            let previous = workflow.get_current_result().cloned();

            self.ensure_work_items(&workflow, &config, handler.as_ref())
                .await?;

            let mut result = self
                .execute_with_ledger(&workflow, &config, handler.as_ref(), previous.as_ref(), &budget)
                .await?;

            let prior_failures = previous.as_ref().map_or(0, BehaviourExecutionResult::failure_count);
            let retry_pending = result.status == BehaviourExecutionStatus::Failed
                && prior_failures < self.config.max_retries;

            if result.status == BehaviourExecutionStatus::Failed && !retry_pending {
                result = self.maybe_fork(&workflow, &config, handler.as_ref(), result).await?;
            }

            let status = result.status;
            let phases = handler.saga_phases();
            workflow.maybe_advance(result, (phases >= 1).then_some(phases));

            match status {
                BehaviourExecutionStatus::Waiting => break,
                BehaviourExecutionStatus::Failed => {
                    if retry_pending || budget.exceeded() {
                        reschedule = true;
                    } else {
                        workflow.is_failed = true;
                    }
                    break;
                }
                BehaviourExecutionStatus::Batched => {
                    if budget.exceeded() {
                        reschedule = true;
                        break;
                    }
                }
                _ => {
                    if budget.exceeded() && !workflow.is_terminal() {
                        reschedule = true;
                        break;
                    }
                }
            }
        }

        self.workflows.save(&mut workflow).await?;

        if reschedule {
            self.enqueue_run(&workflow, self.config.reschedule_interval())
                .await?;
        }

        Ok(workflow)
    }

    /// Create the ledger rows for the current step when none exist yet.
    ///
    /// Generation is deterministic, and saving is an upsert by the unique
    /// key, so running this twice never duplicates rows.
    async fn ensure_work_items(
        &self,
        workflow: &BehaviourWorkflow,
        config: &BehaviourConfigEntry,
        handler: &dyn BehaviourHandler,
    ) -> Result<()> {
        let workflow_id = require_id(workflow)?;
        let existing = self
            .items
            .get_for_step(workflow_id, workflow.current_idx, workflow.current_phase)
            .await?;
        if !existing.is_empty() {
            return Ok(());
        }

        let generated = handler.generate_work_items(workflow, config).await?;
        debug!(
            workflow_id,
            behaviour = %config.kind,
            phase = workflow.current_phase,
            items = generated.len(),
            "Generated work items"
        );

        for new_item in generated {
            let mut item = WorkItem::new(
                workflow_id,
                workflow.current_idx,
                workflow.current_phase,
                new_item.item_key,
                new_item.payload,
                workflow.blog_id,
            );
            self.items.save(&mut item).await?;
        }
        Ok(())
    }

    async fn execute_with_ledger(
        &self,
        workflow: &BehaviourWorkflow,
        config: &BehaviourConfigEntry,
        handler: &dyn BehaviourHandler,
        previous: Option<&BehaviourExecutionResult>,
        budget: &ResourceBudget,
    ) -> Result<BehaviourExecutionResult> {
        let workflow_id = require_id(workflow)?;
        let list = self
            .items
            .get_for_step(workflow_id, workflow.current_idx, workflow.current_phase)
            .await?;

        let batch_size = if handler.is_batchable() {
            handler.default_batch_size().max(1)
        } else {
            1
        };

        let mut chunk_success = Vec::new();
        let mut chunk_error = Vec::new();
        let mut halted = None;

        let chunk: Vec<WorkItem> = list
            .pending()
            .into_iter()
            .take(batch_size)
            .cloned()
            .collect();

        for mut item in chunk {
            let outcome = handler
                .execute_item(config, &item, previous, workflow)
                .await;

            let (item_status, error) = match outcome {
                Ok(status) => (map_item_status(status), None),
                Err(error) => (WorkItemStatus::Failed, Some(error.to_string())),
            };

            item.status = item_status;
            item.updated_at = OffsetDateTime::now_utc();
            if item_status == WorkItemStatus::Failed {
                item.attempts += 1;
                item.last_error =
                    Some(error.unwrap_or_else(|| "behaviour reported failure".to_owned()));
                chunk_error.push(item.item_key.clone());
            } else {
                chunk_success.push(item.item_key.clone());
            }
            self.items.save(&mut item).await?;

            match item_status {
                WorkItemStatus::Waiting => {
                    halted = Some(BehaviourExecutionStatus::Waiting);
                    break;
                }
                WorkItemStatus::Failed => {
                    halted = Some(BehaviourExecutionStatus::Failed);
                    break;
                }
                _ => {}
            }
            if budget.exceeded() {
                halted = Some(BehaviourExecutionStatus::Batched);
                break;
            }
        }

        let status = match halted {
            Some(status) => status,
            None => {
                let list = self
                    .items
                    .get_for_step(workflow_id, workflow.current_idx, workflow.current_phase)
                    .await?;
                match list.aggregate_status() {
                    Some(WorkItemStatus::Pending) => BehaviourExecutionStatus::Batched,
                    Some(WorkItemStatus::Waiting) => BehaviourExecutionStatus::Waiting,
                    Some(WorkItemStatus::Failed) => BehaviourExecutionStatus::Failed,
                    // No items, all done, or all skipped: the step is done.
                    _ => BehaviourExecutionStatus::Completed,
                }
            }
        };

        let mut result =
            BehaviourExecutionResult::new(config.kind.clone(), status, workflow.current_phase);
        result.batch_success = chunk_success;
        result.batch_error = chunk_error;
        Ok(result)
    }

    /// Fork failed items into a child workflow when the step's retries
    /// are exhausted.
    ///
    /// Only batchable behaviours fork, and a fork never forks again —
    /// in both excluded cases the failed result is returned unchanged and
    /// the generic failure path applies.
    async fn maybe_fork(
        &self,
        workflow: &BehaviourWorkflow,
        config: &BehaviourConfigEntry,
        handler: &dyn BehaviourHandler,
        result: BehaviourExecutionResult,
    ) -> Result<BehaviourExecutionResult> {
        if !handler.is_batchable() || workflow.is_fork() {
            return Ok(result);
        }

        let workflow_id = require_id(workflow)?;
        let list = self
            .items
            .get_for_step(workflow_id, workflow.current_idx, workflow.current_phase)
            .await?;
        let failed_ids: Vec<i64> = list
            .failed()
            .into_iter()
            .filter_map(|item| item.id)
            .collect();
        if failed_ids.is_empty() {
            return Ok(result);
        }

        let mut child = BehaviourWorkflow::fork_from(workflow, config.clone());
        self.workflows.save(&mut child).await?;
        let child_id = require_id(&child)?;

        // Transfer by identity: the rows move to the child and reset to
        // pending, so the ledger's uniqueness key is preserved.
        self.items.transfer(&failed_ids, child_id).await?;
        self.enqueue_run(&child, self.config.fork_delay()).await?;

        info!(
            parent_id = workflow_id,
            child_id,
            behaviour = %config.kind,
            items = failed_ids.len(),
            "Forked failed items into child workflow"
        );

        let mut forked = result;
        forked.status = BehaviourExecutionStatus::Forked;
        forked.success = true;
        forked
            .context
            .insert("forked_workflow_id".to_owned(), json!(child_id));
        Ok(forked)
    }

    async fn enqueue_run(&self, workflow: &BehaviourWorkflow, delay: Duration) -> Result<()> {
        let workflow_id = require_id(workflow)?;
        let payload = json!({"workflow_id": workflow_id});

        if delay.is_zero() {
            self.queue
                .enqueue(WORKFLOW_RUN_JOB, payload, &self.queue_group)
                .await
        } else {
            let run_at = OffsetDateTime::now_utc() + delay;
            self.queue
                .enqueue_at(run_at, WORKFLOW_RUN_JOB, payload, &self.queue_group)
                .await
        }
    }
}

fn require_id(workflow: &BehaviourWorkflow) -> Result<i64> {
    workflow
        .id
        .ok_or_else(|| Error::Invariant("workflow used before first save".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_status_mapping() {
        assert_eq!(
            map_item_status(BehaviourExecutionStatus::Completed),
            WorkItemStatus::Done
        );
        assert_eq!(
            map_item_status(BehaviourExecutionStatus::Waiting),
            WorkItemStatus::Waiting
        );
        assert_eq!(
            map_item_status(BehaviourExecutionStatus::Failed),
            WorkItemStatus::Failed
        );
        for status in [
            BehaviourExecutionStatus::Skipped,
            BehaviourExecutionStatus::Cancelled,
            BehaviourExecutionStatus::Preempted,
        ] {
            assert_eq!(map_item_status(status), WorkItemStatus::Skipped);
        }
        assert_eq!(
            map_item_status(BehaviourExecutionStatus::Batched),
            WorkItemStatus::Done
        );
    }

    #[test]
    fn registry_rejects_duplicates() {
        struct Noop;

        #[async_trait]
        impl BehaviourHandler for Noop {
            fn kind(&self) -> &'static str {
                "noop"
            }

            async fn generate_work_items(
                &self,
                _workflow: &BehaviourWorkflow,
                _config: &BehaviourConfigEntry,
            ) -> Result<Vec<NewWorkItem>> {
                Ok(vec![])
            }

            async fn execute_item(
                &self,
                _config: &BehaviourConfigEntry,
                _item: &WorkItem,
                _previous: Option<&BehaviourExecutionResult>,
                _workflow: &BehaviourWorkflow,
            ) -> Result<BehaviourExecutionStatus> {
                Ok(BehaviourExecutionStatus::Completed)
            }
        }

        let mut registry = BehaviourRegistry::new();
        registry.register(Arc::new(Noop)).unwrap();
        assert!(matches!(
            registry.register(Arc::new(Noop)).unwrap_err(),
            Error::DuplicateRegistration(_)
        ));
        assert!(registry.get("noop").is_ok());
        assert!(matches!(
            registry.get("other").unwrap_err(),
            Error::UnknownBehaviour(_)
        ));
    }
}
