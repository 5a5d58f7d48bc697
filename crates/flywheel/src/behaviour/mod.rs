//! Behaviour workflows: a cursor over configurable behaviours.
//!
//! A [`BehaviourWorkflow`] iterates an ordered list of behaviour configs
//! about one business object. Each behaviour may be batched across many
//! work items (tracked in the ledger, [`work_item`]) and may span several
//! saga phases. Failed items of a batchable behaviour can be *forked*
//! into a child workflow that owns them from then on.

mod runner;
pub mod work_item;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

pub use runner::{BehaviourHandler, BehaviourRegistry, BehaviourWorkflowRunner, NewWorkItem, WORKFLOW_RUN_JOB};

/// Outcome classification of one behaviour step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviourExecutionStatus {
    /// Step finished; the cursor advances.
    Completed,
    /// More work remains in the ledger; the cursor stays, the runner
    /// reschedules.
    Batched,
    /// Failed items were spun off to a child workflow; the parent treats
    /// this as progress.
    Forked,
    /// An external signal is required; the cursor stays and nothing is
    /// rescheduled.
    Waiting,
    /// Advance without effect.
    Skipped,
    /// The step failed; the cursor stays. The runner may retry up to the
    /// configured budget based on the result history.
    Failed,
    /// Strong skip; inside a saga this completes the whole saga.
    Cancelled,
    /// Handed off to another workflow or attempt; advances.
    Preempted,
}

impl BehaviourExecutionStatus {
    /// Whether the status counts as success for the audit flag.
    pub const fn is_success(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// The recorded outcome of executing one behaviour step.
///
/// Results are immutable; a re-execution produces a *follow-up* result
/// whose history starts with the superseded one. Histories are flat —
/// an entry inside `history` never carries its own history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviourExecutionResult {
    /// The behaviour kind that produced the result.
    pub kind: String,
    /// Success flag for the audit trail.
    pub success: bool,
    /// Free-form context captured by the behaviour.
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Outcome classification.
    pub status: BehaviourExecutionStatus,
    /// When the result was produced.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// The saga phase the result belongs to (1-based).
    pub phase: u32,
    /// Prior results for the same step, newest first. Entries carry empty
    /// histories.
    #[serde(default)]
    pub history: Vec<BehaviourExecutionResult>,
    /// Item keys that succeeded in the last chunk (audit only).
    #[serde(default)]
    pub batch_success: Vec<String>,
    /// Item keys that failed in the last chunk (audit only).
    #[serde(default)]
    pub batch_error: Vec<String>,
}

impl BehaviourExecutionResult {
    /// A result for the given behaviour kind, status, and phase.
    pub fn new(kind: impl Into<String>, status: BehaviourExecutionStatus, phase: u32) -> Self {
        Self {
            kind: kind.into(),
            success: status.is_success(),
            context: Map::new(),
            status,
            timestamp: OffsetDateTime::now_utc(),
            phase,
            history: Vec::new(),
            batch_success: Vec::new(),
            batch_error: Vec::new(),
        }
    }

    /// Attach a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Produce the follow-up of this result.
    ///
    /// The returned result takes its leading fields from `next`; its
    /// history is this result (flattened) followed by this result's
    /// history, so history length grows by exactly one.
    pub fn follow_up(&self, mut next: BehaviourExecutionResult) -> BehaviourExecutionResult {
        let mut head = self.clone();
        head.history.clear();

        let mut history = Vec::with_capacity(self.history.len() + 1);
        history.push(head);
        history.extend(self.history.iter().cloned());

        next.history = history;
        next
    }

    /// Number of failed results among this one and its history.
    pub fn failure_count(&self) -> u32 {
        let own = u32::from(self.status == BehaviourExecutionStatus::Failed);
        own + self
            .history
            .iter()
            .filter(|r| r.status == BehaviourExecutionStatus::Failed)
            .count() as u32
    }
}

/// One behaviour config: a registered kind plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviourConfigEntry {
    /// The registered behaviour kind.
    pub kind: String,
    /// Behaviour-specific parameters.
    #[serde(default)]
    pub params: Value,
}

impl BehaviourConfigEntry {
    /// A config with no parameters.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Value::Null,
        }
    }

    /// A config with parameters.
    pub fn with_params(kind: impl Into<String>, params: Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }
}

/// The behaviour workflow aggregate: a cursor over behaviour configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviourWorkflow {
    /// Row id; `None` until first saved.
    pub id: Option<i64>,
    /// Id of the business object the workflow is about.
    pub ref_id: String,
    /// Type of the business object.
    pub ref_type: String,
    /// Set iff this workflow is a fork of another.
    pub root_workflow_id: Option<i64>,
    /// The ordered behaviour configs.
    pub behaviour_configs: Vec<BehaviourConfigEntry>,
    /// Results parallel to the configs.
    pub behaviour_results: Vec<Option<BehaviourExecutionResult>>,
    /// Cursor over the configs.
    pub current_idx: usize,
    /// Phase within a saga behaviour, 1-based.
    pub current_phase: u32,
    /// Terminal success flag.
    pub is_complete: bool,
    /// Terminal failure flag.
    pub is_failed: bool,
    /// Free-form metadata, copied to forks.
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    /// Tenant scope.
    pub blog_id: i64,
    /// Row creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Last persistence time.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl BehaviourWorkflow {
    /// Create an unsaved workflow over the given configs.
    pub fn new(
        ref_id: impl Into<String>,
        ref_type: impl Into<String>,
        behaviour_configs: Vec<BehaviourConfigEntry>,
        blog_id: i64,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        let results = vec![None; behaviour_configs.len()];
        Self {
            id: None,
            ref_id: ref_id.into(),
            ref_type: ref_type.into(),
            root_workflow_id: None,
            behaviour_configs,
            behaviour_results: results,
            current_idx: 0,
            current_phase: 1,
            is_complete: false,
            is_failed: false,
            meta: BTreeMap::new(),
            blog_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a fork: a child workflow about the same business object,
    /// with exactly one behaviour config and `root_workflow_id` pointing
    /// at the parent.
    pub fn fork_from(parent: &BehaviourWorkflow, config: BehaviourConfigEntry) -> Self {
        let mut child = Self::new(
            parent.ref_id.clone(),
            parent.ref_type.clone(),
            vec![config],
            parent.blog_id,
        );
        child.root_workflow_id = parent.id;
        child.meta = parent.meta.clone();
        child
    }

    /// Whether this workflow is a fork.
    pub fn is_fork(&self) -> bool {
        self.root_workflow_id.is_some()
    }

    /// Whether the workflow reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.is_complete || self.is_failed
    }

    /// The config the cursor points at.
    pub fn get_current(&self) -> Option<&BehaviourConfigEntry> {
        self.behaviour_configs.get(self.current_idx)
    }

    /// The recorded result for the current step, if any.
    pub fn get_current_result(&self) -> Option<&BehaviourExecutionResult> {
        self.behaviour_results
            .get(self.current_idx)
            .and_then(Option::as_ref)
    }

    /// Record a step result and advance the cursor where the status
    /// taxonomy allows it.
    ///
    /// When a previous result exists for the step, the new result becomes
    /// its follow-up so the history is preserved. A `failed` result never
    /// advances. Saga behaviours (`saga_phases >= 1`) advance by phase;
    /// `cancelled` completes the saga immediately. Non-saga behaviours
    /// advance on everything except `batched` and `waiting`. Reaching the
    /// end of the configs marks the workflow complete.
    pub fn maybe_advance(
        &mut self,
        result: BehaviourExecutionResult,
        saga_phases: Option<u32>,
    ) {
        let merged = match self.get_current_result() {
            Some(previous) => previous.follow_up(result),
            None => result,
        };
        let status = merged.status;

        if let Some(slot) = self.behaviour_results.get_mut(self.current_idx) {
            *slot = Some(merged);
        }

        if status == BehaviourExecutionStatus::Failed {
            return;
        }

        match saga_phases {
            Some(phases) if phases >= 1 => {
                if status == BehaviourExecutionStatus::Cancelled {
                    self.complete_saga();
                } else if !matches!(
                    status,
                    BehaviourExecutionStatus::Batched | BehaviourExecutionStatus::Waiting
                ) {
                    self.current_phase += 1;
                    if self.current_phase > phases {
                        self.complete_saga();
                    }
                }
            }
            _ => {
                if !matches!(
                    status,
                    BehaviourExecutionStatus::Batched | BehaviourExecutionStatus::Waiting
                ) {
                    self.current_idx += 1;
                    self.current_phase = 1;
                }
            }
        }

        if self.current_idx >= self.behaviour_configs.len() {
            self.is_complete = true;
        }
    }

    fn complete_saga(&mut self) {
        self.current_idx += 1;
        self.current_phase = 1;
    }
}
