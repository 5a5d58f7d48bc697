//! Storage seams and backends.
//!
//! The engines talk to storage through narrow traits — one per concern —
//! so they run unchanged over the production PostgreSQL backend
//! ([`PgStore`]) and the in-process backend ([`MemoryStore`]) used by
//! tests and embedded deployments.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use std::future::Future;

pub use memory::{MemoryStore, MemoryTxn};
#[cfg(feature = "postgres")]
pub use postgres::{PgStore, PgTxn};

use crate::behaviour::work_item::{WorkItem, WorkItemList};
use crate::behaviour::BehaviourWorkflow;
use crate::process::ProcessRecord;
use crate::Result;

/// Persistence for long processes.
pub trait ProcessStore: Send + Sync + Clone + 'static {
    /// Insert or update; assigns `record.id` on first save.
    fn save(&self, record: &mut ProcessRecord) -> impl Future<Output = Result<()>> + Send;

    /// Look up by id.
    fn find(&self, id: i64) -> impl Future<Output = Result<Option<ProcessRecord>>> + Send;

    /// Suspended processes waiting for the given event name.
    fn find_waiting_for(
        &self,
        event_type: &str,
    ) -> impl Future<Output = Result<Vec<ProcessRecord>>> + Send;

    /// Delete a process row.
    fn delete(&self, id: i64) -> impl Future<Output = Result<()>> + Send;
}

/// Persistence for behaviour workflows.
pub trait WorkflowStore: Send + Sync + Clone + 'static {
    /// Insert or update; assigns `workflow.id` on first save.
    fn save(&self, workflow: &mut BehaviourWorkflow) -> impl Future<Output = Result<()>> + Send;

    /// Look up by id.
    fn get_by_id(
        &self,
        id: i64,
    ) -> impl Future<Output = Result<Option<BehaviourWorkflow>>> + Send;

    /// All workflows about one business object.
    fn get_by_ref(
        &self,
        ref_id: &str,
        ref_type: &str,
    ) -> impl Future<Output = Result<Vec<BehaviourWorkflow>>> + Send;
}

/// Persistence for the work-item ledger.
pub trait WorkItemStore: Send + Sync + Clone + 'static {
    /// Look up by row id.
    fn get_by_id(&self, id: i64) -> impl Future<Output = Result<Option<WorkItem>>> + Send;

    /// Look up by the ledger's uniqueness key.
    fn find_by_unique(
        &self,
        workflow_id: i64,
        behaviour_idx: usize,
        phase: u32,
        item_key: &str,
    ) -> impl Future<Output = Result<Option<WorkItem>>> + Send;

    /// The items of one `(workflow, behaviour, phase)` step.
    fn get_for_step(
        &self,
        workflow_id: i64,
        behaviour_idx: usize,
        phase: u32,
    ) -> impl Future<Output = Result<WorkItemList>> + Send;

    /// Insert or update by the uniqueness key.
    ///
    /// A generated item whose key already exists updates the existing row
    /// in place (keeping its id) instead of duplicating it.
    fn save(&self, item: &mut WorkItem) -> impl Future<Output = Result<()>> + Send;

    /// Move items to another workflow by identity: update `workflow_id`,
    /// reset status to pending, clear attempts and the last error.
    fn transfer(
        &self,
        item_ids: &[i64],
        to_workflow_id: i64,
    ) -> impl Future<Output = Result<()>> + Send;
}
