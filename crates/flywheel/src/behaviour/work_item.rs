//! The work-item ledger: per-item progress within a behaviour step.

use serde_json::Value;
use time::OffsetDateTime;

use crate::{Error, Result};

/// Progress status of one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemStatus {
    /// Not yet executed.
    Pending,
    /// Blocked on an external signal.
    Waiting,
    /// Execution failed.
    Failed,
    /// Executed successfully.
    Done,
    /// Deliberately not executed.
    Skipped,
}

impl WorkItemStatus {
    /// Database string representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Failed => "failed",
            Self::Done => "done",
            Self::Skipped => "skipped",
        }
    }

    /// Parse from the database string representation.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "waiting" => Ok(Self::Waiting),
            "failed" => Ok(Self::Failed),
            "done" => Ok(Self::Done),
            "skipped" => Ok(Self::Skipped),
            _ => Err(Error::Invariant(format!("invalid work item status: {s}"))),
        }
    }
}

/// One unit of batched work within a behaviour step.
///
/// Items are keyed by `(workflow_id, behaviour_idx, phase, item_key)`;
/// the key is unique within the ledger. On fork the *same row* is
/// transferred to the child workflow — identity survives, ownership
/// changes.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Row id; `None` until first saved.
    pub id: Option<i64>,
    /// Owning workflow.
    pub workflow_id: i64,
    /// Behaviour index within the workflow.
    pub behaviour_idx: usize,
    /// Saga phase the item belongs to (1-based).
    pub phase: u32,
    /// Deterministic item key, unique within the step.
    pub item_key: String,
    /// Progress status.
    pub status: WorkItemStatus,
    /// Execution attempts so far.
    pub attempts: u32,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Opaque payload the behaviour generated for this item.
    pub payload: Value,
    /// Tenant scope.
    pub blog_id: i64,
    /// Row creation time.
    pub created_at: OffsetDateTime,
    /// Last persistence time.
    pub updated_at: OffsetDateTime,
}

impl WorkItem {
    /// Create an unsaved pending item.
    pub fn new(
        workflow_id: i64,
        behaviour_idx: usize,
        phase: u32,
        item_key: impl Into<String>,
        payload: Value,
        blog_id: i64,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: None,
            workflow_id,
            behaviour_idx,
            phase,
            item_key: item_key.into(),
            status: WorkItemStatus::Pending,
            attempts: 0,
            last_error: None,
            payload,
            blog_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The items of one `(workflow, behaviour, phase)` step, with status
/// filters and the aggregate used to resolve the step result.
#[derive(Debug, Clone, Default)]
pub struct WorkItemList {
    items: Vec<WorkItem>,
}

impl WorkItemList {
    /// Wrap a list of items.
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self { items }
    }

    /// All items.
    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    /// Whether the list holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Items still pending.
    pub fn pending(&self) -> Vec<&WorkItem> {
        self.by_status(WorkItemStatus::Pending)
    }

    /// Items blocked on an external signal.
    pub fn waiting(&self) -> Vec<&WorkItem> {
        self.by_status(WorkItemStatus::Waiting)
    }

    /// Items that failed.
    pub fn failed(&self) -> Vec<&WorkItem> {
        self.by_status(WorkItemStatus::Failed)
    }

    /// Items done.
    pub fn done(&self) -> Vec<&WorkItem> {
        self.by_status(WorkItemStatus::Done)
    }

    /// The first `n` items of a filtered view.
    pub fn take(items: Vec<&WorkItem>, n: usize) -> Vec<&WorkItem> {
        items.into_iter().take(n).collect()
    }

    /// The status that summarizes the whole step, by priority
    /// `pending > waiting > failed > done`. Skipped items never dominate;
    /// a list of only skipped items reads as done. Empty lists have no
    /// aggregate.
    pub fn aggregate_status(&self) -> Option<WorkItemStatus> {
        if self.items.is_empty() {
            return None;
        }
        for status in [
            WorkItemStatus::Pending,
            WorkItemStatus::Waiting,
            WorkItemStatus::Failed,
        ] {
            if self.items.iter().any(|item| item.status == status) {
                return Some(status);
            }
        }
        Some(WorkItemStatus::Done)
    }

    fn by_status(&self, status: WorkItemStatus) -> Vec<&WorkItem> {
        self.items
            .iter()
            .filter(|item| item.status == status)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(key: &str, status: WorkItemStatus) -> WorkItem {
        let mut item = WorkItem::new(1, 0, 1, key, json!({}), 0);
        item.status = status;
        item
    }

    #[test]
    fn status_round_trip() {
        for status in [
            WorkItemStatus::Pending,
            WorkItemStatus::Waiting,
            WorkItemStatus::Failed,
            WorkItemStatus::Done,
            WorkItemStatus::Skipped,
        ] {
            assert_eq!(WorkItemStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(WorkItemStatus::parse("nope").is_err());
    }

    #[test]
    fn filters_partition_by_status() {
        let list = WorkItemList::new(vec![
            item("a", WorkItemStatus::Pending),
            item("b", WorkItemStatus::Done),
            item("c", WorkItemStatus::Failed),
            item("d", WorkItemStatus::Pending),
        ]);

        assert_eq!(list.pending().len(), 2);
        assert_eq!(list.done().len(), 1);
        assert_eq!(list.failed().len(), 1);
        assert_eq!(list.waiting().len(), 0);
    }

    #[test]
    fn take_limits_a_filtered_view() {
        let list = WorkItemList::new(vec![
            item("a", WorkItemStatus::Pending),
            item("b", WorkItemStatus::Pending),
            item("c", WorkItemStatus::Pending),
        ]);

        let chunk = WorkItemList::take(list.pending(), 2);
        assert_eq!(chunk.len(), 2);
        assert_eq!(chunk[0].item_key, "a");
    }

    #[test]
    fn aggregate_priority_pending_over_waiting_over_failed_over_done() {
        let list = WorkItemList::new(vec![
            item("a", WorkItemStatus::Done),
            item("b", WorkItemStatus::Failed),
            item("c", WorkItemStatus::Waiting),
            item("d", WorkItemStatus::Pending),
        ]);
        assert_eq!(list.aggregate_status(), Some(WorkItemStatus::Pending));

        let list = WorkItemList::new(vec![
            item("a", WorkItemStatus::Done),
            item("b", WorkItemStatus::Failed),
            item("c", WorkItemStatus::Waiting),
        ]);
        assert_eq!(list.aggregate_status(), Some(WorkItemStatus::Waiting));

        let list = WorkItemList::new(vec![
            item("a", WorkItemStatus::Done),
            item("b", WorkItemStatus::Failed),
        ]);
        assert_eq!(list.aggregate_status(), Some(WorkItemStatus::Failed));

        let list = WorkItemList::new(vec![item("a", WorkItemStatus::Done)]);
        assert_eq!(list.aggregate_status(), Some(WorkItemStatus::Done));
    }

    #[test]
    fn skipped_items_read_as_done() {
        let list = WorkItemList::new(vec![
            item("a", WorkItemStatus::Skipped),
            item("b", WorkItemStatus::Done),
        ]);
        assert_eq!(list.aggregate_status(), Some(WorkItemStatus::Done));
    }

    #[test]
    fn empty_list_has_no_aggregate() {
        assert_eq!(WorkItemList::default().aggregate_status(), None);
    }
}
