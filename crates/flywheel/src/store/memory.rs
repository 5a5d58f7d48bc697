//! In-process storage backend.
//!
//! Implements every storage seam over a shared, mutex-guarded state.
//! Used by the test suite and by embedded deployments that do not need
//! durability; the semantics mirror the PostgreSQL backend, including
//! the worker-id guard on failure updates and transfer-by-identity.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{ProcessStore, WorkItemStore, WorkflowStore};
use crate::behaviour::work_item::{WorkItem, WorkItemList, WorkItemStatus};
use crate::behaviour::BehaviourWorkflow;
use crate::bus::{AuditSink, CommandAudit, CommandStore, CommandTxn};
use crate::lock::LockStore;
use crate::outbox::{
    DlqEntry, NewOutboxEntry, OutboxEntry, OutboxStats, OutboxStatus, OutboxStore, OutboxWriter,
};
use crate::process::{ProcessRecord, ProcessStatus};
use crate::Result;

#[derive(Default)]
struct State {
    outbox: Vec<OutboxEntry>,
    dlq: Vec<DlqEntry>,
    processes: Vec<ProcessRecord>,
    workflows: Vec<BehaviourWorkflow>,
    items: Vec<WorkItem>,
    audits: Vec<CommandAudit>,
    locks: std::collections::HashMap<String, OffsetDateTime>,
    next_outbox_id: i64,
    next_dlq_id: i64,
    next_process_id: i64,
    next_workflow_id: i64,
    next_item_id: i64,
}

/// Shared in-memory backend. Cloning shares the state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Recover rather than poison-cascade: the state is plain data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of all outbox rows, for assertions.
    pub fn outbox_snapshot(&self) -> Vec<OutboxEntry> {
        self.lock().outbox.clone()
    }

    /// Snapshot of all audit rows, for assertions.
    pub fn audit_snapshot(&self) -> Vec<CommandAudit> {
        self.lock().audits.clone()
    }

    /// Snapshot of all ledger rows, for assertions.
    pub fn item_snapshot(&self) -> Vec<WorkItem> {
        self.lock().items.clone()
    }

    fn insert_entry(state: &mut State, new: NewOutboxEntry, event_id: Uuid) -> Result<Uuid> {
        let now = OffsetDateTime::now_utc();
        state.next_outbox_id += 1;
        let payload_bytes = serde_json::to_string(&new.payload)?.len() as i64;

        state.outbox.push(OutboxEntry {
            id: state.next_outbox_id,
            event_id,
            event_type: new.event_type,
            integration_action: new.integration_action,
            message_kind: new.message_kind,
            transport: new.transport,
            queue: new.queue,
            payload_bytes,
            correlation_id: new.correlation_id,
            sequence: new.sequence,
            command_id: new.command_id,
            payload: new.payload,
            delay_seconds: new.delay_seconds,
            scheduled_at: now + Duration::from_secs(new.delay_seconds.max(0) as u64),
            is_unique: new.is_unique,
            status: OutboxStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts,
            next_attempt_at: None,
            locked_until: None,
            locked_by: None,
            last_error: None,
            error_history: json!([]),
            created_at: now,
            processed_at: None,
            blog_id: new.blog_id,
        });
        Ok(event_id)
    }

    fn cancel_pending_unique(state: &mut State, event_type: &str) -> u64 {
        let mut cancelled = 0;
        for entry in &mut state.outbox {
            if entry.status == OutboxStatus::Pending
                && entry.is_unique
                && entry.event_type == event_type
            {
                entry.status = OutboxStatus::Cancelled;
                entry.locked_until = None;
                entry.locked_by = None;
                cancelled += 1;
            }
        }
        cancelled
    }
}

impl OutboxStore for MemoryStore {
    async fn write(&self, entry: NewOutboxEntry) -> Result<Uuid> {
        let mut state = self.lock();
        Self::insert_entry(&mut state, entry, Uuid::new_v4())
    }

    async fn fetch_pending(
        &self,
        limit: u32,
        worker_id: &str,
        lock_ttl: Duration,
    ) -> Result<Vec<OutboxEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.lock();
        let now = OffsetDateTime::now_utc();

        let mut claimable: Vec<usize> = state
            .outbox
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                matches!(e.status, OutboxStatus::Pending | OutboxStatus::Processing)
                    && e.scheduled_at <= now
                    && e.next_attempt_at.map_or(true, |at| at <= now)
                    && e.locked_until.map_or(true, |until| until <= now)
            })
            .map(|(i, _)| i)
            .collect();
        claimable.sort_by(|&a, &b| {
            let ea = &state.outbox[a];
            let eb = &state.outbox[b];
            (ea.scheduled_at, ea.sequence, ea.id).cmp(&(eb.scheduled_at, eb.sequence, eb.id))
        });
        claimable.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(claimable.len());
        for index in claimable {
            let entry = &mut state.outbox[index];
            entry.status = OutboxStatus::Processing;
            entry.locked_until = Some(now + lock_ttl);
            entry.locked_by = Some(worker_id.to_owned());
            claimed.push(entry.clone());
        }
        Ok(claimed)
    }

    async fn find_by_event_id(&self, event_id: Uuid) -> Result<Option<OutboxEntry>> {
        Ok(self
            .lock()
            .outbox
            .iter()
            .find(|e| e.event_id == event_id)
            .cloned())
    }

    async fn mark_completed(&self, event_id: Uuid) -> Result<()> {
        let mut state = self.lock();
        if let Some(entry) = state.outbox.iter_mut().find(|e| e.event_id == event_id) {
            entry.status = OutboxStatus::Completed;
            entry.processed_at = Some(OffsetDateTime::now_utc());
            entry.locked_until = None;
            entry.locked_by = None;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: Uuid,
        worker_id: &str,
        error: &str,
        backoff: Duration,
    ) -> Result<()> {
        let mut state = self.lock();
        let now = OffsetDateTime::now_utc();
        if let Some(entry) = state.outbox.iter_mut().find(|e| e.event_id == event_id) {
            // Worker-id guard: a resurrected worker must not clobber an
            // entry now leased elsewhere.
            if entry.locked_by.as_deref() != Some(worker_id) {
                return Ok(());
            }
            entry.attempts += 1;
            entry.last_error = Some(error.to_owned());
            if let Some(history) = entry.error_history.as_array_mut() {
                history.push(json!({
                    "attempt": entry.attempts,
                    "error": error,
                    "at": now.format(&time::format_description::well_known::Rfc3339)
                        .unwrap_or_default(),
                }));
            }
            entry.next_attempt_at = Some(now + backoff);
            entry.status = OutboxStatus::Pending;
            entry.locked_until = None;
            entry.locked_by = None;
        }
        Ok(())
    }

    async fn move_to_dlq(&self, event_id: Uuid, final_error: &str) -> Result<()> {
        let mut state = self.lock();
        let now = OffsetDateTime::now_utc();

        let Some(entry) = state.outbox.iter_mut().find(|e| e.event_id == event_id) else {
            return Ok(());
        };
        entry.attempts += 1;
        entry.status = OutboxStatus::Dlq;
        entry.last_error = Some(final_error.to_owned());
        entry.locked_until = None;
        entry.locked_by = None;

        let dlq_entry = DlqEntry {
            id: 0,
            event_id: entry.event_id,
            event_type: entry.event_type.clone(),
            integration_action: entry.integration_action.clone(),
            payload: entry.payload.clone(),
            correlation_id: entry.correlation_id,
            attempts: entry.attempts,
            final_error: final_error.to_owned(),
            moved_at: now,
            resolved_at: None,
            blog_id: entry.blog_id,
        };

        state.next_dlq_id += 1;
        let id = state.next_dlq_id;
        state.dlq.push(DlqEntry { id, ..dlq_entry });
        Ok(())
    }

    async fn release_stale_locks(&self, _timeout: Duration) -> Result<u64> {
        let mut state = self.lock();
        let now = OffsetDateTime::now_utc();
        let mut released = 0;
        for entry in &mut state.outbox {
            if entry.status == OutboxStatus::Processing
                && entry.locked_until.map_or(true, |until| until <= now)
            {
                entry.status = OutboxStatus::Pending;
                entry.locked_until = None;
                entry.locked_by = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn cancel_duplicates(
        &self,
        event_type: &str,
        _payload_signature: Option<&str>,
    ) -> Result<u64> {
        let mut state = self.lock();
        Ok(Self::cancel_pending_unique(&mut state, event_type))
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let state = self.lock();
        let mut stats = OutboxStats::default();
        for entry in &state.outbox {
            match entry.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Processing => stats.processing += 1,
                OutboxStatus::Completed => stats.completed += 1,
                OutboxStatus::Failed => stats.failed += 1,
                OutboxStatus::Dlq => stats.dlq += 1,
                OutboxStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats.unresolved_dlq = state.dlq.iter().filter(|d| d.resolved_at.is_none()).count() as u64;
        Ok(stats)
    }

    async fn purge_completed(&self, days: u32) -> Result<u64> {
        let mut state = self.lock();
        let cutoff = OffsetDateTime::now_utc() - Duration::from_secs(u64::from(days) * 86_400);
        let before = state.outbox.len();
        state.outbox.retain(|e| {
            !(e.status == OutboxStatus::Completed
                && e.processed_at.map_or(false, |at| at < cutoff))
        });
        Ok((before - state.outbox.len()) as u64)
    }

    async fn dlq_entries(&self, limit: u32) -> Result<Vec<DlqEntry>> {
        let state = self.lock();
        let mut entries: Vec<DlqEntry> = state.dlq.clone();
        entries.sort_by(|a, b| b.moved_at.cmp(&a.moved_at));
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn resolve_dlq(&self, dlq_id: i64) -> Result<bool> {
        let mut state = self.lock();
        if let Some(entry) = state
            .dlq
            .iter_mut()
            .find(|d| d.id == dlq_id && d.resolved_at.is_none())
        {
            entry.resolved_at = Some(OffsetDateTime::now_utc());
            return Ok(true);
        }
        Ok(false)
    }

    async fn redrive_dlq(&self, dlq_id: i64) -> Result<bool> {
        let mut state = self.lock();
        let Some(dlq_index) = state
            .dlq
            .iter()
            .position(|d| d.id == dlq_id && d.resolved_at.is_none())
        else {
            return Ok(false);
        };

        let event_id = state.dlq[dlq_index].event_id;
        state.dlq[dlq_index].resolved_at = Some(OffsetDateTime::now_utc());

        if let Some(entry) = state.outbox.iter_mut().find(|e| e.event_id == event_id) {
            entry.status = OutboxStatus::Pending;
            entry.attempts = 0;
            entry.next_attempt_at = None;
            entry.last_error = None;
            entry.locked_until = None;
            entry.locked_by = None;
        }
        Ok(true)
    }
}

impl ProcessStore for MemoryStore {
    async fn save(&self, record: &mut ProcessRecord) -> Result<()> {
        let mut state = self.lock();
        record.updated_at = OffsetDateTime::now_utc();

        match record.id {
            Some(id) => {
                if let Some(existing) = state.processes.iter_mut().find(|p| p.id == Some(id)) {
                    *existing = record.clone();
                }
            }
            None => {
                state.next_process_id += 1;
                record.id = Some(state.next_process_id);
                state.processes.push(record.clone());
            }
        }
        Ok(())
    }

    async fn find(&self, id: i64) -> Result<Option<ProcessRecord>> {
        Ok(self
            .lock()
            .processes
            .iter()
            .find(|p| p.id == Some(id))
            .cloned())
    }

    async fn find_waiting_for(&self, event_type: &str) -> Result<Vec<ProcessRecord>> {
        Ok(self
            .lock()
            .processes
            .iter()
            .filter(|p| {
                p.status == ProcessStatus::Suspended
                    && p.waiting_for.as_deref() == Some(event_type)
            })
            .cloned()
            .collect())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        self.lock().processes.retain(|p| p.id != Some(id));
        Ok(())
    }
}

impl WorkflowStore for MemoryStore {
    async fn save(&self, workflow: &mut BehaviourWorkflow) -> Result<()> {
        let mut state = self.lock();
        workflow.updated_at = OffsetDateTime::now_utc();

        match workflow.id {
            Some(id) => {
                if let Some(existing) = state.workflows.iter_mut().find(|w| w.id == Some(id)) {
                    *existing = workflow.clone();
                }
            }
            None => {
                state.next_workflow_id += 1;
                workflow.id = Some(state.next_workflow_id);
                state.workflows.push(workflow.clone());
            }
        }
        Ok(())
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<BehaviourWorkflow>> {
        Ok(self
            .lock()
            .workflows
            .iter()
            .find(|w| w.id == Some(id))
            .cloned())
    }

    async fn get_by_ref(&self, ref_id: &str, ref_type: &str) -> Result<Vec<BehaviourWorkflow>> {
        Ok(self
            .lock()
            .workflows
            .iter()
            .filter(|w| w.ref_id == ref_id && w.ref_type == ref_type)
            .cloned()
            .collect())
    }
}

impl WorkItemStore for MemoryStore {
    async fn get_by_id(&self, id: i64) -> Result<Option<WorkItem>> {
        Ok(self.lock().items.iter().find(|i| i.id == Some(id)).cloned())
    }

    async fn find_by_unique(
        &self,
        workflow_id: i64,
        behaviour_idx: usize,
        phase: u32,
        item_key: &str,
    ) -> Result<Option<WorkItem>> {
        Ok(self
            .lock()
            .items
            .iter()
            .find(|i| {
                i.workflow_id == workflow_id
                    && i.behaviour_idx == behaviour_idx
                    && i.phase == phase
                    && i.item_key == item_key
            })
            .cloned())
    }

    async fn get_for_step(
        &self,
        workflow_id: i64,
        behaviour_idx: usize,
        phase: u32,
    ) -> Result<WorkItemList> {
        let items = self
            .lock()
            .items
            .iter()
            .filter(|i| {
                i.workflow_id == workflow_id
                    && i.behaviour_idx == behaviour_idx
                    && i.phase == phase
            })
            .cloned()
            .collect();
        Ok(WorkItemList::new(items))
    }

    async fn save(&self, item: &mut WorkItem) -> Result<()> {
        let mut state = self.lock();
        item.updated_at = OffsetDateTime::now_utc();

        if item.id.is_none() {
            // Upsert by the uniqueness key: an existing row keeps its
            // identity and takes the incoming state.
            if let Some(existing) = state.items.iter_mut().find(|i| {
                i.workflow_id == item.workflow_id
                    && i.behaviour_idx == item.behaviour_idx
                    && i.phase == item.phase
                    && i.item_key == item.item_key
            }) {
                item.id = existing.id;
                item.created_at = existing.created_at;
                *existing = item.clone();
                return Ok(());
            }

            state.next_item_id += 1;
            item.id = Some(state.next_item_id);
            state.items.push(item.clone());
            return Ok(());
        }

        if let Some(existing) = state.items.iter_mut().find(|i| i.id == item.id) {
            *existing = item.clone();
        }
        Ok(())
    }

    async fn transfer(&self, item_ids: &[i64], to_workflow_id: i64) -> Result<()> {
        let mut state = self.lock();
        let now = OffsetDateTime::now_utc();
        for item in &mut state.items {
            if item.id.is_some_and(|id| item_ids.contains(&id)) {
                item.workflow_id = to_workflow_id;
                item.status = WorkItemStatus::Pending;
                item.attempts = 0;
                item.last_error = None;
                item.updated_at = now;
            }
        }
        Ok(())
    }
}

enum TxnOp {
    Write { entry: NewOutboxEntry, event_id: Uuid },
    CancelDuplicates { event_type: String },
}

/// Buffered transaction over the memory store.
///
/// Writes are applied at commit, in order; dropping the transaction
/// without committing discards them — the same visibility the Postgres
/// backend gets from a real transaction.
pub struct MemoryTxn {
    store: MemoryStore,
    ops: Vec<TxnOp>,
}

#[async_trait]
impl OutboxWriter for MemoryTxn {
    async fn write_entry(&mut self, entry: NewOutboxEntry) -> Result<Uuid> {
        let event_id = Uuid::new_v4();
        self.ops.push(TxnOp::Write { entry, event_id });
        Ok(event_id)
    }

    async fn cancel_duplicates(
        &mut self,
        event_type: &str,
        _payload_signature: Option<&str>,
    ) -> Result<u64> {
        // Count what is visible now; the cancellation itself lands at
        // commit time.
        let visible = {
            let state = self.store.lock();
            state
                .outbox
                .iter()
                .filter(|e| {
                    e.status == OutboxStatus::Pending
                        && e.is_unique
                        && e.event_type == event_type
                })
                .count() as u64
        };
        self.ops.push(TxnOp::CancelDuplicates {
            event_type: event_type.to_owned(),
        });
        Ok(visible)
    }
}

impl CommandTxn for MemoryTxn {
    async fn commit(self) -> Result<()> {
        let mut state = self.store.lock();
        for op in self.ops {
            match op {
                TxnOp::Write { entry, event_id } => {
                    MemoryStore::insert_entry(&mut state, entry, event_id)?;
                }
                TxnOp::CancelDuplicates { event_type } => {
                    MemoryStore::cancel_pending_unique(&mut state, &event_type);
                }
            }
        }
        Ok(())
    }
}

impl CommandStore for MemoryStore {
    type Txn = MemoryTxn;

    async fn begin(&self) -> Result<Self::Txn> {
        Ok(MemoryTxn {
            store: self.clone(),
            ops: Vec::new(),
        })
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn begin(&self, audit: &CommandAudit) -> Result<()> {
        self.lock().audits.push(audit.clone());
        Ok(())
    }

    async fn complete(&self, audit: &CommandAudit) -> Result<()> {
        let mut state = self.lock();
        match state
            .audits
            .iter_mut()
            .find(|a| a.command_id == audit.command_id)
        {
            Some(existing) => *existing = audit.clone(),
            None => state.audits.push(audit.clone()),
        }
        Ok(())
    }
}

impl LockStore for MemoryStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.lock();
        let now = OffsetDateTime::now_utc();

        if let Some(expires_at) = state.locks.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        state.locks.insert(key.to_owned(), now + ttl);
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.lock().locks.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MessageKind, Transport};

    fn new_entry(event_type: &str) -> NewOutboxEntry {
        NewOutboxEntry {
            event_type: event_type.to_owned(),
            integration_action: format!("test.{event_type}"),
            message_kind: MessageKind::Event,
            transport: Transport::InProcess,
            queue: None,
            payload: json!({"n": 1}),
            payload_signature: None,
            delay_seconds: 0,
            is_unique: false,
            correlation_id: Uuid::new_v4(),
            sequence: 1,
            command_id: None,
            max_attempts: 5,
            blog_id: 0,
        }
    }

    #[tokio::test]
    async fn fetch_pending_zero_limit_is_a_noop() {
        let store = MemoryStore::new();
        store.write(new_entry("a")).await.unwrap();

        let claimed = store
            .fetch_pending(0, "w", Duration::from_secs(300))
            .await
            .unwrap();

        assert!(claimed.is_empty());
        assert_eq!(
            store.outbox_snapshot()[0].status,
            OutboxStatus::Pending
        );
    }

    #[tokio::test]
    async fn claim_leases_and_excludes_leased_entries() {
        let store = MemoryStore::new();
        store.write(new_entry("a")).await.unwrap();

        let first = store
            .fetch_pending(10, "w1", Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].locked_by.as_deref(), Some("w1"));

        let second = store
            .fetch_pending(10, "w2", Duration::from_secs(300))
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn mark_failed_is_guarded_by_worker_id() {
        let store = MemoryStore::new();
        let event_id = store.write(new_entry("a")).await.unwrap();
        store
            .fetch_pending(1, "w1", Duration::from_secs(300))
            .await
            .unwrap();

        store
            .mark_failed(event_id, "w2", "boom", Duration::from_secs(60))
            .await
            .unwrap();
        let entry = store.find_by_event_id(event_id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 0, "other worker's update is ignored");

        store
            .mark_failed(event_id, "w1", "boom", Duration::from_secs(60))
            .await
            .unwrap();
        let entry = store.find_by_event_id(event_id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert!(entry.next_attempt_at.is_some());
    }

    #[tokio::test]
    async fn dropped_txn_discards_writes() {
        let store = MemoryStore::new();

        let mut txn = CommandStore::begin(&store).await.unwrap();
        txn.write_entry(new_entry("a")).await.unwrap();
        drop(txn);

        assert!(store.outbox_snapshot().is_empty());

        let mut txn = CommandStore::begin(&store).await.unwrap();
        txn.write_entry(new_entry("a")).await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(store.outbox_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn work_item_save_upserts_by_unique_key() {
        let store = MemoryStore::new();

        let mut first = WorkItem::new(1, 0, 1, "k", json!({"v": 1}), 0);
        WorkItemStore::save(&store, &mut first).await.unwrap();

        let mut duplicate = WorkItem::new(1, 0, 1, "k", json!({"v": 2}), 0);
        WorkItemStore::save(&store, &mut duplicate).await.unwrap();

        assert_eq!(duplicate.id, first.id);
        assert_eq!(store.item_snapshot().len(), 1);
        assert_eq!(store.item_snapshot()[0].payload, json!({"v": 2}));
    }
}
