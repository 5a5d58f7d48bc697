//! Outbox storage operations.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{DlqEntry, NewOutboxEntry, OutboxEntry, OutboxStats};
use crate::Result;

/// Transactional outbox writes.
///
/// Implemented by command transactions (so integration events commit
/// atomically with business writes) and, for non-transactional commands,
/// by an autocommit adapter over the store.
#[async_trait]
pub trait OutboxWriter: Send {
    /// Insert a pending entry, returning its freshly generated `event_id`.
    ///
    /// The store sets `status = pending`, `scheduled_at = now + delay`,
    /// and `payload_bytes` from the serialized payload.
    async fn write_entry(&mut self, entry: NewOutboxEntry) -> Result<Uuid>;

    /// Cancel pending entries of the given type that were written with
    /// `is_unique`. Returns the number of entries cancelled.
    ///
    /// The payload signature is accepted for future exact-match
    /// supersession; the baseline matches by type only.
    async fn cancel_duplicates(
        &mut self,
        event_type: &str,
        payload_signature: Option<&str>,
    ) -> Result<u64>;
}

/// [`OutboxWriter`] over a store, committing each write on its own — the
/// publish path of commands that did not opt into the transaction stage.
pub struct AutocommitOutbox<'a, S: OutboxStore>(&'a S);

impl<'a, S: OutboxStore> AutocommitOutbox<'a, S> {
    /// Wrap a store.
    pub fn new(store: &'a S) -> Self {
        Self(store)
    }
}

#[async_trait]
impl<S: OutboxStore> OutboxWriter for AutocommitOutbox<'_, S> {
    async fn write_entry(&mut self, entry: NewOutboxEntry) -> Result<Uuid> {
        self.0.write(entry).await
    }

    async fn cancel_duplicates(
        &mut self,
        event_type: &str,
        payload_signature: Option<&str>,
    ) -> Result<u64> {
        OutboxStore::cancel_duplicates(self.0, event_type, payload_signature).await
    }
}

/// Storage operations for the outbox processor.
///
/// # Claim protocol
///
/// [`fetch_pending`](Self::fetch_pending) atomically selects and leases a
/// batch of due entries (`FOR UPDATE SKIP LOCKED` or equivalent). A leased
/// entry is `processing` with `locked_until = now + lock_ttl`; an expired
/// lease makes the entry claimable again, so a crashed worker's rows
/// return to the pool without intervention. [`release_stale_locks`](Self::release_stale_locks)
/// additionally flips long-expired claims back to `pending` for hygiene
/// and accurate stats.
pub trait OutboxStore: Send + Sync + Clone + 'static {
    /// Insert a pending entry outside any caller transaction.
    fn write(&self, entry: NewOutboxEntry) -> impl Future<Output = Result<Uuid>> + Send;

    /// Claim up to `limit` due entries for `worker_id`, leasing each for
    /// `lock_ttl`.
    ///
    /// An entry is due when it is `pending` (or holds an expired lease),
    /// `scheduled_at` has passed, and any retry backoff has elapsed.
    /// Entries are returned oldest-first by `scheduled_at`, then by
    /// `sequence`, so entries sharing a correlation publish in
    /// nondecreasing sequence on a single worker. `limit = 0` returns an
    /// empty batch without touching state.
    fn fetch_pending(
        &self,
        limit: u32,
        worker_id: &str,
        lock_ttl: Duration,
    ) -> impl Future<Output = Result<Vec<OutboxEntry>>> + Send;

    /// Look up an entry by its event id.
    fn find_by_event_id(
        &self,
        event_id: Uuid,
    ) -> impl Future<Output = Result<Option<OutboxEntry>>> + Send;

    /// Mark an entry published: `status = completed`, `processed_at = now`,
    /// lease cleared.
    fn mark_completed(&self, event_id: Uuid) -> impl Future<Output = Result<()>> + Send;

    /// Record a failed attempt and schedule a retry.
    ///
    /// Increments `attempts`, appends to `error_history`, sets
    /// `next_attempt_at = now + backoff`, returns the entry to `pending`,
    /// and clears the lease. The update is guarded by `locked_by =
    /// worker_id`, so a resurrected worker cannot clobber an entry now
    /// leased elsewhere. Never moves the entry to the DLQ — that decision
    /// belongs to the processor.
    fn mark_failed(
        &self,
        event_id: Uuid,
        worker_id: &str,
        error: &str,
        backoff: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Copy an entry to the DLQ with `final_error`, set the outbox row to
    /// `status = dlq`, and clear the lease.
    fn move_to_dlq(
        &self,
        event_id: Uuid,
        final_error: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Return long-expired claims to `pending`. Returns the number of
    /// entries released. Idempotent: a second call with the same cutoff
    /// releases nothing.
    fn release_stale_locks(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Type-level supersession of pending unique entries; see
    /// [`OutboxWriter::cancel_duplicates`].
    fn cancel_duplicates(
        &self,
        event_type: &str,
        payload_signature: Option<&str>,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Grouped status counts plus the unresolved DLQ backlog.
    fn stats(&self) -> impl Future<Output = Result<OutboxStats>> + Send;

    /// Delete completed entries processed more than `days` days ago.
    /// Returns the number of rows deleted.
    fn purge_completed(&self, days: u32) -> impl Future<Output = Result<u64>> + Send;

    /// Fetch the most recent DLQ entries, newest first.
    fn dlq_entries(&self, limit: u32) -> impl Future<Output = Result<Vec<DlqEntry>>> + Send;

    /// Mark a DLQ entry handled. Returns false when the entry does not
    /// exist or was already resolved.
    fn resolve_dlq(&self, dlq_id: i64) -> impl Future<Output = Result<bool>> + Send;

    /// Return a dead-lettered entry to the pending pool: reset the outbox
    /// row's attempts and status, and mark the DLQ row resolved. Returns
    /// false when the DLQ entry does not exist or was already resolved.
    fn redrive_dlq(&self, dlq_id: i64) -> impl Future<Output = Result<bool>> + Send;
}
