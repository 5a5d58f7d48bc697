//! PostgreSQL storage backend.
//!
//! One [`PgStore`] implements every storage seam against tenant-scoped
//! tables created by [`PgStore::create_schema`]. Claims use
//! `FOR UPDATE SKIP LOCKED`, and every timestamp comparison happens in
//! the database (`now()`) to avoid clock skew between application and
//! database servers. Queries are runtime-bound, so the crate builds
//! without a live database.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::{ProcessStore, WorkItemStore, WorkflowStore};
use crate::behaviour::work_item::{WorkItem, WorkItemList, WorkItemStatus};
use crate::behaviour::{BehaviourConfigEntry, BehaviourExecutionResult, BehaviourWorkflow};
use crate::bus::{AuditSink, CommandAudit, CommandStore, CommandTxn};
use crate::event::{MessageKind, Transport};
use crate::lock::LockStore;
use crate::outbox::{
    DlqEntry, NewOutboxEntry, OutboxEntry, OutboxStats, OutboxStatus, OutboxStore, OutboxWriter,
};
use crate::process::{ProcessRecord, ProcessStatus, ProcessSteps};
use crate::Result;

/// Idempotent schema: tables and the required index set. Executed
/// statement by statement so partial prior runs are harmless.
const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS integration_outbox (
        id BIGSERIAL PRIMARY KEY,
        event_id UUID NOT NULL UNIQUE,
        event_type TEXT NOT NULL,
        integration_action TEXT NOT NULL,
        message_kind TEXT NOT NULL,
        transport TEXT NOT NULL,
        queue TEXT,
        payload_bytes BIGINT NOT NULL DEFAULT 0,
        correlation_id UUID NOT NULL,
        sequence BIGINT NOT NULL,
        command_id UUID,
        payload JSONB NOT NULL,
        payload_signature TEXT,
        delay_seconds BIGINT NOT NULL DEFAULT 0,
        scheduled_at TIMESTAMPTZ NOT NULL,
        is_unique BOOLEAN NOT NULL DEFAULT FALSE,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INT NOT NULL DEFAULT 0,
        max_attempts INT NOT NULL DEFAULT 5,
        next_attempt_at TIMESTAMPTZ,
        locked_until TIMESTAMPTZ,
        locked_by TEXT,
        last_error TEXT,
        error_history JSONB NOT NULL DEFAULT '[]',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        processed_at TIMESTAMPTZ,
        blog_id BIGINT NOT NULL DEFAULT 0
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_outbox_status_scheduled
        ON integration_outbox (status, scheduled_at)",
    "CREATE INDEX IF NOT EXISTS idx_outbox_status_next_attempt
        ON integration_outbox (status, next_attempt_at)",
    "CREATE INDEX IF NOT EXISTS idx_outbox_blog_status
        ON integration_outbox (blog_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_outbox_correlation
        ON integration_outbox (correlation_id)",
    r#"CREATE TABLE IF NOT EXISTS integration_dlq (
        id BIGSERIAL PRIMARY KEY,
        event_id UUID NOT NULL,
        event_type TEXT NOT NULL,
        integration_action TEXT NOT NULL,
        payload JSONB NOT NULL,
        correlation_id UUID NOT NULL,
        attempts INT NOT NULL,
        final_error TEXT NOT NULL,
        moved_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        resolved_at TIMESTAMPTZ,
        blog_id BIGINT NOT NULL DEFAULT 0
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_dlq_unresolved
        ON integration_dlq (resolved_at) WHERE resolved_at IS NULL",
    r#"CREATE TABLE IF NOT EXISTS long_processes (
        id BIGSERIAL PRIMARY KEY,
        process_type TEXT NOT NULL,
        business_data JSONB NOT NULL,
        steps JSONB NOT NULL,
        step_index INT NOT NULL DEFAULT 0,
        step_name TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        waiting_for TEXT,
        match_criteria JSONB,
        payload JSONB,
        correlation_id UUID NOT NULL,
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        blog_id BIGINT NOT NULL DEFAULT 0
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_processes_waiting
        ON long_processes (waiting_for, status)",
    "CREATE INDEX IF NOT EXISTS idx_processes_status
        ON long_processes (status)",
    "CREATE INDEX IF NOT EXISTS idx_processes_correlation
        ON long_processes (correlation_id)",
    "CREATE INDEX IF NOT EXISTS idx_processes_blog_status
        ON long_processes (blog_id, status)",
    r#"CREATE TABLE IF NOT EXISTS behaviour_workflows (
        id BIGSERIAL PRIMARY KEY,
        ref_id TEXT NOT NULL,
        ref_type TEXT NOT NULL,
        root_workflow_id BIGINT,
        behaviour_configs JSONB NOT NULL,
        behaviour_results JSONB NOT NULL,
        current_idx INT NOT NULL DEFAULT 0,
        current_phase INT NOT NULL DEFAULT 1,
        is_complete BOOLEAN NOT NULL DEFAULT FALSE,
        is_failed BOOLEAN NOT NULL DEFAULT FALSE,
        meta JSONB NOT NULL DEFAULT '{}',
        blog_id BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_workflows_ref
        ON behaviour_workflows (ref_id, ref_type)",
    "CREATE INDEX IF NOT EXISTS idx_workflows_blog
        ON behaviour_workflows (blog_id)",
    r#"CREATE TABLE IF NOT EXISTS behaviour_workflow_items (
        id BIGSERIAL PRIMARY KEY,
        workflow_id BIGINT NOT NULL,
        behaviour_idx INT NOT NULL,
        phase INT NOT NULL,
        item_key TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INT NOT NULL DEFAULT 0,
        last_error TEXT,
        payload JSONB NOT NULL DEFAULT 'null',
        blog_id BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT uq_workflow_items UNIQUE (workflow_id, behaviour_idx, phase, item_key)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS command_audit (
        id BIGSERIAL PRIMARY KEY,
        command_id UUID NOT NULL UNIQUE,
        correlation_id UUID NOT NULL,
        command_name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'in_progress',
        source TEXT NOT NULL DEFAULT 'system',
        source_id TEXT,
        started_at TIMESTAMPTZ NOT NULL,
        finished_at TIMESTAMPTZ,
        duration_ms BIGINT,
        peak_memory_bytes BIGINT,
        parameters JSONB NOT NULL DEFAULT '{}',
        events JSONB NOT NULL DEFAULT '[]',
        error_kind TEXT,
        error_message TEXT,
        error_code TEXT,
        environment TEXT NOT NULL DEFAULT 'production',
        blog_id BIGINT NOT NULL DEFAULT 0
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_audit_started ON command_audit (started_at)",
    "CREATE INDEX IF NOT EXISTS idx_audit_name ON command_audit (command_name)",
    "CREATE INDEX IF NOT EXISTS idx_audit_correlation ON command_audit (correlation_id)",
    r#"CREATE TABLE IF NOT EXISTS named_locks (
        lock_key TEXT PRIMARY KEY,
        locked_until TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
];

/// PostgreSQL-backed store for production use.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a store from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create all tables and indices. Idempotent.
    pub async fn create_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

const OUTBOX_COLUMNS: &str = "id, event_id, event_type, integration_action, message_kind, \
     transport, queue, payload_bytes, correlation_id, sequence, command_id, payload, \
     delay_seconds, scheduled_at, is_unique, status, attempts, max_attempts, \
     next_attempt_at, locked_until, locked_by, last_error, error_history, created_at, \
     processed_at, blog_id";

fn outbox_from_row(row: &PgRow) -> Result<OutboxEntry> {
    Ok(OutboxEntry {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        event_type: row.try_get("event_type")?,
        integration_action: row.try_get("integration_action")?,
        message_kind: MessageKind::parse(row.try_get::<String, _>("message_kind")?.as_str())?,
        transport: Transport::parse(row.try_get::<String, _>("transport")?.as_str())?,
        queue: row.try_get("queue")?,
        payload_bytes: row.try_get("payload_bytes")?,
        correlation_id: row.try_get("correlation_id")?,
        sequence: row.try_get("sequence")?,
        command_id: row.try_get("command_id")?,
        payload: row.try_get("payload")?,
        delay_seconds: row.try_get("delay_seconds")?,
        scheduled_at: row.try_get("scheduled_at")?,
        is_unique: row.try_get("is_unique")?,
        status: OutboxStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        attempts: row.try_get::<i32, _>("attempts")? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts")? as u32,
        next_attempt_at: row.try_get("next_attempt_at")?,
        locked_until: row.try_get("locked_until")?,
        locked_by: row.try_get("locked_by")?,
        last_error: row.try_get("last_error")?,
        error_history: row.try_get("error_history")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
        blog_id: row.try_get("blog_id")?,
    })
}

fn dlq_from_row(row: &PgRow) -> Result<DlqEntry> {
    Ok(DlqEntry {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        event_type: row.try_get("event_type")?,
        integration_action: row.try_get("integration_action")?,
        payload: row.try_get("payload")?,
        correlation_id: row.try_get("correlation_id")?,
        attempts: row.try_get::<i32, _>("attempts")? as u32,
        final_error: row.try_get("final_error")?,
        moved_at: row.try_get("moved_at")?,
        resolved_at: row.try_get("resolved_at")?,
        blog_id: row.try_get("blog_id")?,
    })
}

async fn insert_outbox<'c, E>(executor: E, entry: &NewOutboxEntry, event_id: Uuid) -> Result<()>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let payload_bytes = serde_json::to_string(&entry.payload)?.len() as i64;

    sqlx::query(
        r#"
        INSERT INTO integration_outbox (
            event_id, event_type, integration_action, message_kind, transport, queue,
            payload_bytes, correlation_id, sequence, command_id, payload,
            payload_signature, delay_seconds, scheduled_at, is_unique, status,
            max_attempts, blog_id
        ) VALUES (
            $1, $2, $3, $4, $5, $6,
            $7, $8, $9, $10, $11,
            $12, $13, now() + ($13 * interval '1 second'), $14, 'pending',
            $15, $16
        )
        "#,
    )
    .bind(event_id)
    .bind(&entry.event_type)
    .bind(&entry.integration_action)
    .bind(entry.message_kind.as_str())
    .bind(entry.transport.as_str())
    .bind(&entry.queue)
    .bind(payload_bytes)
    .bind(entry.correlation_id)
    .bind(entry.sequence)
    .bind(entry.command_id)
    .bind(&entry.payload)
    .bind(&entry.payload_signature)
    .bind(entry.delay_seconds.max(0))
    .bind(entry.is_unique)
    .bind(entry.max_attempts as i32)
    .bind(entry.blog_id)
    .execute(executor)
    .await?;

    Ok(())
}

async fn cancel_duplicates_sql<'c, E>(executor: E, event_type: &str) -> Result<u64>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE integration_outbox
        SET status = 'cancelled', locked_until = NULL, locked_by = NULL
        WHERE status = 'pending' AND is_unique AND event_type = $1
        "#,
    )
    .bind(event_type)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

impl OutboxStore for PgStore {
    async fn write(&self, entry: NewOutboxEntry) -> Result<Uuid> {
        let event_id = Uuid::new_v4();
        insert_outbox(&self.pool, &entry, event_id).await?;
        Ok(event_id)
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

        let sql = format!(
            r#"
            UPDATE integration_outbox
            SET status = 'processing',
                locked_until = now() + ($1 * interval '1 second'),
                locked_by = $2
            WHERE id IN (
                SELECT id FROM integration_outbox
                WHERE status IN ('pending', 'processing')
                  AND scheduled_at <= now()
                  AND (next_attempt_at IS NULL OR next_attempt_at <= now())
                  AND (locked_until IS NULL OR locked_until <= now())
                ORDER BY scheduled_at, sequence, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {OUTBOX_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(lock_ttl.as_secs_f64())
            .bind(worker_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut entries = rows
            .iter()
            .map(outbox_from_row)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING gives no ordering guarantee; restore claim order so a
        // correlation's entries publish in nondecreasing sequence.
        entries.sort_by(|a, b| {
            (a.scheduled_at, a.sequence, a.id).cmp(&(b.scheduled_at, b.sequence, b.id))
        });
        Ok(entries)
    }

    async fn find_by_event_id(&self, event_id: Uuid) -> Result<Option<OutboxEntry>> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM integration_outbox WHERE event_id = $1");
        let row = sqlx::query(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(outbox_from_row).transpose()
    }

    async fn mark_completed(&self, event_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE integration_outbox
            SET status = 'completed',
                processed_at = now(),
                locked_until = NULL,
                locked_by = NULL
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: Uuid,
        worker_id: &str,
        error: &str,
        backoff: Duration,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE integration_outbox
            SET attempts = attempts + 1,
                last_error = $2,
                error_history = error_history || jsonb_build_array(jsonb_build_object(
                    'attempt', attempts + 1, 'error', $2::text, 'at', now()
                )),
                next_attempt_at = now() + ($3 * interval '1 second'),
                status = 'pending',
                locked_until = NULL,
                locked_by = NULL
            WHERE event_id = $1 AND locked_by = $4
            "#,
        )
        .bind(event_id)
        .bind(error)
        .bind(backoff.as_secs_f64())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn move_to_dlq(&self, event_id: Uuid, final_error: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE integration_outbox
            SET attempts = attempts + 1,
                status = 'dlq',
                last_error = $2,
                locked_until = NULL,
                locked_by = NULL
            WHERE event_id = $1
            RETURNING event_type, integration_action, payload, correlation_id, attempts, blog_id
            "#,
        )
        .bind(event_id)
        .bind(final_error)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(());
        };

        sqlx::query(
            r#"
            INSERT INTO integration_dlq (
                event_id, event_type, integration_action, payload, correlation_id,
                attempts, final_error, blog_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event_id)
        .bind(row.try_get::<String, _>("event_type")?)
        .bind(row.try_get::<String, _>("integration_action")?)
        .bind(row.try_get::<Value, _>("payload")?)
        .bind(row.try_get::<Uuid, _>("correlation_id")?)
        .bind(row.try_get::<i32, _>("attempts")?)
        .bind(final_error)
        .bind(row.try_get::<i64, _>("blog_id")?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn release_stale_locks(&self, _timeout: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE integration_outbox
            SET status = 'pending', locked_until = NULL, locked_by = NULL
            WHERE status = 'processing'
              AND (locked_until IS NULL OR locked_until <= now())
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn cancel_duplicates(
        &self,
        event_type: &str,
        _payload_signature: Option<&str>,
    ) -> Result<u64> {
        cancel_duplicates_sql(&self.pool, event_type).await
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM integration_outbox GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let count = row.try_get::<i64, _>("count")? as u64;
            match OutboxStatus::parse(row.try_get::<String, _>("status")?.as_str())? {
                OutboxStatus::Pending => stats.pending = count,
                OutboxStatus::Processing => stats.processing = count,
                OutboxStatus::Completed => stats.completed = count,
                OutboxStatus::Failed => stats.failed = count,
                OutboxStatus::Dlq => stats.dlq = count,
                OutboxStatus::Cancelled => stats.cancelled = count,
            }
        }

        let unresolved =
            sqlx::query("SELECT COUNT(*) AS count FROM integration_dlq WHERE resolved_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        stats.unresolved_dlq = unresolved.try_get::<i64, _>("count")? as u64;
        Ok(stats)
    }

    async fn purge_completed(&self, days: u32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM integration_outbox
            WHERE status = 'completed'
              AND processed_at < now() - ($1 * interval '1 day')
            "#,
        )
        .bind(days as f64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn dlq_entries(&self, limit: u32) -> Result<Vec<DlqEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, event_type, integration_action, payload, correlation_id,
                   attempts, final_error, moved_at, resolved_at, blog_id
            FROM integration_dlq
            ORDER BY moved_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(dlq_from_row).collect()
    }

    async fn resolve_dlq(&self, dlq_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE integration_dlq SET resolved_at = now() WHERE id = $1 AND resolved_at IS NULL",
        )
        .bind(dlq_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn redrive_dlq(&self, dlq_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE integration_dlq
            SET resolved_at = now()
            WHERE id = $1 AND resolved_at IS NULL
            RETURNING event_id
            "#,
        )
        .bind(dlq_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };
        let event_id: Uuid = row.try_get("event_id")?;

        sqlx::query(
            r#"
            UPDATE integration_outbox
            SET status = 'pending',
                attempts = 0,
                next_attempt_at = NULL,
                last_error = NULL,
                locked_until = NULL,
                locked_by = NULL
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

fn process_from_row(row: &PgRow) -> Result<ProcessRecord> {
    let steps: ProcessSteps = serde_json::from_value(row.try_get::<Value, _>("steps")?)?;
    Ok(ProcessRecord {
        id: Some(row.try_get("id")?),
        process_type: row.try_get("process_type")?,
        business_data: row.try_get("business_data")?,
        steps,
        status: ProcessStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        waiting_for: row.try_get("waiting_for")?,
        match_criteria: row.try_get("match_criteria")?,
        payload: row.try_get("payload")?,
        correlation_id: row.try_get("correlation_id")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        blog_id: row.try_get("blog_id")?,
    })
}

const PROCESS_COLUMNS: &str = "id, process_type, business_data, steps, status, waiting_for, \
     match_criteria, payload, correlation_id, last_error, created_at, updated_at, blog_id";

impl ProcessStore for PgStore {
    async fn save(&self, record: &mut ProcessRecord) -> Result<()> {
        let steps = serde_json::to_value(&record.steps)?;
        let step_name = record.step_name().map(str::to_owned);

        match record.id {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE long_processes
                    SET business_data = $2, steps = $3, step_index = $4, step_name = $5,
                        status = $6, waiting_for = $7, match_criteria = $8, payload = $9,
                        last_error = $10, updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(&record.business_data)
                .bind(&steps)
                .bind(record.steps.step_index() as i32)
                .bind(&step_name)
                .bind(record.status.as_str())
                .bind(&record.waiting_for)
                .bind(&record.match_criteria)
                .bind(&record.payload)
                .bind(&record.last_error)
                .execute(&self.pool)
                .await?;
            }
            None => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO long_processes (
                        process_type, business_data, steps, step_index, step_name, status,
                        waiting_for, match_criteria, payload, correlation_id, last_error, blog_id
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                    RETURNING id
                    "#,
                )
                .bind(&record.process_type)
                .bind(&record.business_data)
                .bind(&steps)
                .bind(record.steps.step_index() as i32)
                .bind(&step_name)
                .bind(record.status.as_str())
                .bind(&record.waiting_for)
                .bind(&record.match_criteria)
                .bind(&record.payload)
                .bind(record.correlation_id)
                .bind(&record.last_error)
                .bind(record.blog_id)
                .fetch_one(&self.pool)
                .await?;
                record.id = Some(row.try_get("id")?);
            }
        }
        Ok(())
    }

    async fn find(&self, id: i64) -> Result<Option<ProcessRecord>> {
        let sql = format!("SELECT {PROCESS_COLUMNS} FROM long_processes WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(process_from_row).transpose()
    }

    async fn find_waiting_for(&self, event_type: &str) -> Result<Vec<ProcessRecord>> {
        let sql = format!(
            "SELECT {PROCESS_COLUMNS} FROM long_processes \
             WHERE waiting_for = $1 AND status = 'suspended' ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(event_type)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(process_from_row).collect()
    }

    async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM long_processes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn workflow_from_row(row: &PgRow) -> Result<BehaviourWorkflow> {
    let configs: Vec<BehaviourConfigEntry> =
        serde_json::from_value(row.try_get::<Value, _>("behaviour_configs")?)?;
    let results: Vec<Option<BehaviourExecutionResult>> =
        serde_json::from_value(row.try_get::<Value, _>("behaviour_results")?)?;
    let meta: std::collections::BTreeMap<String, String> =
        serde_json::from_value(row.try_get::<Value, _>("meta")?)?;

    Ok(BehaviourWorkflow {
        id: Some(row.try_get("id")?),
        ref_id: row.try_get("ref_id")?,
        ref_type: row.try_get("ref_type")?,
        root_workflow_id: row.try_get("root_workflow_id")?,
        behaviour_configs: configs,
        behaviour_results: results,
        current_idx: row.try_get::<i32, _>("current_idx")? as usize,
        current_phase: row.try_get::<i32, _>("current_phase")? as u32,
        is_complete: row.try_get("is_complete")?,
        is_failed: row.try_get("is_failed")?,
        meta,
        blog_id: row.try_get("blog_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const WORKFLOW_COLUMNS: &str = "id, ref_id, ref_type, root_workflow_id, behaviour_configs, \
     behaviour_results, current_idx, current_phase, is_complete, is_failed, meta, blog_id, \
     created_at, updated_at";

impl WorkflowStore for PgStore {
    async fn save(&self, workflow: &mut BehaviourWorkflow) -> Result<()> {
        let configs = serde_json::to_value(&workflow.behaviour_configs)?;
        let results = serde_json::to_value(&workflow.behaviour_results)?;
        let meta = serde_json::to_value(&workflow.meta)?;

        match workflow.id {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE behaviour_workflows
                    SET behaviour_configs = $2, behaviour_results = $3, current_idx = $4,
                        current_phase = $5, is_complete = $6, is_failed = $7, meta = $8,
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(&configs)
                .bind(&results)
                .bind(workflow.current_idx as i32)
                .bind(workflow.current_phase as i32)
                .bind(workflow.is_complete)
                .bind(workflow.is_failed)
                .bind(&meta)
                .execute(&self.pool)
                .await?;
            }
            None => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO behaviour_workflows (
                        ref_id, ref_type, root_workflow_id, behaviour_configs,
                        behaviour_results, current_idx, current_phase, is_complete,
                        is_failed, meta, blog_id
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    RETURNING id
                    "#,
                )
                .bind(&workflow.ref_id)
                .bind(&workflow.ref_type)
                .bind(workflow.root_workflow_id)
                .bind(&configs)
                .bind(&results)
                .bind(workflow.current_idx as i32)
                .bind(workflow.current_phase as i32)
                .bind(workflow.is_complete)
                .bind(workflow.is_failed)
                .bind(&meta)
                .bind(workflow.blog_id)
                .fetch_one(&self.pool)
                .await?;
                workflow.id = Some(row.try_get("id")?);
            }
        }
        Ok(())
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<BehaviourWorkflow>> {
        let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM behaviour_workflows WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn get_by_ref(&self, ref_id: &str, ref_type: &str) -> Result<Vec<BehaviourWorkflow>> {
        let sql = format!(
            "SELECT {WORKFLOW_COLUMNS} FROM behaviour_workflows \
             WHERE ref_id = $1 AND ref_type = $2 ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(ref_id)
            .bind(ref_type)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(workflow_from_row).collect()
    }
}

fn item_from_row(row: &PgRow) -> Result<WorkItem> {
    Ok(WorkItem {
        id: Some(row.try_get("id")?),
        workflow_id: row.try_get("workflow_id")?,
        behaviour_idx: row.try_get::<i32, _>("behaviour_idx")? as usize,
        phase: row.try_get::<i32, _>("phase")? as u32,
        item_key: row.try_get("item_key")?,
        status: WorkItemStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        attempts: row.try_get::<i32, _>("attempts")? as u32,
        last_error: row.try_get("last_error")?,
        payload: row.try_get("payload")?,
        blog_id: row.try_get("blog_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const ITEM_COLUMNS: &str = "id, workflow_id, behaviour_idx, phase, item_key, status, attempts, \
     last_error, payload, blog_id, created_at, updated_at";

impl WorkItemStore for PgStore {
    async fn get_by_id(&self, id: i64) -> Result<Option<WorkItem>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM behaviour_workflow_items WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn find_by_unique(
        &self,
        workflow_id: i64,
        behaviour_idx: usize,
        phase: u32,
        item_key: &str,
    ) -> Result<Option<WorkItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM behaviour_workflow_items \
             WHERE workflow_id = $1 AND behaviour_idx = $2 AND phase = $3 AND item_key = $4"
        );
        let row = sqlx::query(&sql)
            .bind(workflow_id)
            .bind(behaviour_idx as i32)
            .bind(phase as i32)
            .bind(item_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn get_for_step(
        &self,
        workflow_id: i64,
        behaviour_idx: usize,
        phase: u32,
    ) -> Result<WorkItemList> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM behaviour_workflow_items \
             WHERE workflow_id = $1 AND behaviour_idx = $2 AND phase = $3 ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(workflow_id)
            .bind(behaviour_idx as i32)
            .bind(phase as i32)
            .fetch_all(&self.pool)
            .await?;
        let items = rows.iter().map(item_from_row).collect::<Result<Vec<_>>>()?;
        Ok(WorkItemList::new(items))
    }

    async fn save(&self, item: &mut WorkItem) -> Result<()> {
        // Upsert by the ledger's uniqueness key: a regenerated item takes
        // over the existing row instead of duplicating it.
        let row = sqlx::query(
            r#"
            INSERT INTO behaviour_workflow_items (
                workflow_id, behaviour_idx, phase, item_key, status, attempts,
                last_error, payload, blog_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT ON CONSTRAINT uq_workflow_items DO UPDATE
            SET status = EXCLUDED.status,
                attempts = EXCLUDED.attempts,
                last_error = EXCLUDED.last_error,
                payload = EXCLUDED.payload,
                updated_at = now()
            RETURNING id, created_at
            "#,
        )
        .bind(item.workflow_id)
        .bind(item.behaviour_idx as i32)
        .bind(item.phase as i32)
        .bind(&item.item_key)
        .bind(item.status.as_str())
        .bind(item.attempts as i32)
        .bind(&item.last_error)
        .bind(&item.payload)
        .bind(item.blog_id)
        .fetch_one(&self.pool)
        .await?;

        item.id = Some(row.try_get("id")?);
        item.created_at = row.try_get("created_at")?;
        Ok(())
    }

    async fn transfer(&self, item_ids: &[i64], to_workflow_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE behaviour_workflow_items
            SET workflow_id = $2,
                status = 'pending',
                attempts = 0,
                last_error = NULL,
                updated_at = now()
            WHERE id = ANY($1)
            "#,
        )
        .bind(item_ids)
        .bind(to_workflow_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for PgStore {
    async fn begin(&self, audit: &CommandAudit) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO command_audit (
                command_id, correlation_id, command_name, status, source, source_id,
                started_at, parameters, events, environment, blog_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, '[]', $9, $10)
            ON CONFLICT (command_id) DO NOTHING
            "#,
        )
        .bind(audit.command_id)
        .bind(audit.correlation_id)
        .bind(&audit.command_name)
        .bind(audit.status.as_str())
        .bind(audit.source.as_str())
        .bind(&audit.source_id)
        .bind(audit.started_at)
        .bind(&audit.parameters)
        .bind(&audit.environment)
        .bind(audit.blog_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete(&self, audit: &CommandAudit) -> Result<()> {
        let events = serde_json::to_value(&audit.events)?;
        sqlx::query(
            r#"
            UPDATE command_audit
            SET status = $2,
                finished_at = $3,
                duration_ms = $4,
                peak_memory_bytes = $5,
                events = $6,
                error_kind = $7,
                error_message = $8,
                error_code = $9
            WHERE command_id = $1
            "#,
        )
        .bind(audit.command_id)
        .bind(audit.status.as_str())
        .bind(audit.finished_at)
        .bind(audit.duration_ms)
        .bind(audit.peak_memory_bytes)
        .bind(&events)
        .bind(audit.error.as_ref().map(|e| e.kind.clone()))
        .bind(audit.error.as_ref().map(|e| e.message.clone()))
        .bind(audit.error.as_ref().and_then(|e| e.code.clone()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl LockStore for PgStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        // Clear an expired holder first so the insert below can win.
        sqlx::query("DELETE FROM named_locks WHERE lock_key = $1 AND locked_until <= now()")
            .bind(key)
            .execute(&self.pool)
            .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO named_locks (lock_key, locked_until)
            VALUES ($1, now() + ($2 * interval '1 second'))
            ON CONFLICT (lock_key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM named_locks WHERE lock_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// A command transaction over PostgreSQL.
///
/// Business writes and outbox writes share this transaction; dropping it
/// without committing rolls back both.
pub struct PgTxn {
    tx: Transaction<'static, Postgres>,
}

impl PgTxn {
    /// The underlying transaction, for handler business writes.
    pub fn pg(&mut self) -> &mut Transaction<'static, Postgres> {
        &mut self.tx
    }
}

#[async_trait]
impl OutboxWriter for PgTxn {
    async fn write_entry(&mut self, entry: NewOutboxEntry) -> Result<Uuid> {
        let event_id = Uuid::new_v4();
        insert_outbox(&mut *self.tx, &entry, event_id).await?;
        Ok(event_id)
    }

    async fn cancel_duplicates(
        &mut self,
        event_type: &str,
        _payload_signature: Option<&str>,
    ) -> Result<u64> {
        cancel_duplicates_sql(&mut *self.tx, event_type).await
    }
}

impl CommandTxn for PgTxn {
    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

impl CommandStore for PgStore {
    type Txn = PgTxn;

    async fn begin(&self) -> Result<Self::Txn> {
        let tx = self.pool.begin().await?;
        Ok(PgTxn { tx })
    }
}
