//! Reliability core for Domain-Driven Design services on a relational
//! database.
//!
//! Flywheel provides three tightly coupled subsystems that together
//! guarantee exactly-once-effect event propagation and durable
//! long-running workflows:
//!
//! - **Transactional outbox** — integration events are written to the
//!   outbox table in the same transaction as the command's business
//!   writes; workers drain the outbox to the in-process job queue or an
//!   external bus, with retries, backoff, and a dead letter queue.
//! - **Long-process runner** — a step-oriented saga engine whose
//!   processes suspend on integration events, resume durably, and unwind
//!   completed steps in reverse order when a step fails.
//! - **Behaviour workflow engine** — a batched, ledger-backed workflow
//!   that tracks per-item progress across multi-phase behaviours and can
//!   fork failed items into child workflows.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        CommandBus (C12)                          │
//! │                                                                  │
//! │   audit → correlation → transaction ┬ publish → handler          │
//! │                                     │                            │
//! │                 integration events ─┴→ outbox (same transaction) │
//! └──────────────────────────────┬───────────────────────────────────┘
//!                                │ commit
//!               ┌────────────────▼─────────────────┐
//!               │  OutboxProcessor: claim → publish │
//!               │  → completed | retry | DLQ        │
//!               └────────────────┬─────────────────┘
//!                                │ async queue
//!                ┌───────────────▼────────────────┐
//!                │ ProcessRunner / WorkflowRunner │
//!                │ (suspend, resume, compensate,  │
//!                │  batch, fork, reschedule)      │
//!                └────────────────────────────────┘
//! ```
//!
//! # Concurrency model
//!
//! All coordination goes through the database: outbox claims are leased
//! with skip-locked semantics, a process only resumes from the states
//! that a single worker can reach (`suspended`, `scheduled`), and the
//! work-item ledger is mutated row by row. Correlation state is an owned
//! value carried per task — never a process-wide global. Runners yield
//! cooperatively between steps when the [`budget::ResourceBudget`] is
//! exceeded.
//!
//! # Storage
//!
//! Every engine talks to storage through trait seams. The `postgres`
//! feature (on by default) provides [`PgStore`]; [`MemoryStore`] serves
//! tests and embedded use with the same semantics.

pub mod budget;
pub mod bus;
mod config;
mod correlation;
mod error;
pub mod event;
pub mod lock;
pub mod outbox;
pub mod process;
pub mod queue;
mod runtime;
pub mod store;

pub mod behaviour;

pub use config::{FlywheelConfig, LockConfig, OutboxConfig, RunnerConfig, WorkflowConfig};
pub use correlation::{
    CorrelationContext, Envelope, CORRELATION_ID_KEY, EVENT_ID_KEY, SEQUENCE_KEY,
};
pub use error::{Error, Result};
pub use runtime::OutboxRuntime;

pub use behaviour::{
    BehaviourConfigEntry, BehaviourExecutionResult, BehaviourExecutionStatus, BehaviourHandler,
    BehaviourRegistry, BehaviourWorkflow, BehaviourWorkflowRunner,
};
pub use bus::{Command, CommandBus, CommandHandler, CommandScope, CommandStore, DispatchOptions};
pub use event::{DomainEvent, EventEnvelope, IntegrationEvent, MessageKind, Transport, UnitOfWork};
pub use lock::{LockManager, LockStore, MemoryLockStore};
pub use outbox::{
    OutboxEntry, OutboxProcessor, OutboxPublisher, OutboxStats, OutboxStatus, OutboxStore,
    QueuePublisher, RetryPolicy,
};
pub use process::{
    AwaitEvent, NewProcess, ProcessDefinition, ProcessRecord, ProcessRegistry, ProcessRunner,
    ProcessStatus, ProcessSteps, StepContext, StepOutcome,
};
pub use queue::{JobQueue, MemoryQueue};
pub use store::MemoryStore;
#[cfg(feature = "postgres")]
pub use store::PgStore;
