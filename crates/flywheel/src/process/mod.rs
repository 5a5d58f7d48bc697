//! Long processes: persisted, multi-step workflows with compensation.
//!
//! A long process walks an ordered list of steps, may suspend until an
//! integration event arrives, and unwinds completed steps in reverse
//! order when a step fails. The step schema is frozen into the process
//! row at start ([`ProcessSteps`]); the executable definition lives in a
//! [`ProcessRegistry`](definition::ProcessRegistry) keyed by process type.

mod definition;
mod runner;
mod steps;

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

pub use definition::{
    AwaitEvent, CommandEnvelope, ProcessDefinition, ProcessDefinitionBuilder, ProcessRegistry,
    StepContext, StepOutcome,
};
pub use runner::{CommandSink, NewProcess, NullCommandSink, ProcessRunner, PROCESS_CONTINUE_JOB};
pub use steps::ProcessSteps;

use crate::{Error, Result};

/// Lifecycle status of a long process.
///
/// `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Created but not yet run.
    Pending,
    /// Executing steps.
    Running,
    /// A continuation job is queued.
    Scheduled,
    /// Waiting for an integration event.
    Suspended,
    /// All steps completed.
    Completed,
    /// Failed (after compensation, or because compensation failed).
    Failed,
}

impl ProcessStatus {
    /// Database string representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Scheduled => "scheduled",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse from the database string representation.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "scheduled" => Ok(Self::Scheduled),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(Error::Invariant(format!("invalid process status: {s}"))),
        }
    }

    /// Whether the status permits no further transitions.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A persisted long-process instance.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    /// Row id; `None` until first saved.
    pub id: Option<i64>,
    /// Discriminator resolving the executable definition.
    pub process_type: String,
    /// Constructor arguments, available to every step.
    pub business_data: Value,
    /// Frozen step schema plus cursor state.
    pub steps: ProcessSteps,
    /// Lifecycle status.
    pub status: ProcessStatus,
    /// Event name a suspended process waits for.
    pub waiting_for: Option<String>,
    /// Field-equality criteria a matching event must satisfy.
    pub match_criteria: Option<Value>,
    /// The payload handed from step to step.
    pub payload: Option<Value>,
    /// Correlation id of the operation that started the process.
    pub correlation_id: Uuid,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Row creation time.
    pub created_at: OffsetDateTime,
    /// Last persistence time.
    pub updated_at: OffsetDateTime,
    /// Tenant scope.
    pub blog_id: i64,
}

impl ProcessRecord {
    /// Create an unsaved process instance.
    pub fn new(
        process_type: impl Into<String>,
        business_data: Value,
        steps: ProcessSteps,
        correlation_id: Uuid,
        blog_id: i64,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: None,
            process_type: process_type.into(),
            business_data,
            steps,
            status: ProcessStatus::Pending,
            waiting_for: None,
            match_criteria: None,
            payload: None,
            correlation_id,
            last_error: None,
            created_at: now,
            updated_at: now,
            blog_id,
        }
    }

    /// The name of the step the forward cursor points at (denormalized
    /// into its own column on save).
    pub fn step_name(&self) -> Option<&str> {
        self.steps.current_step()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            ProcessStatus::Pending,
            ProcessStatus::Running,
            ProcessStatus::Scheduled,
            ProcessStatus::Suspended,
            ProcessStatus::Completed,
            ProcessStatus::Failed,
        ] {
            assert_eq!(ProcessStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(ProcessStatus::parse("nope").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(ProcessStatus::Completed.is_terminal());
        assert!(ProcessStatus::Failed.is_terminal());
        assert!(!ProcessStatus::Suspended.is_terminal());
        assert!(!ProcessStatus::Scheduled.is_terminal());
    }
}
