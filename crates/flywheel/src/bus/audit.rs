//! Command audit records.
//!
//! One row per command, written before the handler runs and finalized
//! after — even when the transaction rolled back, since audit is the
//! outermost stage of the pipeline. Storage is a sink seam; the Postgres
//! store provides one, hosts may provide their own.

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::Result;

/// Final status of an audited command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    /// The handler is still running (the preflight row).
    InProgress,
    /// The handler returned successfully.
    Success,
    /// The handler (or the commit) failed.
    Error,
}

impl AuditStatus {
    /// Database string representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Parse from the database string representation.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            _ => Err(crate::Error::Invariant(format!("invalid audit status: {s}"))),
        }
    }
}

/// Who issued a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandSource {
    /// An end user (carry their id in `source_id`).
    User,
    /// A CLI invocation.
    Cli,
    /// The system itself (jobs, runners).
    #[default]
    System,
}

impl CommandSource {
    /// Database string representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Cli => "cli",
            Self::System => "system",
        }
    }

    /// Parse from the database string representation.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "cli" => Ok(Self::Cli),
            "system" => Ok(Self::System),
            _ => Err(crate::Error::Invariant(format!(
                "invalid command source: {s}"
            ))),
        }
    }
}

/// The error triple recorded on a failed command.
#[derive(Debug, Clone)]
pub struct AuditError {
    /// The failure kind (the error taxonomy variant name).
    pub kind: String,
    /// The error message.
    pub message: String,
    /// Optional machine-readable code.
    pub code: Option<String>,
}

/// One audit row per command.
#[derive(Debug, Clone)]
pub struct CommandAudit {
    /// Unique command id, generated by the audit stage.
    pub command_id: Uuid,
    /// Correlation id of the operation.
    pub correlation_id: Uuid,
    /// The command name.
    pub command_name: String,
    /// Current status.
    pub status: AuditStatus,
    /// Who issued the command.
    pub source: CommandSource,
    /// Identifier of the issuer (user id, CLI user, job name).
    pub source_id: Option<String>,
    /// When handling started.
    pub started_at: OffsetDateTime,
    /// When handling finished.
    pub finished_at: Option<OffsetDateTime>,
    /// Handler duration.
    pub duration_ms: Option<i64>,
    /// Peak resident memory observed at completion.
    pub peak_memory_bytes: Option<i64>,
    /// The command parameters with sensitive keys redacted.
    pub parameters: Value,
    /// Names of the events published while handling.
    pub events: Vec<String>,
    /// The failure, when status is `Error`.
    pub error: Option<AuditError>,
    /// Deployment environment label.
    pub environment: String,
    /// Tenant scope.
    pub blog_id: i64,
}

impl CommandAudit {
    /// The preflight row written before the handler runs.
    pub fn start(
        command_id: Uuid,
        correlation_id: Uuid,
        command_name: impl Into<String>,
        source: CommandSource,
        source_id: Option<String>,
        parameters: Value,
        environment: impl Into<String>,
        blog_id: i64,
    ) -> Self {
        Self {
            command_id,
            correlation_id,
            command_name: command_name.into(),
            status: AuditStatus::InProgress,
            source,
            source_id,
            started_at: OffsetDateTime::now_utc(),
            finished_at: None,
            duration_ms: None,
            peak_memory_bytes: None,
            parameters: redact_parameters(parameters),
            events: Vec::new(),
            error: None,
            environment: environment.into(),
            blog_id,
        }
    }

    /// Finalize the row after the handler returned.
    pub fn finish(
        &mut self,
        status: AuditStatus,
        events: Vec<String>,
        error: Option<AuditError>,
    ) {
        let finished = OffsetDateTime::now_utc();
        self.duration_ms = Some(((finished - self.started_at).whole_milliseconds()) as i64);
        self.finished_at = Some(finished);
        self.peak_memory_bytes = crate::budget::current_rss_bytes().map(|b| b as i64);
        self.status = status;
        self.events = events;
        self.error = error;
    }
}

/// Where audit rows go. Request-phase audit storage is host-specific;
/// the Postgres store implements this sink against `command_audit`.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Write the preflight row.
    async fn begin(&self, audit: &CommandAudit) -> Result<()>;

    /// Write the finalized row.
    async fn complete(&self, audit: &CommandAudit) -> Result<()>;
}

/// Sink that drops every record.
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn begin(&self, _audit: &CommandAudit) -> Result<()> {
        Ok(())
    }

    async fn complete(&self, _audit: &CommandAudit) -> Result<()> {
        Ok(())
    }
}

const REDACTED_KEY_MARKERS: [&str; 6] = [
    "password",
    "secret",
    "token",
    "api_key",
    "authorization",
    "credential",
];

/// Replace values of sensitive-looking keys with a marker, recursively.
pub fn redact_parameters(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    let lowered = key.to_lowercase();
                    if REDACTED_KEY_MARKERS.iter().any(|m| lowered.contains(m)) {
                        (key, Value::String("[redacted]".to_owned()))
                    } else {
                        (key, redact_parameters(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(redact_parameters).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redaction_is_recursive_and_case_insensitive() {
        let redacted = redact_parameters(json!({
            "name": "jo",
            "Password": "hunter2",
            "nested": {"api_key": "k", "count": 3},
            "list": [{"token": "t"}],
        }));

        assert_eq!(
            redacted,
            json!({
                "name": "jo",
                "Password": "[redacted]",
                "nested": {"api_key": "[redacted]", "count": 3},
                "list": [{"token": "[redacted]"}],
            })
        );
    }

    #[test]
    fn finish_stamps_duration_and_status() {
        let mut audit = CommandAudit::start(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "create_post",
            CommandSource::User,
            Some("42".into()),
            json!({"title": "hello"}),
            "test",
            0,
        );
        assert_eq!(audit.status, AuditStatus::InProgress);

        audit.finish(AuditStatus::Success, vec!["post_created".into()], None);

        assert_eq!(audit.status, AuditStatus::Success);
        assert!(audit.finished_at.is_some());
        assert!(audit.duration_ms.is_some());
        assert_eq!(audit.events, vec!["post_created"]);
    }

    #[test]
    fn status_and_source_round_trip() {
        for status in [AuditStatus::InProgress, AuditStatus::Success, AuditStatus::Error] {
            assert_eq!(AuditStatus::parse(status.as_str()).unwrap(), status);
        }
        for source in [CommandSource::User, CommandSource::Cli, CommandSource::System] {
            assert_eq!(CommandSource::parse(source.as_str()).unwrap(), source);
        }
    }
}
