//! Error types for flywheel.

use thiserror::Error;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in flywheel operations.
///
/// Variants follow the failure taxonomy of the framework:
///
/// | Kind | Retried? | Surfaced to |
/// |------|----------|-------------|
/// | [`BusinessConstraint`](Error::BusinessConstraint) | no | caller |
/// | [`Invariant`](Error::Invariant) | no | operator (fatal) |
/// | [`RefNotFound`](Error::RefNotFound) | no | caller |
/// | [`IncorrectUsage`](Error::IncorrectUsage) | no | developer |
/// | [`Query`](Error::Query) | by the outer retry fabric | caller |
/// | [`LockUnavailable`](Error::LockUnavailable) | caller's choice | caller |
#[derive(Debug, Error)]
pub enum Error {
    /// A domain rule rejected the operation. Never retried.
    #[error("business constraint violated: {0}")]
    BusinessConstraint(String),

    /// State that should never occur was detected. Fatal, never retried.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A referenced row does not exist.
    #[error("{entity} not found: {id}")]
    RefNotFound {
        /// The entity kind that was looked up.
        entity: &'static str,
        /// The identifier that missed.
        id: String,
    },

    /// Programming misuse: missing configuration, wrong call order,
    /// unregistered handler. Surfaces to the developer, never retried.
    #[error("incorrect usage: {0}")]
    IncorrectUsage(String),

    /// Failed to serialize or deserialize a persisted payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database-level failure.
    ///
    /// Preserves the full `sqlx::Error` for matching on specific conditions
    /// (connection timeout, constraint violation, etc.).
    #[cfg(feature = "postgres")]
    #[error("query error: {0}")]
    Query(#[from] sqlx::Error),

    /// A named lock could not be acquired within the retry budget.
    #[error("could not acquire lock '{key}' after {attempts} attempts")]
    LockUnavailable {
        /// The fully qualified lock key (`prefix:name`).
        key: String,
        /// Number of acquisition attempts made.
        attempts: u32,
    },

    /// A forward process step failed, triggering compensation.
    #[error("step '{step}' failed: {message}")]
    StepFailed {
        /// The step that threw.
        step: String,
        /// The failure message, also persisted on the process.
        message: String,
    },

    /// A compensation step failed. The process is marked failed and the
    /// error resurfaces to the worker.
    #[error("compensation '{step}' failed: {message}")]
    CompensationFailed {
        /// The compensation step that threw.
        step: String,
        /// The failure message.
        message: String,
    },

    /// An entry required external publishing but no sink handled it.
    #[error("external publish failed: {0}")]
    ExternalPublish(String),

    /// An outbox publish attempt failed; the processor schedules a retry
    /// or moves the entry to the dead letter queue.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Process type was not registered in the process registry.
    #[error("unknown process type: {0}")]
    UnknownProcessType(String),

    /// Behaviour kind was not registered in the behaviour registry.
    #[error("unknown behaviour kind: {0}")]
    UnknownBehaviour(String),

    /// Command name was not registered on the command bus.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// A process type, behaviour kind, or command was registered twice.
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),
}

impl Error {
    /// Create a [`Error::RefNotFound`] with a displayable id.
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Error::RefNotFound {
            entity,
            id: id.to_string(),
        }
    }
}
