//! Configuration for the outbox, runners, workflows, and locks.
//!
//! All structs deserialize with serde defaults, so partial configuration
//! files work: any omitted field falls back to the documented default.

use std::time::Duration;

use serde::Deserialize;

use crate::outbox::RetryPolicy;

/// Configuration for the transactional outbox and its processor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Pending rows claimed per processor batch. Default: 50.
    pub batch_size: u32,

    /// Maximum publish attempts before an entry moves to the DLQ.
    /// Includes the initial attempt. Default: 5.
    pub max_attempts: u32,

    /// Base delay for exponential retry backoff. Default: 60 seconds.
    pub base_retry_delay_seconds: u64,

    /// Backoff multiplier applied per failed attempt. Default: 2.0.
    pub retry_multiplier: f64,

    /// Cap on the retry delay. Default: 3600 seconds.
    pub max_retry_delay_seconds: u64,

    /// Interval between processor batches. Default: 30 seconds.
    pub processor_interval_seconds: u64,

    /// Claim lease length; an entry whose lease expired is eligible for
    /// another worker. Default: 300 seconds.
    pub lock_timeout_seconds: u64,

    /// Queue group used when an entry names no queue of its own.
    pub default_group: String,

    /// Prefix for job names handed to the async queue
    /// (`{prefix}_integration_{action}`).
    pub job_prefix: String,

    /// Payloads above this size may be routed to the external sink.
    /// Default: 50_000 bytes.
    pub max_in_process_bytes: i64,

    /// Route oversized payloads to the external sink even when the entry
    /// asks for in-process transport. Default: false.
    pub route_large_payloads_external: bool,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_attempts: 5,
            base_retry_delay_seconds: 60,
            retry_multiplier: 2.0,
            max_retry_delay_seconds: 3600,
            processor_interval_seconds: 30,
            lock_timeout_seconds: 300,
            default_group: "flywheel-outbox".to_owned(),
            job_prefix: "flywheel".to_owned(),
            max_in_process_bytes: 50_000,
            route_large_payloads_external: false,
        }
    }
}

impl OutboxConfig {
    /// The retry policy derived from the backoff fields.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_secs(self.base_retry_delay_seconds),
            multiplier: self.retry_multiplier,
            max_delay: Duration::from_secs(self.max_retry_delay_seconds),
        }
    }

    /// Claim lease length as a [`Duration`].
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    /// Processor poll interval as a [`Duration`].
    pub fn processor_interval(&self) -> Duration {
        Duration::from_secs(self.processor_interval_seconds)
    }
}

/// Resource budget configuration for the long-process and workflow runners.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Wall-clock budget per worker invocation. Default: 25 seconds.
    pub max_execution_seconds: u64,

    /// Fraction of the memory cap at which the runner yields. Default: 0.8.
    pub memory_limit_percent: f64,

    /// The memory cap the percentage applies to. Default: 256 MiB.
    pub memory_cap_bytes: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_execution_seconds: 25,
            memory_limit_percent: 0.8,
            memory_cap_bytes: 256 * 1024 * 1024,
        }
    }
}

impl RunnerConfig {
    /// Wall-clock budget as a [`Duration`].
    pub fn max_execution(&self) -> Duration {
        Duration::from_secs(self.max_execution_seconds)
    }
}

/// Configuration for the behaviour workflow runner.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Retries per behaviour step before the failure is terminal
    /// (or forked). Default: 3.
    pub max_retries: u32,

    /// Delay before a rescheduled workflow runs again. Default: 5 seconds.
    pub reschedule_interval_seconds: u64,

    /// Delay before a forked child workflow first runs. Default: 30 seconds.
    pub fork_delay_seconds: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            reschedule_interval_seconds: 5,
            fork_delay_seconds: 30,
        }
    }
}

impl WorkflowConfig {
    /// Reschedule delay as a [`Duration`].
    pub fn reschedule_interval(&self) -> Duration {
        Duration::from_secs(self.reschedule_interval_seconds)
    }

    /// Fork delay as a [`Duration`].
    pub fn fork_delay(&self) -> Duration {
        Duration::from_secs(self.fork_delay_seconds)
    }
}

/// Configuration for the named lock primitive.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock TTL, clamped to 1–60 seconds at acquisition. Default: 30.
    pub duration_seconds: u64,

    /// Acquisition attempts, clamped to at most 20. Default: 10.
    pub retries: u32,

    /// Sleep between attempts, at least 125 ms. Default: 1000 ms.
    pub retry_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            duration_seconds: 30,
            retries: 10,
            retry_interval_ms: 1000,
        }
    }
}

/// Aggregate configuration for the whole crate.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FlywheelConfig {
    /// Outbox and processor options.
    pub outbox: OutboxConfig,
    /// Runner resource budget options.
    pub runner: RunnerConfig,
    /// Behaviour workflow options.
    pub workflow: WorkflowConfig,
    /// Named lock options.
    pub lock: LockConfig,
}
