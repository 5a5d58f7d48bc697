//! Cooperative resource budget for runner invocations.
//!
//! Runners execute as queue workers with bounded time and memory. Instead
//! of cancelling work mid-step, a [`ResourceBudget`] is consulted *between*
//! steps (or ledger items); when it reports exceeded, the runner persists
//! its position and enqueues a continuation job.

use std::time::{Duration, Instant};

use crate::config::RunnerConfig;

/// Tracks elapsed wall-clock time and process memory against the
/// configured limits.
#[derive(Debug, Clone)]
pub struct ResourceBudget {
    started_at: Instant,
    max_execution: Duration,
    memory_cap_bytes: u64,
    memory_limit_percent: f64,
}

impl ResourceBudget {
    /// Start a budget clock for one worker invocation.
    pub fn start(config: &RunnerConfig) -> Self {
        Self {
            started_at: Instant::now(),
            max_execution: config.max_execution(),
            memory_cap_bytes: config.memory_cap_bytes,
            memory_limit_percent: config.memory_limit_percent,
        }
    }

    /// A budget that is exceeded immediately. Useful for forcing the
    /// reschedule path.
    pub fn exhausted() -> Self {
        Self {
            started_at: Instant::now(),
            max_execution: Duration::ZERO,
            memory_cap_bytes: 0,
            memory_limit_percent: 1.0,
        }
    }

    /// Whether either limit has been reached.
    ///
    /// True when elapsed time has reached the execution budget, or the
    /// current resident set has reached `memory_limit_percent` of the cap.
    pub fn exceeded(&self) -> bool {
        if self.started_at.elapsed() >= self.max_execution {
            return true;
        }

        match current_rss_bytes() {
            Some(rss) => {
                let threshold = (self.memory_cap_bytes as f64) * self.memory_limit_percent;
                (rss as f64) >= threshold
            }
            None => false,
        }
    }

    /// Elapsed wall-clock time since the budget started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Current resident set size of this process, if the platform exposes it.
#[cfg(target_os = "linux")]
pub fn current_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

/// Current resident set size of this process, if the platform exposes it.
#[cfg(not(target_os = "linux"))]
pub fn current_rss_bytes() -> Option<u64> {
    None
}
