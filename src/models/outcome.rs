//! Batch outcomes and run summaries
//!
//! Defines how a single batch ended and the aggregate view of a whole run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::AppName;

/// Process exit status for a fully successful run
pub const EXIT_SUCCESS: i32 = 0;
/// Process exit status when any batch failed or faulted
pub const EXIT_FAILURE: i32 = 1;
/// Process exit status for configuration or provisioning errors
pub const EXIT_CONFIG_ERROR: i32 = 2;
/// Process exit status for a run stopped by an interrupt
pub const EXIT_INTERRUPTED: i32 = 130;

/// Terminal state of one batch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BatchOutcome {
    /// The test runner exited successfully
    Passed,
    /// The test runner exited with a nonzero status
    Failed { exit_code: Option<i32> },
    /// Abandoned or killed because of shutdown
    Cancelled,
    /// Panic or runner error caught at the unit boundary
    Fault { message: String },
}

impl BatchOutcome {
    pub fn symbol(&self) -> &'static str {
        match self {
            BatchOutcome::Passed => "✓",
            BatchOutcome::Failed { .. } => "✗",
            BatchOutcome::Cancelled => "○",
            BatchOutcome::Fault { .. } => "!",
        }
    }

    /// Failures and faults both count against the run
    pub fn is_failure(&self) -> bool {
        matches!(self, BatchOutcome::Failed { .. } | BatchOutcome::Fault { .. })
    }
}

impl fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchOutcome::Passed => write!(f, "PASS"),
            BatchOutcome::Failed { exit_code } => match exit_code {
                Some(code) => write!(f, "FAIL ({code})"),
                None => write!(f, "FAIL (signal)"),
            },
            BatchOutcome::Cancelled => write!(f, "CANCELLED"),
            BatchOutcome::Fault { .. } => write!(f, "FAULT"),
        }
    }
}

/// Recorded result of one dispatched batch
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch: usize,
    pub apps: Vec<AppName>,
    pub outcome: BatchOutcome,
    pub duration_ms: u64,
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let apps = self
            .apps
            .iter()
            .map(AppName::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        write!(
            f,
            "{} Batch {} {} [{}ms] {}",
            self.outcome.symbol(),
            self.batch,
            self.outcome,
            self.duration_ms,
            apps
        )?;
        if let BatchOutcome::Fault { message } = &self.outcome {
            write!(f, " - {message}")?;
        }
        Ok(())
    }
}

/// Aggregate result of a scheduler run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub planned: usize,
    pub dispatched: usize,
    pub passed: usize,
    pub failed: usize,
    pub faulted: usize,
    pub cancelled: usize,
    /// Set when any batch failed, faulted or was lost
    pub any_failure: bool,
    pub interrupted: bool,
    pub duration_ms: u64,
    pub reports: Vec<BatchReport>,
}

impl RunSummary {
    /// True only if no batch failed or faulted and the run was not interrupted
    pub fn is_success(&self) -> bool {
        !self.any_failure && !self.interrupted
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            EXIT_SUCCESS
        } else if self.any_failure {
            EXIT_FAILURE
        } else {
            EXIT_INTERRUPTED
        }
    }

    pub fn pass_rate(&self) -> f64 {
        if self.dispatched == 0 {
            0.0
        } else {
            (self.passed as f64 / self.dispatched as f64) * 100.0
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run started {}", self.started_at.to_rfc3339())?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        for report in &self.reports {
            writeln!(f, "  {report}")?;
        }
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(
            f,
            "Batches: {}/{} dispatched | Pass: {} | Fail: {} | Fault: {} | Cancelled: {}",
            self.dispatched, self.planned, self.passed, self.failed, self.faulted, self.cancelled
        )?;
        writeln!(
            f,
            "Pass Rate: {:.1}% | Duration: {}ms{}",
            self.pass_rate(),
            self.duration_ms,
            self.interrupted
                .then_some(" | INTERRUPTED")
                .unwrap_or_default()
        )
    }
}
