//! Shared scheduler state
//!
//! [`RunState`] aggregates batch outcomes; [`WorkTracker`] counts units that
//! have been dispatched but have not yet reached a terminal state.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

use crate::models::{BatchOutcome, BatchReport, RunSummary};

/// Aggregate pass/fail bookkeeping across all batches
#[derive(Debug, Default)]
pub struct RunState {
    dispatched: AtomicUsize,
    passed: AtomicUsize,
    failed: AtomicUsize,
    faulted: AtomicUsize,
    cancelled: AtomicUsize,
    any_failure: AtomicBool,
    reports: Mutex<Vec<BatchReport>>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record(&self, report: BatchReport) {
        let counter = match report.outcome {
            BatchOutcome::Passed => &self.passed,
            BatchOutcome::Failed { .. } => &self.failed,
            BatchOutcome::Fault { .. } => &self.faulted,
            BatchOutcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        if report.outcome.is_failure() {
            self.any_failure.store(true, Ordering::SeqCst);
        }
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report);
    }

    /// A unit ended without recording anything
    pub fn record_lost_unit(&self) {
        self.faulted.fetch_add(1, Ordering::SeqCst);
        self.any_failure.store(true, Ordering::SeqCst);
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }

    /// Final view; reports are ordered by batch number
    pub fn summarize(
        &self,
        planned: usize,
        interrupted: bool,
        started_at: DateTime<Utc>,
        elapsed: Duration,
    ) -> RunSummary {
        let mut reports = self
            .reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        reports.sort_by_key(|r| r.batch);

        RunSummary {
            started_at,
            planned,
            dispatched: self.dispatched(),
            passed: self.passed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            faulted: self.faulted.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            any_failure: self.any_failure.load(Ordering::SeqCst),
            interrupted,
            duration_ms: elapsed.as_millis() as u64,
            reports,
        }
    }
}

/// Outstanding-work counter that can be awaited until it drains
#[derive(Clone, Debug)]
pub struct WorkTracker {
    count: Arc<watch::Sender<usize>>,
}

impl WorkTracker {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    /// Register one unit of work; it is released when the guard drops
    pub fn begin(&self) -> WorkGuard {
        self.count.send_modify(|n| *n += 1);
        WorkGuard {
            count: self.count.clone(),
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolve once no work is outstanding
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for WorkTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the outstanding count on drop, on every exit path
#[derive(Debug)]
pub struct WorkGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AppName;

    fn report(batch: usize, outcome: BatchOutcome) -> BatchReport {
        BatchReport {
            batch,
            apps: vec![AppName::new(format!("app_{batch}"))],
            outcome,
            duration_ms: 1,
        }
    }

    #[test]
    fn test_run_state_counts() {
        let state = RunState::new();
        for _ in 0..4 {
            state.record_dispatch();
        }
        state.record(report(3, BatchOutcome::Passed));
        state.record(report(1, BatchOutcome::Failed { exit_code: Some(1) }));
        state.record(report(2, BatchOutcome::Cancelled));
        let fault = BatchOutcome::Fault {
            message: "x".into(),
        };
        state.record(report(4, fault));

        let summary = state.summarize(6, false, Utc::now(), Duration::from_millis(5));
        assert_eq!(summary.planned, 6);
        assert_eq!(summary.dispatched, 4);
        assert_eq!(
            (summary.passed, summary.failed, summary.faulted, summary.cancelled),
            (1, 1, 1, 1)
        );
        let order: Vec<usize> = summary.reports.iter().map(|r| r.batch).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
        assert!(summary.any_failure);
        assert!(!summary.is_success());
    }

    #[test]
    fn test_cancelled_alone_is_not_failure() {
        let state = RunState::new();
        state.record(report(1, BatchOutcome::Cancelled));
        let summary = state.summarize(1, true, Utc::now(), Duration::ZERO);
        assert!(!summary.any_failure);
        assert_eq!(summary.exit_code(), crate::models::EXIT_INTERRUPTED);
    }

    #[test]
    fn test_lost_unit_counts_as_fault() {
        let state = RunState::new();
        state.record_lost_unit();
        let summary = state.summarize(1, false, Utc::now(), Duration::ZERO);
        assert_eq!(summary.faulted, 1);
        assert!(summary.any_failure);
        assert_eq!(summary.exit_code(), crate::models::EXIT_FAILURE);
    }

    #[test]
    fn test_work_guard_releases_on_drop() {
        let tracker = WorkTracker::new();
        let a = tracker.begin();
        let b = tracker.begin();
        assert_eq!(tracker.outstanding(), 2);
        drop(a);
        assert_eq!(tracker.outstanding(), 1);
        drop(b);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_resolves_after_last_guard() {
        let tracker = WorkTracker::new();
        let guard = tracker.begin();
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_with_nothing_outstanding() {
        WorkTracker::new().wait_idle().await;
    }
}
