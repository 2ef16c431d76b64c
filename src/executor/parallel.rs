//! Bounded-concurrency batch scheduler
//!
//! Dispatches batches onto a fixed number of slots, isolates every unit's
//! faults from its siblings, and stops dispatching once the run is
//! cancelled while letting in-flight units finish.

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::runner::TaskRunner;
use super::state::{RunState, WorkTracker};
use super::throttle::{RateShaper, Wait};
use crate::backend::BackendTarget;
use crate::models::{Batch, BatchOutcome, BatchReport, RunSummary};

/// Runs batches with at most `concurrency` executing at once
pub struct Scheduler<R: TaskRunner> {
    runner: Arc<R>,
    shaper: Arc<RateShaper>,
    concurrency: usize,
    dispatch_pause: Duration,
}

impl<R: TaskRunner> Scheduler<R> {
    pub fn new(runner: R, shaper: RateShaper, concurrency: usize) -> Self {
        Self {
            runner: Arc::new(runner),
            shaper: Arc::new(shaper),
            concurrency: concurrency.max(1),
            dispatch_pause: Duration::ZERO,
        }
    }

    /// Pause between launches to spread arrivals at the backend
    pub fn with_dispatch_pause(mut self, pause: Duration) -> Self {
        self.dispatch_pause = pause;
        self
    }

    /// Dispatch `batches` in order and wait for every dispatched unit.
    ///
    /// Once `cancel` fires nothing new is dispatched; units already running
    /// still reach a terminal state before this returns.
    pub async fn run(
        &self,
        batches: Vec<Batch>,
        target: BackendTarget,
        cancel: &CancellationToken,
        tracker: &WorkTracker,
    ) -> RunSummary {
        let started_at = Utc::now();
        let start = Instant::now();
        let planned = batches.len();
        let pool = Arc::new(Semaphore::new(self.concurrency));
        let state = Arc::new(RunState::new());
        let target = Arc::new(target);

        info!(
            "Dispatching {} batches (max {} concurrent)",
            planned, self.concurrency
        );

        let mut handles = Vec::with_capacity(planned);

        for (position, batch) in batches.into_iter().enumerate() {
            if batch.is_empty() {
                debug!("Skipping empty batch {}", batch.index());
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(
                        "Cancelled; not dispatching the remaining {} batches",
                        planned - position
                    );
                    break;
                }
                permit = pool.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let work = tracker.begin();
            state.record_dispatch();
            debug!("Dispatching {}", batch);

            let unit = Unit {
                runner: self.runner.clone(),
                shaper: self.shaper.clone(),
                state: state.clone(),
                target: target.clone(),
                cancel: cancel.clone(),
            };

            handles.push(tokio::spawn(async move {
                // Both released on every exit path, panics included.
                let _permit = permit;
                let _work = work;
                unit.execute(batch).await;
            }));

            if !self.dispatch_pause.is_zero() && position + 1 < planned {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    _ = sleep(self.dispatch_pause) => {}
                }
            }
        }

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Batch unit ended abnormally: {}", e);
                state.record_lost_unit();
            }
        }
        tracker.wait_idle().await;

        let interrupted = cancel.is_cancelled();
        let summary = state.summarize(planned, interrupted, started_at, start.elapsed());

        info!(
            "Run done in {}ms: {}/{} dispatched, {} passed, {} failed, {} faulted, {} cancelled",
            summary.duration_ms,
            summary.dispatched,
            summary.planned,
            summary.passed,
            summary.failed,
            summary.faulted,
            summary.cancelled
        );

        summary
    }
}

/// One dispatched batch and the shared handles it needs
struct Unit<R: TaskRunner> {
    runner: Arc<R>,
    shaper: Arc<RateShaper>,
    state: Arc<RunState>,
    target: Arc<BackendTarget>,
    cancel: CancellationToken,
}

impl<R: TaskRunner> Unit<R> {
    /// Run the batch and record its outcome; never panics outward
    async fn execute(self, batch: Batch) {
        let start = Instant::now();

        let outcome = match AssertUnwindSafe(self.process(&batch)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Batch {} panicked: {}", batch.index(), message);
                BatchOutcome::Fault { message }
            }
        };

        match &outcome {
            BatchOutcome::Passed => info!("Batch {} passed", batch.index()),
            BatchOutcome::Failed { exit_code } => {
                error!("Batch {} failed (exit code {:?})", batch.index(), exit_code)
            }
            BatchOutcome::Cancelled => info!("Batch {} cancelled", batch.index()),
            BatchOutcome::Fault { .. } => {}
        }

        self.state.record(BatchReport {
            batch: batch.index(),
            apps: batch.apps().to_vec(),
            outcome,
            duration_ms: start.elapsed().as_millis() as u64,
        });
    }

    async fn process(&self, batch: &Batch) -> BatchOutcome {
        if self.shaper.wait_before_batch(batch, &self.cancel).await == Wait::Abandoned {
            info!("Batch {}: cancelled before start", batch.index());
            return BatchOutcome::Cancelled;
        }

        match self.runner.run(batch, &self.target, &self.cancel).await {
            Ok(status) => status.into_outcome(),
            Err(e) => {
                let message = format!("{:#}", anyhow::Error::from(e));
                error!("Batch {} failed with error: {}", batch.index(), message);
                BatchOutcome::Fault { message }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
