//! Interrupt handling and exactly-once teardown
//!
//! An interrupt cancels the run token, waits for dispatched batches to reach
//! a terminal state, and then releases the backend. Normal completion goes
//! through [`ShutdownCoordinator::finish`]. Whichever path arrives first
//! runs the teardown; every later request is a no-op that waits for it.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::executor::WorkTracker;

enum Teardown {
    Armed(Option<BoxFuture<'static, ()>>),
    Done,
}

struct Inner {
    token: CancellationToken,
    tracker: WorkTracker,
    interrupts: AtomicUsize,
    teardown: Mutex<Teardown>,
}

/// Process-wide shutdown state; clones share it
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                tracker: WorkTracker::new(),
                interrupts: AtomicUsize::new(0),
                teardown: Mutex::new(Teardown::Armed(None)),
            }),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub fn tracker(&self) -> &WorkTracker {
        &self.inner.tracker
    }

    /// Register the release action. If teardown already happened the
    /// action runs right away so nothing acquired late is leaked.
    pub async fn set_teardown<F>(&self, teardown: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.inner.teardown.lock().await;
        match &mut *state {
            Teardown::Armed(slot) => {
                if slot.replace(Box::pin(teardown)).is_some() {
                    warn!("Replacing a previously registered teardown");
                }
            }
            Teardown::Done => {
                drop(state);
                info!("Shutdown already completed; releasing immediately");
                teardown.await;
            }
        }
    }

    /// Cancel the run, wait for in-flight work, then tear down.
    ///
    /// Only the first call does anything; repeated interrupts are logged.
    pub async fn interrupt(&self) {
        if self.inner.interrupts.fetch_add(1, Ordering::SeqCst) > 0 {
            warn!("Interrupt already in progress; waiting for running batches");
            return;
        }

        info!("Interrupt received; no further batches will be dispatched");
        self.inner.token.cancel();

        let outstanding = self.inner.tracker.outstanding();
        if outstanding > 0 {
            info!("Waiting for {} running batches to stop", outstanding);
        }
        self.inner.tracker.wait_idle().await;
        self.teardown().await;
    }

    /// Normal completion path
    pub async fn finish(&self) {
        self.inner.tracker.wait_idle().await;
        self.teardown().await;
    }

    async fn teardown(&self) {
        // Held for the whole teardown so concurrent callers wait for it.
        let mut state = self.inner.teardown.lock().await;
        if let Teardown::Armed(Some(teardown)) = std::mem::replace(&mut *state, Teardown::Done) {
            info!("Tearing down");
            teardown.await;
        }
    }

    /// Interrupt once `signal` resolves
    pub fn listen<S>(&self, signal: S) -> JoinHandle<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let coordinator = self.clone();
        tokio::spawn(async move {
            signal.await;
            coordinator.interrupt().await;
        })
    }

    pub fn listen_for_ctrl_c(&self) -> JoinHandle<()> {
        self.listen(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Unable to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::sleep;

    fn counting_teardown(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = counter.clone();
        async move {
            sleep(Duration::from_millis(20)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_finish_runs_teardown_without_cancelling() {
        let coordinator = ShutdownCoordinator::new();
        let runs = Arc::new(AtomicUsize::new(0));
        coordinator.set_teardown(counting_teardown(&runs)).await;

        coordinator.finish().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!coordinator.token().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_teardown_runs_once_under_double_interrupt_and_finish() {
        let coordinator = ShutdownCoordinator::new();
        let runs = Arc::new(AtomicUsize::new(0));
        coordinator.set_teardown(counting_teardown(&runs)).await;

        let a = tokio::spawn({
            let c = coordinator.clone();
            async move { c.interrupt().await }
        });
        let b = tokio::spawn({
            let c = coordinator.clone();
            async move { c.interrupt().await }
        });
        a.await.unwrap();
        b.await.unwrap();
        coordinator.finish().await;
        coordinator.finish().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(coordinator.token().is_cancelled());
        assert_eq!(coordinator.inner.interrupts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interrupt_waits_for_outstanding_work() {
        let coordinator = ShutdownCoordinator::new();
        let runs = Arc::new(AtomicUsize::new(0));
        coordinator.set_teardown(counting_teardown(&runs)).await;

        let work = coordinator.tracker().begin();
        let interrupt = tokio::spawn({
            let c = coordinator.clone();
            async move { c.interrupt().await }
        });

        sleep(Duration::from_millis(100)).await;
        assert!(coordinator.token().is_cancelled());
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        drop(work);
        interrupt.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_finish_waits_for_concurrent_teardown() {
        let coordinator = ShutdownCoordinator::new();
        let runs = Arc::new(AtomicUsize::new(0));
        coordinator.set_teardown(counting_teardown(&runs)).await;

        tokio::join!(coordinator.interrupt(), coordinator.finish());

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_late_teardown_runs_immediately() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.interrupt().await;

        let runs = Arc::new(AtomicUsize::new(0));
        coordinator.set_teardown(counting_teardown(&runs)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        coordinator.finish().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listen_interrupts_on_signal() {
        let coordinator = ShutdownCoordinator::new();
        let runs = Arc::new(AtomicUsize::new(0));
        coordinator.set_teardown(counting_teardown(&runs)).await;

        let (tx, rx) = oneshot::channel::<()>();
        let listener = coordinator.listen(async move {
            let _ = rx.await;
        });

        assert!(!coordinator.token().is_cancelled());
        tx.send(()).unwrap();
        listener.await.unwrap();

        assert!(coordinator.token().is_cancelled());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
