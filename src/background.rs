//! Process-scoped background work.
//!
//! Storage after a miss, SWR refreshes, and mutation-driven purges must
//! outlive the request that triggered them: a client disconnect must not
//! cancel them. [`BackgroundTasks`] runs them under a process-scoped
//! cancellation token tied to handler shutdown instead of any request.
//! On shutdown, in-flight tasks get a bounded drain window to finish;
//! whatever remains is cancelled and logged.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Spawns and tracks background tasks detached from request lifetimes.
#[derive(Clone)]
pub struct BackgroundTasks {
    token: CancellationToken,
    active: Arc<AtomicUsize>,
    drain_window: Duration,
}

impl BackgroundTasks {
    /// Create a context with the default 5 second drain window.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            active: Arc::new(AtomicUsize::new(0)),
            drain_window: Duration::from_secs(5),
        }
    }

    /// Override how long shutdown waits for in-flight tasks.
    pub fn with_drain_window(mut self, window: Duration) -> Self {
        self.drain_window = window;
        self
    }

    /// Number of tasks currently in flight.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run a fallible task on the process-scoped context.
    ///
    /// Task errors are logged, never propagated; a task still running when
    /// the context is cancelled is abandoned with a context-cancelled log
    /// line. Tasks spawned after shutdown are dropped.
    pub fn spawn<F>(&self, task: &'static str, future: F)
    where
        F: Future<Output = crate::error::Result<()>> + Send + 'static,
    {
        if self.token.is_cancelled() {
            debug!(task, "handler shut down, dropping background task");
            return;
        }

        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(self.active.clone());
        let token = self.token.clone();

        tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                result = future => {
                    if let Err(e) = result {
                        warn!(task, error = %e, "background task failed");
                    }
                }
                _ = token.cancelled() => {
                    warn!(task, "background task abandoned: context cancelled");
                }
            }
        });
    }

    /// Drain in-flight tasks for up to the configured window, then cancel
    /// the context.
    pub async fn shutdown(&self) {
        let start = Instant::now();
        while self.active_count() > 0 && start.elapsed() < self.drain_window {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let remaining = self.active_count();
        if remaining > 0 {
            warn!(
                remaining,
                "drain window elapsed, cancelling remaining background tasks"
            );
        }

        self.token.cancel();
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
