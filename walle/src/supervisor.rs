use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};

#[derive(Debug, Default)]
struct SupervisorState {
    running: AtomicU64,
    stop: CancellationToken,
    stopped: CancellationToken,
}

impl SupervisorState {
    fn finish_task(&self) {
        let running = self.running.fetch_sub(1, Ordering::AcqRel) - 1;
        if running == 0 {
            self.stopped.cancel();
        }
    }
}

/// Owns a group of background tasks: sweeper, session loops, reconnect
/// loops, discovery watches.
///
/// [`stop`](Self::stop) asks every task to finish and
/// [`all_stopped`](Self::all_stopped) resolves once they have. Dropping the
/// supervisor stops its tasks.
#[derive(Debug)]
pub struct TaskSupervisor(Arc<SupervisorState>);

/// Keeps a supervisor's running count up while alive.
#[derive(Debug)]
pub struct TaskGuard(Arc<SupervisorState>);

impl TaskSupervisor {
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn create() -> Self {
        let supervisor = Self(Arc::default());

        // parks until stop so `all_stopped` never fires on an idle group.
        let guard = supervisor.guard();
        tokio::spawn(async move {
            guard.stopped().await;
        });

        supervisor
    }

    /// Spawns `fut`, which runs until it completes or the supervisor stops.
    pub fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.guard();
        tokio::spawn(async move {
            tokio::select! {
                () = guard.stopped() => {
                    tracing::debug!("{name} stopped");
                }
                () = fut => {}
            }
        });
    }

    pub fn stop(&self) {
        self.0.stop.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.stop.is_cancelled()
    }

    /// Returns a guard that calls [`stop`](Self::stop) when dropped.
    #[must_use]
    pub fn drop_guard(&self) -> DropGuard {
        self.0.stop.clone().drop_guard()
    }

    /// Resolves once stop is requested.
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }

    /// Resolves once every task has finished after a stop.
    pub fn all_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stopped.cancelled()
    }

    fn guard(&self) -> TaskGuard {
        self.0.running.fetch_add(1, Ordering::AcqRel);
        TaskGuard(self.0.clone())
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskGuard {
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.finish_task();
    }
}
