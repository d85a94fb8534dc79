use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Debug, Default)]
struct TaskSupervisorState {
    running: AtomicU64,
    /// Cancelled when stop is requested.
    stop: CancellationToken,
    /// Cancelled once stop was requested and every tracked task has returned.
    stopped: CancellationToken,
}

/// Owns the background tasks of a client or server.
///
/// Every accept loop, connection loop, reaper and watch loop is spawned through
/// [`spawn`](Self::spawn), so a single [`stop`](Self::stop) winds them all down
/// and [`all_stopped`](Self::all_stopped) resolves when the last one returns.
#[derive(Debug)]
pub struct TaskSupervisor(Arc<TaskSupervisorState>);

/// Keeps a task counted as running until dropped.
#[derive(Debug)]
pub struct TaskSupervisorGuard(Arc<TaskSupervisorState>);

impl TaskSupervisorState {
    fn finish_async_task(&self) {
        let running = self.running.fetch_sub(1, Ordering::AcqRel) - 1;
        if running == 0 {
            self.stopped.cancel();
        }
    }
}

impl TaskSupervisor {
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn create() -> Self {
        let supervisor = Self(Arc::default());

        // Holds the running count above zero until stop is requested, so
        // `all_stopped` cannot fire while the supervisor is idle.
        let guard = supervisor.start_async_task();
        tokio::spawn(async move {
            guard.stopped().await;
        });

        supervisor
    }

    pub fn stop(&self) {
        self.0.stop.cancel();
    }

    /// A token cancelled together with this supervisor, which can also be
    /// cancelled on its own.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.0.stop.child_token()
    }

    pub fn all_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stopped.cancelled()
    }

    #[must_use]
    pub fn start_async_task(&self) -> TaskSupervisorGuard {
        self.0.running.fetch_add(1, Ordering::AcqRel);
        TaskSupervisorGuard(self.0.clone())
    }

    /// Spawns `task`, abandoning it as soon as stop is requested.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.start_async_task();
        tokio::spawn(async move {
            tokio::select! {
                () = guard.stopped() => {}
                () = task => {}
            }
        });
    }

    #[must_use]
    pub fn running(&self) -> u64 {
        self.0.running.load(Ordering::Acquire)
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskSupervisorGuard {
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }
}

impl Drop for TaskSupervisorGuard {
    fn drop(&mut self) {
        self.0.finish_async_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_task_supervisor() {
        let task_supervisor = TaskSupervisor::create();
        assert_eq!(task_supervisor.running(), 1);

        let token = task_supervisor.child_token();
        task_supervisor.stop();
        assert!(token.is_cancelled());
        task_supervisor.all_stopped().await;
        assert_eq!(task_supervisor.running(), 0);
    }

    #[tokio::test]
    async fn test_spawned_task_is_cancelled_on_stop() {
        let task_supervisor = TaskSupervisor::create();
        let token = task_supervisor.child_token();
        task_supervisor.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert_eq!(task_supervisor.running(), 2);

        task_supervisor.stop();
        tokio::time::timeout(Duration::from_secs(5), task_supervisor.all_stopped())
            .await
            .unwrap();
        assert!(token.is_cancelled());
    }
}
