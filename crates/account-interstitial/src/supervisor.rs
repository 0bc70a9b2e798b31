use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::StoreError;

/// Runs fire-and-forget side effects (confirmation emails) on the runtime.
///
/// Tasks are detached: dropping the supervisor, or every clone of it, never
/// cancels them. Failures are logged and counted, never propagated to the
/// request that spawned them. Finished tasks are reaped on the next spawn.
#[derive(Clone, Default)]
pub struct TaskSupervisor {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    failures: AtomicUsize,
    completed_since_drain: AtomicUsize,
    failed_since_drain: AtomicUsize,
}

/// Summary returned by [`TaskSupervisor::drain`]: tasks settled since the
/// previous drain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub failed: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Settled {
    Running,
    Succeeded,
    Failed,
}

/// Records the task's end state when the task body is dropped, including
/// drops caused by a panic or by runtime shutdown.
struct Settlement {
    label: &'static str,
    state: Settled,
    counters: Arc<Counters>,
}

impl Drop for Settlement {
    fn drop(&mut self) {
        let counters = &self.counters;
        counters.completed_since_drain.fetch_add(1, Ordering::SeqCst);
        if self.state == Settled::Succeeded {
            return;
        }
        if self.state == Settled::Running {
            error!(task = self.label, "Background task panicked or was cancelled");
        }
        counters.failures.fetch_add(1, Ordering::SeqCst);
        counters.failed_since_drain.fetch_add(1, Ordering::SeqCst);
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` in the background; must be called inside a tokio runtime.
    pub fn spawn<F>(&self, label: &'static str, task: F)
    where
        F: Future<Output = Result<(), StoreError>> + Send + 'static,
    {
        let mut settlement = Settlement {
            label,
            state: Settled::Running,
            counters: self.counters.clone(),
        };
        let handle = tokio::spawn(async move {
            match task.await {
                Ok(()) => {
                    debug!(task = label, "Background task finished");
                    settlement.state = Settled::Succeeded;
                }
                Err(e) => {
                    error!(task = label, error = %e, "Background task failed");
                    settlement.state = Settled::Failed;
                }
            }
        });

        let mut handles = self.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Number of tasks still running.
    pub fn pending(&self) -> usize {
        let mut handles = self.lock();
        handles.retain(|h| !h.is_finished());
        handles.len()
    }

    /// Total failures observed since creation.
    pub fn failures(&self) -> usize {
        self.counters.failures.load(Ordering::SeqCst)
    }

    /// Await every outstanding task and report what settled since the last drain.
    pub async fn drain(&self) -> DrainReport {
        let handles = std::mem::take(&mut *self.lock());
        for handle in handles {
            // Panics are already counted by the task's settlement.
            let _ = handle.await;
        }

        DrainReport {
            completed: self.counters.completed_since_drain.swap(0, Ordering::SeqCst),
            failed: self.counters.failed_since_drain.swap(0, Ordering::SeqCst),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn failures_are_counted_not_raised() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("ok", async { Ok(()) });
        supervisor.spawn("bad", async { Err(StoreError::Delivery("smtp down".into())) });

        let report = supervisor.drain().await;
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(supervisor.failures(), 1);
        assert_eq!(supervisor.pending(), 0);
    }

    #[tokio::test]
    async fn clones_share_the_task_set() {
        let supervisor = TaskSupervisor::new();
        let clone = supervisor.clone();
        clone.spawn("ok", async { Ok(()) });
        assert_eq!(supervisor.drain().await.completed, 1);
    }

    #[tokio::test]
    async fn dropping_supervisor_leaves_tasks_running() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("send", async move {
            tokio::task::yield_now().await;
            let _ = tx.send(());
            Ok(())
        });
        drop(supervisor);

        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn finished_tasks_are_reaped_without_drain() {
        let supervisor = TaskSupervisor::new();
        for _ in 0..1000 {
            supervisor.spawn("ok", async { Ok(()) });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(supervisor.pending(), 0);
        let report = supervisor.drain().await;
        assert_eq!(report.completed, 1000);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn panicking_task_counts_as_failure() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("boom", async {
            if true {
                panic!("renderer exploded");
            }
            Ok(())
        });

        let report = supervisor.drain().await;
        assert_eq!(report.failed, 1);
        assert_eq!(supervisor.failures(), 1);
    }

    #[tokio::test]
    async fn drain_reports_only_new_settlements() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("first", async { Err(StoreError::Delivery("down".into())) });
        assert_eq!(supervisor.drain().await.failed, 1);

        supervisor.spawn("second", async { Ok(()) });
        let report = supervisor.drain().await;
        assert_eq!(report, DrainReport { completed: 1, failed: 0 });
        assert_eq!(supervisor.failures(), 1);
    }
}
