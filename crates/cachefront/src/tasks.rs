//! Table of self-owned background tasks.
//!
//! Upstream fetches may outlive the request that started them while an
//! insert drains. Each such task is a record here; the task removes its own
//! record when it finishes or is aborted, so completion and cancellation
//! release the record exactly once.

use crate::arena::{Arena, Handle};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

/// Generation-checked id of a registered task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(Handle);

struct TaskRecord {
    name: &'static str,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct Inner {
    tasks: Mutex<Arena<TaskRecord>>,
    idle: Notify,
}

#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<Inner>,
}

/// Removes the record when the task's future is dropped.
struct Completion {
    inner: Arc<Inner>,
    id: TaskId,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let mut tasks = self.inner.tasks.lock();
        if let Some(record) = tasks.remove(self.id.0) {
            tracing::trace!(task = record.name, "background task finished");
        }
        if tasks.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` onto the current runtime as a registered task.
    pub fn spawn<F>(&self, name: &'static str, fut: F) -> TaskId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = TaskId(self.inner.tasks.lock().push_head(TaskRecord { name, abort: None }));
        let completion = Completion {
            inner: Arc::clone(&self.inner),
            id,
        };

        let handle = tokio::spawn(async move {
            let _completion = completion;
            fut.await;
        });

        // The task may already have finished; the generation check makes
        // this a no-op then.
        if let Some(record) = self.inner.tasks.lock().get_mut(id.0) {
            record.abort = Some(handle.abort_handle());
        }
        id
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.inner.tasks.lock().contains(id.0)
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every registered task. Records are removed as the aborted
    /// tasks unwind.
    pub fn abort_all(&self) -> usize {
        let handles: Vec<AbortHandle> = self
            .inner
            .tasks
            .lock()
            .iter()
            .filter_map(|record| record.abort.clone())
            .collect();
        for handle in &handles {
            handle.abort();
        }
        handles.len()
    }

    /// Wait up to `grace` for every task to finish. Returns `true` if the
    /// registry drained in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.inner.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, wait).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn finished_tasks_remove_their_record() {
        let tasks = TaskRegistry::new();
        let (tx, rx) = oneshot::channel::<()>();
        let id = tasks.spawn("test", async move {
            let _ = rx.await;
        });
        assert!(tasks.contains(id));
        assert_eq!(tasks.len(), 1);

        tx.send(()).unwrap();
        assert!(tasks.drain(Duration::from_secs(1)).await);
        assert!(!tasks.contains(id));
        assert!(tasks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_on_stuck_tasks() {
        let tasks = TaskRegistry::new();
        tasks.spawn("stuck", std::future::pending());
        assert!(!tasks.drain(Duration::from_secs(5)).await);
        assert_eq!(tasks.len(), 1);

        assert_eq!(tasks.abort_all(), 1);
        assert!(tasks.drain(Duration::from_secs(5)).await);
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn stale_ids_do_not_match_reused_slots() {
        let tasks = TaskRegistry::new();
        let first = tasks.spawn("first", async {});
        assert!(tasks.drain(Duration::from_secs(1)).await);

        let (_tx, rx) = oneshot::channel::<()>();
        let second = tasks.spawn("second", async move {
            let _ = rx.await;
        });
        assert_ne!(first, second);
        assert!(!tasks.contains(first));
        assert!(tasks.contains(second));
        tasks.abort_all();
    }
}
