//! Task Runtime — a priority-aware scheduler over `tokio`'s worker pool
//! (spec.md §4.2, §5). Short handlers are spawned as ordinary tokio tasks;
//! `High` priority is used for the latency-sensitive recursive calls that
//! themselves issue communication, so they get scheduled immediately
//! rather than behind a batch of compute-only work.

use futures::future::join_all;
use std::future::Future;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

/// Scheduling priority. `High` is reserved for tasks that recurse into
/// further communication (spec.md §4.2): overlapping comm with compute
/// matters more for those than for leaf compute-only work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    /// Ordinary compute-only task.
    Normal,
    /// Task that itself issues communication or further recursion.
    High,
}

/// A handle to the process-wide task pool.
///
/// Spec.md §5: the only user-visible suspension points are `future.get()`
/// on an already-ready future and the explicit collective `fence()` — this
/// type does not expose a way to block on an unready future from inside a
/// task; callers pass futures as constructor arguments instead.
#[derive(Clone)]
pub struct TaskRuntime {
    handle: Handle,
}

impl TaskRuntime {
    /// Wrap the ambient tokio runtime handle. Panics (as `Handle::current`
    /// does) if called outside a tokio runtime context.
    #[must_use]
    pub fn current() -> Self {
        Self {
            handle: Handle::current(),
        }
    }

    /// Schedule `fut` and return a future for its result.
    ///
    /// Both priorities currently map onto the same tokio scheduler; the
    /// distinction is preserved in the API (and in tracing spans) so a
    /// future scheduler swap can act on it without touching call sites.
    pub fn spawn<F>(&self, priority: Priority, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        trace!(?priority, "scheduling task");
        self.handle.spawn(fut)
    }

    /// Run one task per item in `items`, independently, and collect the
    /// results in input order (spec.md §4.2's `for_each`).
    pub async fn for_each<T, F, Fut, O>(&self, items: Vec<T>, op: F) -> Vec<O>
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: Send + 'static,
    {
        let handles: Vec<_> = items
            .into_iter()
            .map(|item| self.spawn(Priority::Normal, op(item)))
            .collect();
        join_all(handles)
            .await
            .into_iter()
            .map(|r| r.expect("task panicked"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn for_each_preserves_order() {
        let rt = TaskRuntime::current();
        let out = rt.for_each(vec![1, 2, 3], |x| async move { x * 10 }).await;
        assert_eq!(out, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn spawn_high_priority_runs() {
        let rt = TaskRuntime::current();
        let handle = rt.spawn(Priority::High, async { 42 });
        assert_eq!(handle.await.unwrap(), 42);
    }
}
