//! Asynchronous notification execution.
//!
//! Listener callbacks and transaction continuations never run on the
//! mutating caller's thread. Components are handed an
//! `Arc<dyn NotificationExecutor>` at construction and submit work to it;
//! how that work is driven (runtime thread pool, inline for tests) is the
//! executor's business. This follows the "emit, don't present" separation:
//! the state machinery decides *what* to deliver, the executor decides
//! *where* it runs.
//!
//! # Example
//!
//! ```ignore
//! use querygrid::notify::{NotificationExecutor, TokioExecutor};
//! use std::sync::Arc;
//!
//! let executor: Arc<dyn NotificationExecutor> =
//!     Arc::new(TokioExecutor::new(tokio::runtime::Handle::current()));
//! executor.execute(Box::pin(async { /* deliver a notification */ }));
//! ```

use std::future::Future;
use std::pin::Pin;

/// A unit of notification work.
pub type Notification = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Executes notification work off the caller's thread.
///
/// # Ordering
///
/// Implementations make no ordering promise between submitted tasks: two
/// notifications enqueued back-to-back may run in either order. Consumers
/// that care about ordering must re-read authoritative state instead of
/// trusting the notification payload.
///
/// # Panics
///
/// A panicking notification must not affect the submitter. The tokio-backed
/// executor satisfies this naturally: the panic is confined to the spawned
/// task.
pub trait NotificationExecutor: Send + Sync + 'static {
    /// Submits a notification for execution.
    fn execute(&self, task: Notification);
}

/// Executor backed by a tokio runtime handle.
///
/// This is the production choice: every notification becomes a task on the
/// runtime, giving the out-of-order, off-thread delivery the listener
/// contract requires.
#[derive(Clone)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    /// Creates an executor that spawns onto the given runtime.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Creates an executor for the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl NotificationExecutor for TokioExecutor {
    fn execute(&self, task: Notification) {
        self.handle.spawn(task);
    }
}

impl std::fmt::Debug for TokioExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioExecutor").finish()
    }
}

/// Executor that drives each notification to completion inline.
///
/// Useful in synchronous tests where deterministic delivery matters more
/// than the production threading model. Unlike [`TokioExecutor`] this blocks
/// the submitter until the notification completes and propagates panics, so
/// it must not be used where a notification waits on work the submitter has
/// yet to do.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl NotificationExecutor for InlineExecutor {
    fn execute(&self, task: Notification) {
        futures::executor::block_on(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_inline_executor_runs_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let executor = InlineExecutor;

        let count_clone = Arc::clone(&count);
        executor.execute(Box::pin(async move {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tokio_executor_delivers() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let executor = TokioExecutor::current();

        executor.execute(Box::pin(async move {
            let _ = tx.send(42u32);
        }));

        assert_eq!(rx.await, Ok(42));
    }
}
