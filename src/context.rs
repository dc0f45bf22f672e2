//! Per-invocation execution context: the `waitUntil` background-task set.

use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::warn;

/// Background-work tracker handed to every worker entrypoint. Cloning shares
/// the underlying task set.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a background future. It starts immediately; the dispatcher
    /// awaits settlement after the response is sent. Errors are logged and
    /// never propagated to the caller.
    pub fn wait_until(&self, fut: BoxFuture<'static, anyhow::Result<()>>) {
        let handle = tokio::spawn(async move {
            if let Err(e) = fut.await {
                warn!(err = %e, "waitUntil task failed");
            }
        });
        self.tasks.lock().expect("task set poisoned").push(handle);
    }

    /// No-op locally; accepted for contract compatibility.
    pub fn pass_through_on_exception(&self) {}

    /// Await every registered task (best effort). Tasks registered while
    /// awaiting are drained too.
    pub async fn await_all(&self) {
        loop {
            let batch: Vec<JoinHandle<()>> = {
                let mut guard = self.tasks.lock().expect("task set poisoned");
                std::mem::take(&mut *guard)
            };
            if batch.is_empty() {
                return;
            }
            for handle in batch {
                let _ = handle.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn await_all_joins_registered_tasks() {
        let ctx = ExecutionContext::new();
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let c = Arc::clone(&counter);
            ctx.wait_until(Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        ctx.await_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejected_tasks_are_swallowed() {
        let ctx = ExecutionContext::new();
        ctx.wait_until(Box::pin(async { Err(anyhow::anyhow!("boom")) }));
        // Must not panic or propagate.
        ctx.await_all().await;
    }
}
