//! Hand-off point between the blocking broker thread and the Tokio
//! runtime.
//!
//! The MQTT listener runs on a plain OS thread and cannot await
//! anything. When it needs async work done (a fan-out to WebSocket
//! clients, a DB write), it wraps the work in a future and schedules it
//! here. Scheduling is fire-and-forget: the broker thread never learns
//! how the task went, and a failing task is logged and dropped rather
//! than allowed to take the listener down.

use std::future::Future;

use tokio::runtime::Handle;

use crate::error::AppError;

#[derive(Clone)]
pub struct TaskBridge {
    handle: Handle,
}

impl TaskBridge {
    /// Capture the ambient runtime. Call once during startup, from
    /// async context, before any broker thread exists.
    pub fn current() -> Self {
        Self {
            handle: Handle::current(),
        }
    }

    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Schedule `fut` onto the runtime from any thread. `task` names
    /// the work in logs when it fails.
    pub fn schedule<F>(&self, task: &'static str, fut: F)
    where
        F: Future<Output = Result<(), AppError>> + Send + 'static,
    {
        self.handle.spawn(async move {
            if let Err(error) = fut.await {
                tracing::warn!(task, %error, "bridged task failed");
            }
        });
    }

    /// Run `fut` to completion on the calling (non-runtime) thread.
    /// This is how broker dispatch does its DB work: the listener
    /// thread blocks, the runtime does not.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schedules_work_from_a_foreign_thread() {
        let bridge = TaskBridge::current();
        let (tx, rx) = tokio::sync::oneshot::channel();

        std::thread::spawn(move || {
            bridge.schedule("test-send", async move {
                let _ = tx.send(42);
                Ok(())
            });
        })
        .join()
        .unwrap();

        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn block_on_runs_async_work_from_a_foreign_thread() {
        let bridge = TaskBridge::current();
        let value = std::thread::spawn(move || {
            bridge.block_on(async {
                tokio::task::yield_now().await;
                7
            })
        })
        .join()
        .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn failed_tasks_are_contained() {
        let bridge = TaskBridge::current();
        bridge.schedule("boom", async {
            Err(AppError::IllegalState("boom".into()))
        });

        // The runtime keeps scheduling; a later task still runs.
        let (tx, rx) = tokio::sync::oneshot::channel();
        bridge.schedule("after", async move {
            let _ = tx.send(());
            Ok(())
        });
        rx.await.unwrap();
    }
}
