// heapdbg - Heap origin debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Strict FIFO execution of asynchronous tasks.
//!
//! Protocol events arrive without backpressure, often while the reaction to a
//! previous event is still awaiting a round-trip. [`SequentialTaskQueue`] runs
//! every enqueued task to completion before starting the next one, on a single
//! worker task fed by an unbounded channel.
//!
//! A task that returns an error or panics is handed to the queue's error
//! handler; the worker then continues with the next task, so one failing step
//! never wedges the owner. [`SequentialTaskQueue::reset`] discards everything
//! still waiting and starts a fresh, empty chain.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::{future::BoxFuture, FutureExt};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error};

/// Result type of a queued task
pub type TaskResult = eyre::Result<()>;

/// Asynchronous error handler invoked on the worker before the next task starts.
pub type ErrorHandler = Arc<dyn Fn(eyre::Report) -> BoxFuture<'static, ()> + Send + Sync>;

struct Job {
    generation: u64,
    task: BoxFuture<'static, TaskResult>,
    done: oneshot::Sender<()>,
}

/// FIFO queue of asynchronous tasks.
pub struct SequentialTaskQueue {
    tx: mpsc::UnboundedSender<Job>,
    generation: Arc<AtomicU64>,
    worker: JoinHandle<()>,
}

impl std::fmt::Debug for SequentialTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialTaskQueue")
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish()
    }
}

impl SequentialTaskQueue {
    /// Create a queue whose failing tasks are reported to `on_error`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(on_error: ErrorHandler) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let generation = Arc::new(AtomicU64::new(0));

        let current = generation.clone();
        let worker = tokio::spawn(async move {
            while let Some(Job { generation, task, done }) = rx.recv().await {
                if generation != current.load(Ordering::SeqCst) {
                    debug!(generation, "Discarding task queued before reset");
                    continue;
                }

                let failure = match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err),
                    Err(panic) => Some(eyre::eyre!("task panicked: {}", panic_message(&panic))),
                };

                if let Some(err) = failure {
                    error!(error = %err, "Queued task failed");
                    on_error(err).await;
                }

                // The caller may have stopped waiting.
                let _ = done.send(());
            }
        });

        Self { tx, generation, worker }
    }

    /// Create a queue that only logs failing tasks.
    pub fn logging() -> Self {
        Self::new(Arc::new(|_: eyre::Report| async {}.boxed()))
    }

    /// Append `task` to the queue.
    ///
    /// The task is queued immediately; the returned future only waits for it to
    /// finish and may be dropped. It also resolves when the task is discarded by
    /// [`reset`](Self::reset).
    pub fn enqueue<F>(&self, task: F) -> impl Future<Output = ()> + Send + 'static
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let (done, finished) = oneshot::channel();
        let generation = self.generation.load(Ordering::SeqCst);
        let job = Job { generation, task: task.boxed(), done };
        if self.tx.send(job).is_err() {
            error!("Task queue worker is gone, dropping task");
        }

        async move {
            let _ = finished.await;
        }
    }

    /// Drop every task that has not started yet.
    pub fn reset(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "Task queue reset");
    }
}

impl Drop for SequentialTaskQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn recording_queue() -> (SequentialTaskQueue, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let errors = log.clone();
        let queue = SequentialTaskQueue::new(Arc::new(move |err: eyre::Report| {
            let errors = errors.clone();
            async move { errors.lock().push(format!("error: {err}")) }.boxed()
        }));
        (queue, log)
    }

    #[tokio::test]
    async fn test_tasks_run_in_enqueue_order() {
        let (queue, log) = recording_queue();

        let mut waits = Vec::new();
        for (i, delay) in [30u64, 0, 10].into_iter().enumerate() {
            let log = log.clone();
            waits.push(queue.enqueue(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                log.lock().push(format!("task {i}"));
                Ok(())
            }));
        }
        futures::future::join_all(waits).await;

        assert_eq!(*log.lock(), vec!["task 0", "task 1", "task 2"]);
    }

    #[tokio::test]
    async fn test_failing_task_does_not_block_the_next() {
        let (queue, log) = recording_queue();

        let first = log.clone();
        let _ = queue.enqueue(async move {
            first.lock().push("task 1".into());
            Ok(())
        });
        let _ = queue.enqueue(async move { Err(eyre::eyre!("boom")) });
        let third = log.clone();
        queue
            .enqueue(async move {
                third.lock().push("task 3".into());
                Ok(())
            })
            .await;

        assert_eq!(*log.lock(), vec!["task 1", "error: boom", "task 3"]);
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported() {
        let (queue, log) = recording_queue();

        fn explode() -> TaskResult {
            panic!("kaboom")
        }

        let _ = queue.enqueue(async move { explode() });
        let after = log.clone();
        queue
            .enqueue(async move {
                after.lock().push("after".into());
                Ok(())
            })
            .await;

        assert_eq!(*log.lock(), vec!["error: task panicked: kaboom", "after"]);
    }

    #[tokio::test]
    async fn test_reset_discards_pending_tasks() {
        let (queue, log) = recording_queue();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let blocker = log.clone();
        let _ = queue.enqueue(async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            blocker.lock().push("running".into());
            Ok(())
        });
        let stale = log.clone();
        let discarded = queue.enqueue(async move {
            stale.lock().push("stale".into());
            Ok(())
        });

        started_rx.await.unwrap();
        queue.reset();
        let _ = release_tx.send(());
        discarded.await;

        let fresh = log.clone();
        queue
            .enqueue(async move {
                fresh.lock().push("fresh".into());
                Ok(())
            })
            .await;

        assert_eq!(*log.lock(), vec!["running", "fresh"]);
    }
}
