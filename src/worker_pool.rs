//! Bounded worker pool (component C3)
//!
//! A fixed-size pool of tasks consuming jobs from a bounded mpsc queue.
//! Submission fails fast with `QueueFull` rather than blocking the caller
//! indefinitely, so the admission layer stays in control of backpressure.
//! Each job carries a `CancellationToken` checked both before dispatch and
//! cooperatively inside the job body, so a cancelled session's still-queued
//! work is skipped and in-flight work can bail out early.

use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("worker queue is full")]
    QueueFull,
    #[error("worker pool is shutting down")]
    ShuttingDown,
}

/// A bounded pool of `worker_count` tasks draining a single shared queue of
/// capacity `queue_capacity`, FIFO across all submitters.
pub struct WorkerPool {
    sender: mpsc::Sender<BoxedJob>,
    queue_capacity: usize,
}

impl WorkerPool {
    pub fn new(worker_count: usize, queue_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let receiver = std::sync::Arc::new(tokio::sync::Mutex::new(receiver));

        for _ in 0..worker_count {
            let receiver = receiver.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut receiver = receiver.lock().await;
                        receiver.recv().await
                    };
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
            });
        }

        Self { sender, queue_capacity }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Best-effort snapshot of how many slots are occupied; used by the
    /// circuit breaker's combined load signal. `mpsc::Sender` does not
    /// expose an exact depth, so this is derived from remaining capacity.
    pub fn queue_depth(&self) -> usize {
        self.queue_capacity
            .saturating_sub(self.sender.capacity())
    }

    /// Submit a unit of work, returning a future that resolves once the
    /// job has run (or was skipped because `cancel` fired before
    /// dispatch). Fails immediately, without waiting, if the queue is
    /// full — callers are expected to surface this as `OverCapacity`.
    pub fn submit<F>(&self, cancel: CancellationToken, job: F) -> Result<JobHandle, SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let boxed: BoxedJob = Box::pin(async move {
            if !cancel.is_cancelled() {
                job.await;
            }
            let _ = done_tx.send(());
        });

        self.sender
            .try_send(boxed)
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SubmitError::ShuttingDown,
            })?;

        Ok(JobHandle { done: done_rx })
    }
}

/// A handle a submitter can await to know the job ran to completion (or
/// was cooperatively skipped).
pub struct JobHandle {
    done: oneshot::Receiver<()>,
}

impl JobHandle {
    pub async fn wait(self) {
        let _ = self.done.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn submitted_jobs_run() {
        let pool = WorkerPool::new(2, 4);
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let counter = counter.clone();
            let handle = pool
                .submit(CancellationToken::new(), async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            handles.push(handle);
        }
        for handle in handles {
            handle.wait().await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancelled_job_is_skipped() {
        let pool = WorkerPool::new(1, 4);
        let counter = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let counter2 = counter.clone();
        let handle = pool
            .submit(cancel, async move {
                counter2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        handle.wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn full_queue_rejects_submission() {
        let pool = WorkerPool::new(1, 1);
        // Fill the single worker with a job that blocks until released,
        // then fill the one queue slot, then expect overflow to reject.
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = std::sync::Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        pool.submit(CancellationToken::new(), async move {
            let rx = release_rx.lock().await.take().unwrap();
            let _ = rx.await;
        })
        .unwrap();

        // Give the worker a moment to pick up the blocking job.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let _first = pool.submit(CancellationToken::new(), async {}).unwrap();
        let second = pool.submit(CancellationToken::new(), async {});
        assert!(matches!(second, Err(SubmitError::QueueFull)));

        let _ = release_tx.send(());
    }
}
