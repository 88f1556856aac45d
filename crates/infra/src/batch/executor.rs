//! Bounded worker pool with caller-runs backpressure.
//!
//! Chunk processing fans out onto a fixed set of worker threads fed through a
//! bounded queue. When both the workers and the queue are saturated, the
//! submitting thread runs the task itself instead of blocking or dropping it,
//! so the chunk loop can never outrun the pool. Submission order is not
//! preserved once caller-runs kicks in; callers that need ordering impose it
//! at the write step.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Errors surfaced when joining a task handle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The task never produced a result, which means it panicked on a worker.
    #[error("task result lost; the task panicked before completing")]
    TaskLost,
}

/// Sizing for the worker pool.
///
/// Both knobs default to the chunk size at the composition root so that a
/// full chunk saturates the pool exactly once before caller-runs engages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 10,
        }
    }
}

impl ExecutorConfig {
    /// Pool sized to a chunk: as many workers and queue slots as items.
    pub fn for_chunk_size(chunk_size: usize) -> Self {
        let size = chunk_size.max(1);
        Self {
            workers: size,
            queue_capacity: size,
        }
    }
}

/// Counters describing pool activity since construction.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    caller_runs: AtomicU64,
}

impl ExecutorStats {
    pub fn snapshot(&self) -> ExecutorStatsSnapshot {
        ExecutorStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            caller_runs: self.caller_runs.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`ExecutorStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub caller_runs: u64,
}

/// Handle to one submitted task; joined at the chunk barrier.
pub struct TaskHandle<T> {
    result: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes and take its output.
    pub fn join(self) -> Result<T, ExecutorError> {
        self.result.recv().map_err(|_| ExecutorError::TaskLost)
    }
}

/// Fixed-size worker pool over a bounded queue.
pub struct BoundedExecutor {
    sender: Mutex<Option<SyncSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<ExecutorStats>,
}

impl BoundedExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let workers = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);
        let (sender, receiver) = mpsc::sync_channel::<Job>(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let stats = Arc::new(ExecutorStats::default());

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("credential-worker-{index}"))
                .spawn(move || worker_loop(receiver))
                .unwrap_or_else(|e| {
                    // Thread spawn fails only on resource exhaustion at startup.
                    panic!("failed to spawn credential-worker-{index}: {e}")
                });
            handles.push(handle);
        }

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            stats,
        }
    }

    /// Submit a task, running it on the calling thread when the pool and
    /// queue are both full or the pool is already shut down.
    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);

        let (result_tx, result_rx) = mpsc::sync_channel::<T>(1);
        let stats = Arc::clone(&self.stats);
        let job: Job = Box::new(move || {
            let output = task();
            stats.completed.fetch_add(1, Ordering::Relaxed);
            // The handle may have been dropped; the outcome is already
            // persisted by the task body in that case.
            let _ = result_tx.send(output);
        });

        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };

        let rejected = match sender {
            Some(sender) => match sender.try_send(job) {
                Ok(()) => None,
                Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => Some(job),
            },
            None => {
                debug!("submit after shutdown; running task on the caller");
                Some(job)
            }
        };

        if let Some(job) = rejected {
            self.stats.caller_runs.fetch_add(1, Ordering::Relaxed);
            job();
        }

        TaskHandle { result: result_rx }
    }

    pub fn stats(&self) -> ExecutorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop accepting new work, drain queued tasks, and join the workers.
    ///
    /// Idempotent; a second call is a no-op.
    pub fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if sender.is_none() {
            return;
        }
        drop(sender);

        let handles = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("credential worker exited by panic");
            }
        }
    }
}

impl Drop for BoundedExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let guard = match receiver.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    error!("worker queue lock poisoned; stopping worker");
                    return;
                }
            };
            guard.recv()
        };

        match job {
            Ok(job) => {
                // A panicking task must not take the worker down with it.
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("task panicked on a credential worker");
                }
            }
            Err(_) => return,
        }
    }
}
