//! Thread pools dispatching per-topic work.

use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error};

use crate::{RestructureError, Result};

/// A thread pool for executing jobs concurrently.
pub trait ThreadPool {
    /// Creates a pool with the given number of threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created.
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized;

    /// Spawns a job onto the pool.
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;
}

/// Work-stealing pool backed by rayon; the orchestrator's default.
pub struct WorkStealingThreadPool {
    pool: rayon::ThreadPool,
}

impl ThreadPool for WorkStealingThreadPool {
    fn new(threads: u32) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1) as usize)
            .thread_name(|i| format!("restructure-{i}"))
            .build()
            .map_err(|e| RestructureError::StringError(e.to_string()))?;
        Ok(Self { pool })
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(job);
    }
}

/// Pool pulling jobs from one shared MPMC channel. A worker that
/// panics is replaced so the pool never shrinks.
pub struct SharedQueueThreadPool {
    tx: Sender<Box<dyn FnOnce() + Send + 'static>>,
}

impl ThreadPool for SharedQueueThreadPool {
    fn new(threads: u32) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Box<dyn FnOnce() + Send + 'static>>();
        for id in 0..threads.max(1) {
            spawn_worker(id, rx.clone());
        }
        Ok(Self { tx })
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Box::new(job))
            .expect("thread pool has no active threads");
    }
}

fn spawn_worker(id: u32, rx: Receiver<Box<dyn FnOnce() + Send + 'static>>) {
    thread::Builder::new()
        .name(format!("restructure-{id}"))
        .spawn(move || loop {
            match rx.recv() {
                Ok(job) => {
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                        error!("worker {id}: job panicked, continuing");
                    }
                }
                Err(_) => {
                    debug!("worker {id}: channel closed, shutting down");
                    return;
                }
            }
        })
        .expect("failed to spawn pool worker thread");
}
