//! Bounded worker pool for chunk transfer
//!
//! Threads are spawned lazily on the first submitted job and joined when the
//! pool is dropped. Each buffered stream owns exactly one pool; it is never
//! shared between streams.

use std::sync::Mutex;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a job submitted to a [`WorkerPool`].
pub struct TaskHandle<T> {
    rx: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block until the job completes and return its result.
    ///
    /// Panics if the worker executing the job panicked.
    pub fn wait(self) -> T {
        self.rx
            .recv()
            .expect("worker dropped its result (task panicked)")
    }

    /// Whether the job has already completed.
    pub fn is_done(&self) -> bool {
        !self.rx.is_empty()
    }
}

struct PoolInner {
    tx: Sender<Job>,
    handles: Vec<JoinHandle<()>>,
}

/// Fixed-size thread pool with a lazily started workforce.
pub struct WorkerPool {
    workers: usize,
    inner: Mutex<Option<PoolInner>>,
}

impl WorkerPool {
    /// Create a pool that will run at most `workers` jobs concurrently.
    /// No threads are spawned until the first submit.
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            inner: Mutex::new(None),
        }
    }

    /// Number of worker threads this pool runs at full size.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Submit a job for execution and return a handle to its result.
    pub fn submit<T, F>(&self, job: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (result_tx, result_rx) = bounded(1);

        let mut inner = self.inner.lock().unwrap();
        let pool = inner.get_or_insert_with(|| {
            debug!(workers = self.workers, "starting worker pool");
            let (tx, rx): (Sender<Job>, Receiver<Job>) = unbounded();
            let handles = (0..self.workers)
                .map(|_| {
                    let rx = rx.clone();
                    std::thread::spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                })
                .collect();
            PoolInner { tx, handles }
        });

        pool.tx
            .send(Box::new(move || {
                // The receiver may be gone if the caller dropped the handle;
                // the job still ran, which is all drop-and-forget needs.
                let _ = result_tx.send(job());
            }))
            .expect("worker pool queue closed");

        TaskHandle { rx: result_rx }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let inner = self.inner.lock().unwrap().take();
        if let Some(PoolInner { tx, handles }) = inner {
            // Closing the queue lets the workers drain and exit
            drop(tx);
            for handle in handles {
                let _ = handle.join();
            }
            debug!("worker pool stopped");
        }
    }
}
