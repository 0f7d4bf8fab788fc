//! Threading Primitives
//!
//! Worker pool for blocking tile fetches.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::{PlatformError, PlatformResult};

/// Task for the thread pool
type Task = Box<dyn FnOnce() + Send + 'static>;

/// How long an idle worker waits before re-checking the shutdown flag
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Thread pool for parallel work
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<Sender<Task>>,
    shutdown: Arc<AtomicBool>,
}

struct Worker {
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        name: String,
        receiver: Receiver<Task>,
        shutdown: Arc<AtomicBool>,
    ) -> PlatformResult<Self> {
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    match receiver.recv_timeout(IDLE_POLL) {
                        Ok(task) => task(),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|e| PlatformError::ThreadSpawn(e.to_string()))?;

        Ok(Self {
            thread: Some(thread),
        })
    }
}

impl ThreadPool {
    /// Create a new thread pool with the specified number of workers
    ///
    /// Workers are named `<prefix>-<index>`.
    pub fn new(prefix: &str, num_workers: usize) -> PlatformResult<Self> {
        let num_workers = num_workers.max(1);
        let (sender, receiver) = bounded(1024);
        let shutdown = Arc::new(AtomicBool::new(false));

        let workers = (0..num_workers)
            .map(|id| {
                Worker::spawn(format!("{}-{}", prefix, id), receiver.clone(), shutdown.clone())
            })
            .collect::<PlatformResult<Vec<_>>>()?;

        log::debug!("Started {} '{}' workers", num_workers, prefix);

        Ok(Self {
            workers,
            sender: Some(sender),
            shutdown,
        })
    }

    /// Get the number of workers
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Submit a task to the pool
    ///
    /// Returns `false` if the pool is shutting down and the task was dropped.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            return false;
        };

        if sender.send(Box::new(task)).is_err() {
            log::warn!("Thread pool is disconnected, task dropped");
            return false;
        }
        true
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        drop(self.sender.take());

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_thread_pool() {
        let pool = ThreadPool::new("test-worker", 4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = crossbeam::channel::unbounded();

        for _ in 0..100 {
            let counter_clone = counter.clone();
            let tx = tx.clone();
            assert!(pool.submit(move || {
                counter_clone.fetch_add(1, Ordering::Relaxed);
                let _ = tx.send(());
            }));
        }

        for _ in 0..100 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_zero_workers_still_runs() {
        let pool = ThreadPool::new("single", 0).unwrap();
        assert_eq!(pool.num_workers(), 1);

        let (tx, rx) = crossbeam::channel::bounded(1);
        assert!(pool.submit(move || {
            let _ = tx.send(7);
        }));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn test_worker_names() {
        let pool = ThreadPool::new("named", 1).unwrap();
        let (tx, rx) = crossbeam::channel::bounded(1);

        pool.submit(move || {
            let name = thread::current().name().map(str::to_owned);
            let _ = tx.send(name);
        });

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("named-0"));
    }
}
