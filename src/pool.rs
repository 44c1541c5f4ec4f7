// src/pool.rs
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::sync::Semaphore;
use tracing::{debug, warn};

struct PoolInner<T> {
    /// Pending tasks, FIFO. Length never exceeds `capacity`.
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    /// Counts queue depth; workers block here between tasks.
    pending: Semaphore,
    stop: AtomicBool,
}

/// Fixed pool of long-lived worker threads draining a bounded FIFO queue.
///
/// A worker owns its dequeued task exclusively until the handler returns;
/// for connections this is what upholds the oneshot discipline, because the
/// handler only re-arms interest as its final step.
pub struct ThreadPool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl<T: Send + 'static> ThreadPool<T> {
    pub fn new<F>(workers: usize, capacity: usize, handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            pending: Semaphore::new(0),
            stop: AtomicBool::new(false),
        });
        let handler: Arc<dyn Fn(T) + Send + Sync> = Arc::new(handler);
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let inner = Arc::clone(&inner);
            let handler = Arc::clone(&handler);
            let core_id = core_ids.get(i % core_ids.len().max(1)).copied();

            let handle = thread::Builder::new()
                .name(format!("etude-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        core_affinity::set_for_current(id);
                    }
                    debug!(worker = i, "worker started");
                    worker_loop(&inner, handler.as_ref());
                    debug!(worker = i, "worker exiting");
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self { inner, handles }
    }

    /// Append a task without blocking. On a full queue the task is handed
    /// back unchanged and the queue is left untouched.
    pub fn enqueue(&self, task: T) -> Result<(), T> {
        let mut queue = self.inner.queue.lock().unwrap();
        if queue.len() >= self.inner.capacity {
            return Err(task);
        }
        queue.push_back(task);
        drop(queue);
        self.inner.pending.release();
        Ok(())
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    /// Cooperative teardown: raise the stop flag, post the semaphore once
    /// per worker so none stays blocked on it, then join.
    pub fn shutdown(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        for _ in 0..self.handles.len() {
            self.inner.pending.release();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<T>(inner: &PoolInner<T>, handler: &dyn Fn(T)) {
    loop {
        inner.pending.acquire();
        if inner.stop.load(Ordering::Acquire) {
            break;
        }
        let task = inner.queue.lock().unwrap().pop_front();
        // Empty after a won semaphore only on a spurious wake; go back to waiting.
        let Some(task) = task else { continue };
        // The worker must outlive any single task: a panicking handler is
        // contained here instead of killing the thread.
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(task)));
        if outcome.is_err() {
            warn!("task handler panicked, worker continues");
        }
    }
}
