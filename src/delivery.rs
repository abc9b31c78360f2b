//! Delivery queue: a single-threaded FIFO worker for user callbacks.
//!
//! Every user-visible callback (connect/disconnect/received/result/invoked/
//! log) runs on this thread, never on the transport loop, so user code cannot
//! deadlock the event loop or observe its own events out of order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    stop: AtomicBool,
}

/// FIFO worker thread serializing engine-to-user callbacks.
///
/// Jobs run in enqueue order with the queue mutex released, so a running
/// callback never blocks producers. On [`stop`](DeliveryQueue::stop) the
/// worker is joined and any undrained jobs are dropped without running.
pub(crate) struct DeliveryQueue {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryQueue {
    pub(crate) fn new() -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let worker_inner = inner.clone();
        let worker = std::thread::Builder::new()
            .name("pipelink-delivery".into())
            .spawn(move || worker_loop(worker_inner))
            .expect("failed to spawn delivery thread");

        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Append a callback to the queue. No-op once stopped.
    pub(crate) fn enqueue<F: FnOnce() + Send + 'static>(&self, job: F) {
        if self.inner.stop.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.inner.queue.lock().unwrap();
        queue.push_back(Box::new(job));
        self.inner.available.notify_one();
    }

    /// Stop the worker, join it, and drop whatever was still queued.
    pub(crate) fn stop(&self) {
        if self.inner.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _queue = self.inner.queue.lock().unwrap();
            self.inner.available.notify_one();
        }
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
        let dropped = {
            let mut queue = self.inner.queue.lock().unwrap();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        if dropped > 0 {
            tracing::debug!(dropped, "delivery queue stopped with undrained callbacks");
        }
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(inner: Arc<Inner>) {
    let mut queue = inner.queue.lock().unwrap();
    while !inner.stop.load(Ordering::Acquire) {
        queue = inner
            .available
            .wait_while(queue, |q| {
                q.is_empty() && !inner.stop.load(Ordering::Acquire)
            })
            .unwrap();

        if inner.stop.load(Ordering::Acquire) {
            break;
        }
        if let Some(job) = queue.pop_front() {
            drop(queue);
            job();
            queue = inner.queue.lock().unwrap();
        }
    }
}
