// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-size worker pool over a FIFO queue of slot indices.
//!
//! Each command family gets one pool. The dispatcher pushes slot indices
//! with [`WorkerPool::submit`]; workers pop in FIFO order and run the
//! pool's handler. The queue is unbounded in memory (in practice bounded by
//! the 16 slots that can be in flight) and there is no backpressure.
//!
//! # Shutdown
//!
//! [`WorkerPool::shutdown`] is idempotent and joins every worker before
//! returning. `Drain` lets workers finish everything already queued;
//! `Immediate` empties the queue first and reports how many tasks were
//! discarded. A task that is already running always finishes - there is no
//! cancellation for compute in flight.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// What happens to queued tasks when a pool stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Finish every task already queued before joining workers.
    Drain,
    /// Discard queued tasks; running tasks still complete.
    Immediate,
}

impl fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drain => f.write_str("drain"),
            Self::Immediate => f.write_str("immediate"),
        }
    }
}

struct PoolShared {
    queue: Mutex<VecDeque<usize>>,
    work_ready: Condvar,
    stop: AtomicBool,
    handler: Box<dyn Fn(usize) + Send + Sync>,
}

/// A fixed set of named worker threads consuming slot indices.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
    name: String,
}

impl WorkerPool {
    /// Spawn `workers` threads running `handler` on submitted slot indices.
    pub fn new<F>(workers: usize, name: &str, handler: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            stop: AtomicBool::new(false),
            handler: Box::new(handler),
        });

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let shared = Arc::clone(&shared);
            let thread_name = format!("{name}-{i}");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(&shared))
                .unwrap_or_else(|e| panic!("failed to spawn {thread_name}: {e}"));
            handles.push(handle);
        }

        log::debug!("[POOL] {name}: started {workers} worker(s)");
        Self {
            shared,
            workers: handles,
            name: name.to_string(),
        }
    }

    /// Enqueue a slot index and wake one worker.
    ///
    /// Returns `false` once the pool is shutting down; the task is not
    /// queued in that case.
    pub fn submit(&self, slot_index: usize) -> bool {
        {
            let mut queue = self.shared.queue.lock();
            if self.shared.stop.load(Ordering::Acquire) {
                return false;
            }
            queue.push_back(slot_index);
        }
        self.shared.work_ready.notify_one();
        true
    }

    /// Current queue depth (diagnostic).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Pool name (diagnostic).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the pool and join every worker.
    ///
    /// Returns the number of queued tasks discarded (always 0 in `Drain`
    /// mode, and on every call after the first).
    pub fn shutdown(&mut self, mode: ShutdownMode) -> usize {
        if self.shared.stop.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let discarded = if mode == ShutdownMode::Immediate {
            let mut queue = self.shared.queue.lock();
            let discarded = queue.len();
            queue.clear();
            discarded
        } else {
            0
        };

        self.shared.work_ready.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("[POOL] {}: worker panicked", self.name);
            }
        }

        log::debug!(
            "[POOL] {}: shut down ({mode}, {discarded} task(s) discarded)",
            self.name
        );
        discarded
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(ShutdownMode::Drain);
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let slot_index = {
            let mut queue = shared.queue.lock();
            while !shared.stop.load(Ordering::Acquire) && queue.is_empty() {
                shared.work_ready.wait(&mut queue);
            }
            // Stopping drains the queue first: Immediate already cleared
            // it, Drain leaves the remaining tasks for us to finish.
            match queue.pop_front() {
                Some(index) => index,
                None => return,
            }
        };
        (shared.handler)(slot_index);
    }
}
