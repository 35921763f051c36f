//! Fixed-size worker pool consuming opaque tasks from a bounded FIFO queue.
//!
//! Workers park on a condition variable and are woken one at a time as work
//! arrives. Shutdown is driven by sentinel tasks injected at the tail of the
//! queue, so a graceful pool drains everything already accepted before its
//! threads exit.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Task {
    Run(Job),
    Exit,
}

/// What happens to queued-but-unstarted tasks when the pool is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Drain the queue completely before the workers exit.
    Graceful,
    /// Discard queued tasks; only tasks already running finish.
    Immediate,
}

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
}

/// A pool of `worker_count` OS threads executing submitted closures in FIFO
/// order.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    worker_count: usize,
    max_queue: Option<usize>,
    shutdown_mode: ShutdownMode,
}

impl ThreadPool {
    /// Spawns `worker_count` workers. `max_queue` bounds the number of
    /// queued tasks; `None` leaves the queue unbounded.
    ///
    /// # Panics
    ///
    /// Panics if `worker_count` is zero.
    pub fn new(
        worker_count: usize,
        shutdown_mode: ShutdownMode,
        max_queue: Option<usize>,
    ) -> ThreadPool {
        assert!(worker_count >= 1, "a pool needs at least one worker");

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        });

        let workers = (0..worker_count)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || worker_loop(&shared))
            })
            .collect();

        ThreadPool {
            shared,
            workers,
            worker_count,
            max_queue,
            shutdown_mode,
        }
    }

    /// Enqueues `job` and wakes one waiting worker.
    ///
    /// Returns `false` without enqueueing when the queue already holds
    /// `max_queue` tasks.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock().unwrap();
        if let Some(max) = self.max_queue {
            if queue.len() >= max {
                return false;
            }
        }
        queue.push_back(Task::Run(Box::new(job)));
        self.shared.available.notify_one();
        true
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            if self.shutdown_mode == ShutdownMode::Immediate {
                queue.clear();
            }
            for _ in 0..self.worker_count {
                queue.push_back(Task::Exit);
            }
            self.shared.available.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("worker_count", &self.worker_count)
            .field("max_queue", &self.max_queue)
            .field("shutdown_mode", &self.shutdown_mode)
            .finish()
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            // Wakeups may be spurious; only a non-empty queue means work.
            while queue.is_empty() {
                queue = shared.available.wait(queue).unwrap();
            }
            queue.pop_front().unwrap()
        };
        match task {
            Task::Run(job) => job(),
            Task::Exit => return,
        }
    }
}
