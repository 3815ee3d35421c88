//! Fixed set of worker threads draining a bounded FIFO of tasks.
//!
//! The queue length doubles as the counting signal: workers sleep on the
//! condition variable until it's nonzero.
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use log::{debug, error, trace};

struct Queue<T> {
    tasks: VecDeque<T>,
    stop: bool,
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    available: Condvar,
    max_requests: usize,
}

impl<T> Shared<T> {
    // A worker panicking inside the handler doesn't hold the lock, so a
    // poisoned queue is still consistent.
    fn lock(&self) -> MutexGuard<'_, Queue<T>> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

pub struct ThreadPool<T> {
    shared: Arc<Shared<T>>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl<T: Send + 'static> ThreadPool<T> {
    /// Start `threads` workers, each calling `handler` for every task it
    /// pops.
    pub fn new<F>(threads: usize, max_requests: usize, handler: F) -> Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if threads == 0 || max_requests == 0 {
            return Err(anyhow!(
                "thread pool needs at least one thread and one slot, got threads={threads} max_requests={max_requests}"
            ));
        }
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                stop: false,
            }),
            available: Condvar::new(),
            max_requests,
        });
        let handler = Arc::new(handler);
        let mut workers = Vec::with_capacity(threads);
        for n in 0..threads {
            debug!("Creating worker {n}");
            let shared = shared.clone();
            let handler = handler.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("worker/{n}"))
                    .spawn(move || Self::run(&shared, &*handler))
                    .with_context(|| format!("spawning worker thread {n}"))?,
            );
        }
        Ok(Self { shared, workers })
    }

    /// Queue a task. Gives it back if the queue is full or shutting down.
    pub fn append(&self, task: T) -> Result<(), T> {
        let mut q = self.shared.lock();
        if q.stop || q.tasks.len() >= self.shared.max_requests {
            return Err(task);
        }
        q.tasks.push_back(task);
        drop(q);
        self.shared.available.notify_one();
        Ok(())
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.max_requests
    }

    fn run(shared: &Shared<T>, handler: &(dyn Fn(T) + Send + Sync)) {
        loop {
            let task = {
                let mut q = shared.lock();
                loop {
                    if let Some(task) = q.tasks.pop_front() {
                        break task;
                    }
                    // Tasks already accepted are drained before stopping.
                    if q.stop {
                        trace!("Worker exiting");
                        return;
                    }
                    q = shared
                        .available
                        .wait(q)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
            };
            handler(task);
        }
    }
}

impl<T> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.shared.lock().stop = true;
        self.shared.available.notify_all();
        for w in self.workers.drain(..) {
            if w.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}
