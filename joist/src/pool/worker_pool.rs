// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The pool itself plus the hooks trait that injects per-thread behavior.

use std::{sync::{Arc, Mutex,
                 atomic::{AtomicBool, Ordering}},
          thread::JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, trace};

use crate::common::MutexExt;

/// Per-thread behavior injected into a [`WorkerPool`].
///
/// Mirrors the three phases of a worker's life: build thread state once after the
/// thread starts, handle queue items against that state, tear the state down once
/// when the pool shuts down. The hooks value itself is shared by every worker.
pub trait WorkerHooks<T>: Send + Sync + 'static {
    type ThreadState;

    /// Runs once on each worker thread before it starts popping items.
    fn thread_start(&self) -> Self::ThreadState;

    /// Runs for every item popped off the queue.
    fn handle_item(&self, state: &mut Self::ThreadState, item: T);

    /// Runs once on each worker thread as it exits, consuming the state.
    fn thread_finish(&self, state: Self::ThreadState);
}

/// What travels on the queue: a real item, or the shutdown sentinel.
///
/// The sentinel is a distinct variant rather than a magic item value, so it can
/// never collide with caller data. Shutdown pushes exactly one sentinel per
/// worker; because the queue is FIFO, every real item enqueued beforehand drains
/// first.
enum WorkItem<T> {
    Item(T),
    Shutdown,
}

/// Fixed pool of joinable worker threads over an unbounded MPMC queue.
///
/// `push` never blocks and never fails (the queue is unbounded); pushing after
/// [`shutdown`] began is a contract violation and panics. [`shutdown`] drains the
/// queue, joins every worker, and is a no-op the second time; a shut-down pool
/// cannot be reused. Worker-thread creation failure is fatal.
///
/// [`shutdown`]: Self::shutdown
pub struct WorkerPool<T, H>
where
    T: Send + 'static,
    H: WorkerHooks<T>,
{
    shared: Arc<PoolShared<T, H>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct PoolShared<T, H> {
    hooks: H,
    tx: Sender<WorkItem<T>>,
    rx: Receiver<WorkItem<T>>,
    shutting_down: AtomicBool,
    worker_count: usize,
}

impl<T, H> WorkerPool<T, H>
where
    T: Send + 'static,
    H: WorkerHooks<T>,
{
    /// Spawns `worker_count` workers immediately.
    ///
    /// # Panics
    ///
    /// Panics if `worker_count` is zero or a worker thread cannot be spawned.
    pub fn new(worker_count: usize, hooks: H) -> Self {
        assert!(worker_count > 0, "worker pool needs at least one thread");
        let (tx, rx) = unbounded();
        let shared = Arc::new(PoolShared {
            hooks,
            tx,
            rx,
            shutting_down: AtomicBool::new(false),
            worker_count,
        });

        debug!(worker_count, "spawning worker pool");
        let workers = (0..worker_count)
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("joist-worker-{i}"))
                    .spawn(move || worker_main(&shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, workers: Mutex::new(workers) }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize { self.shared.worker_count }

    /// Enqueues an item for some worker to handle.
    ///
    /// # Panics
    ///
    /// Panics if the pool is shutting down.
    pub fn push(&self, item: T) {
        assert!(
            self.try_push(item).is_ok(),
            "push on a worker pool that is shutting down"
        );
    }

    /// Non-panicking variant of [`push`] for callers that race against shutdown;
    /// hands the item back on failure.
    ///
    /// [`push`]: Self::push
    pub fn try_push(&self, item: T) -> Result<(), T> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(item);
        }
        self.shared.tx.send(WorkItem::Item(item)).map_err(|e| match e.into_inner() {
            WorkItem::Item(item) => item,
            WorkItem::Shutdown => unreachable!("only items are pushed here"),
        })
    }

    /// Drains the queue and joins every worker. Items pushed before this call are
    /// all handled first; the second call is a no-op.
    pub fn shutdown(&self) {
        let workers = {
            let mut guard = self.workers.lock_unpoisoned();
            if guard.is_empty() {
                return;
            }
            // Flag first so new pushes are rejected, then fence the queue with one
            // sentinel per worker. Each worker stops at the first sentinel it
            // pops, so the sentinels are consumed one per thread.
            self.shared.shutting_down.store(true, Ordering::SeqCst);
            for _ in 0..guard.len() {
                self.shared
                    .tx
                    .send(WorkItem::Shutdown)
                    .expect("pool queue outlives the pool");
            }
            std::mem::take(&mut *guard)
        };

        debug!(worker_count = workers.len(), "shutting down worker pool");
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl<T, H> Drop for WorkerPool<T, H>
where
    T: Send + 'static,
    H: WorkerHooks<T>,
{
    fn drop(&mut self) { self.shutdown(); }
}

impl<T, H> std::fmt::Debug for WorkerPool<T, H>
where
    T: Send + 'static,
    H: WorkerHooks<T>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.shared.worker_count)
            .field("shutting_down", &self.shared.shutting_down.load(Ordering::SeqCst))
            .finish()
    }
}

fn worker_main<T, H>(shared: &PoolShared<T, H>)
where
    T: Send + 'static,
    H: WorkerHooks<T>,
{
    let mut state = shared.hooks.thread_start();
    trace!("worker up");
    loop {
        match shared.rx.recv() {
            Ok(WorkItem::Item(item)) => shared.hooks.handle_item(&mut state, item),
            Ok(WorkItem::Shutdown) | Err(_) => break,
        }
    }
    trace!("worker down");
    shared.hooks.thread_finish(state);
}

/// Hooks adapter for pools whose workers need no per-thread state; wraps a plain
/// handler closure.
pub struct FnHooks<F>(F);

impl<T, F> WorkerHooks<T> for FnHooks<F>
where
    T: Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    type ThreadState = ();

    fn thread_start(&self) {}

    fn handle_item(&self, (): &mut (), item: T) { (self.0)(item); }

    fn thread_finish(&self, (): ()) {}
}

impl<F> std::fmt::Debug for FnHooks<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnHooks")
    }
}

impl<T, F> WorkerPool<T, FnHooks<F>>
where
    T: Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    /// Convenience constructor for stateless handlers.
    pub fn new_with_fn(worker_count: usize, handler: F) -> Self {
        Self::new(worker_count, FnHooks(handler))
    }
}
