// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The runner: owns the loop thread and the worker pool, tracks completed tasks.

use std::{collections::VecDeque,
          sync::{Arc, Mutex, Weak,
                 atomic::{AtomicBool, Ordering}}};

use tracing::debug;

use super::{invoke::{Invocation, InvokeHooks},
            task_core::{Task, TaskCore},
            watcher::WatcherCore};
use crate::{common::MutexExt,
            config::RunnerConfig,
            event_loop::{EventLoop, EventLoopError, LoopMsg},
            pool::WorkerPool};

/// Prune the weak-watcher registry whenever it grows past this many entries
/// since the last prune.
const WATCHER_REGISTRY_PRUNE_STRIDE: usize = 256;

/// Failed to bring up a [`Runner`]'s threads or poller.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum RunnerSpawnError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    EventLoop(#[from] EventLoopError),
}

/// Creates tasks, schedules their watchers, and surfaces their completions.
///
/// A runner owns one event loop thread and a fixed worker pool. Clones share the
/// same runner. [`shutdown`] (also run when the last clone drops) stops accepting
/// watchers, drains in-flight callbacks, force-detaches whatever watchers remain,
/// and joins every thread.
///
/// Completion surfaces in two steps: completed tasks queue up inside the runner,
/// and when that queue transitions from empty to non-empty the tasks-completed
/// callback (see [`set_tasks_completed_notify`]) runs on the loop thread. The
/// embedding drains [`pop_completed`] until it returns `None`; the notification
/// is level-triggered, so tasks completing while draining produce another one.
///
/// [`pop_completed`]: Self::pop_completed
/// [`set_tasks_completed_notify`]: Self::set_tasks_completed_notify
/// [`shutdown`]: Self::shutdown
#[derive(Clone, Debug)]
pub struct Runner {
    core: Arc<RunnerCore>,
}

impl Runner {
    /// Spawns the loop thread (waiting until it is actually inside its dispatch)
    /// and the worker pool.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerSpawnError`] when the poller or the loop thread cannot be
    /// created. Worker-thread creation failure is fatal.
    pub fn new(config: RunnerConfig) -> Result<Self, RunnerSpawnError> {
        assert!(config.worker_count > 0, "runner needs at least one worker");
        let event_loop = EventLoop::spawn(config.event_loop)?;
        event_loop.wait_running(true);
        let pool = WorkerPool::new(config.worker_count, InvokeHooks);
        debug!(backend = %config.event_loop, workers = config.worker_count, "runner up");
        Ok(Self {
            core: Arc::new(RunnerCore {
                pool,
                event_loop,
                completed: Mutex::new(VecDeque::new()),
                completed_notify: Mutex::new(None),
                disposing: AtomicBool::new(false),
                live_watchers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Creates a fresh task with no watchers. Note that a task which never
    /// receives a watcher never completes on its own; it just gets dropped with
    /// its handles.
    #[must_use]
    pub fn create_task(&self) -> Task { self.core.create_task_handle() }

    /// Pops one completed task, or `None` when the queue is empty. Never blocks.
    #[must_use]
    pub fn pop_completed(&self) -> Option<Task> {
        self.core.completed.lock_unpoisoned().pop_front()
    }

    /// Installs the callback that runs on the loop thread whenever the completed
    /// queue transitions from empty to non-empty.
    pub fn set_tasks_completed_notify(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.core.completed_notify.lock_unpoisoned() = Some(Arc::new(callback));
    }

    /// Stops the runner: new watchers are rejected, queued callbacks drain,
    /// surviving watchers are force-detached (their destructors still run exactly
    /// once), then the loop quits and every thread is joined. Idempotent.
    pub fn shutdown(&self) { self.core.shutdown(); }
}

pub(crate) struct RunnerCore {
    pool: WorkerPool<Invocation, InvokeHooks>,
    event_loop: Arc<EventLoop>,
    completed: Mutex<VecDeque<Task>>,
    completed_notify: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    disposing: AtomicBool,
    /// Weak handles to every watcher ever created, so shutdown can force-detach
    /// survivors. Pruned amortized as it grows.
    live_watchers: Mutex<Vec<Weak<WatcherCore>>>,
}

impl RunnerCore {
    pub(crate) fn event_loop(&self) -> &EventLoop { &self.event_loop }

    pub(crate) fn is_disposing(&self) -> bool { self.disposing.load(Ordering::SeqCst) }

    pub(crate) fn create_task_handle(self: &Arc<Self>) -> Task {
        assert!(!self.is_disposing(), "task created on a runner that is shutting down");
        Task::from_core(TaskCore::new(Arc::downgrade(self)))
    }

    /// Hands an invocation to the pool. During shutdown (or losing the race with
    /// it) the invocation degrades to an inline detach: the callback is skipped
    /// but the watcher still detaches, so destructors run and counts stay
    /// balanced.
    pub(crate) fn dispatch(&self, invocation: Invocation) {
        if self.is_disposing() {
            invocation.watcher.detach(None);
            return;
        }
        if let Err(invocation) = self.pool.try_push(invocation) {
            invocation.watcher.detach(None);
        }
    }

    pub(crate) fn register_watcher(&self, watcher: &Arc<WatcherCore>) {
        let mut registry = self.live_watchers.lock_unpoisoned();
        registry.push(Arc::downgrade(watcher));
        if registry.len() % WATCHER_REGISTRY_PRUNE_STRIDE == 0 {
            registry.retain(|weak| weak.strong_count() > 0);
        }
    }

    /// Called by a task the moment it transitions to completed.
    pub(crate) fn task_completed(&self, task: &Arc<TaskCore>) {
        let was_empty = {
            let mut queue = self.completed.lock_unpoisoned();
            let was_empty = queue.is_empty();
            queue.push_back(Task::from_core(task.clone()));
            was_empty
        };
        if was_empty {
            let notify = self.completed_notify.lock_unpoisoned().clone();
            if let Some(notify) = notify {
                self.event_loop.post(LoopMsg::Run(Box::new(move || notify())));
            }
        }
    }

    fn shutdown(&self) {
        if self.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("runner shutting down");

        // The notify closure routinely captures a Runner clone; dropping it here
        // breaks that reference cycle so the runner can actually be freed.
        *self.completed_notify.lock_unpoisoned() = None;

        // Drain everything already queued (those callbacks run normally), then
        // join the workers. Invocations produced past this point degrade to
        // inline detaches inside dispatch().
        self.pool.shutdown();

        // Anything still attached - idle/io watchers that never fired, subtask
        // watchers on tasks that never completed - is forced to detach now.
        // Destructors run here; the loop is still alive to process the release
        // messages.
        let survivors: Vec<Arc<WatcherCore>> = {
            let mut registry = self.live_watchers.lock_unpoisoned();
            registry.drain(..).filter_map(|weak| weak.upgrade()).collect()
        };
        for watcher in survivors {
            watcher.set_removed_flag();
            watcher.detach(None);
        }

        self.event_loop.quit();
        self.event_loop.join();
        debug!("runner down");
    }
}

impl Drop for RunnerCore {
    fn drop(&mut self) { self.shutdown(); }
}

impl std::fmt::Debug for RunnerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerCore")
            .field("disposing", &self.is_disposing())
            .field("completed", &self.completed.lock_unpoisoned().len())
            .finish()
    }
}
