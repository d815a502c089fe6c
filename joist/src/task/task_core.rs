// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Tasks: execution contexts that stay alive while they have watchers.
//!
//! A task is resumed whenever one of its watchers fires; at most one callback per
//! task runs at any instant (the invoker slot in [`InvokerSlot`] enforces this).
//! When the watcher count and the completion-block count both reach zero the task
//! transitions to completed, exactly once: subtask watchers registered on it fan
//! out, then the task lands on the runner's completed queue.

use std::{collections::VecDeque,
          fmt,
          mem,
          os::fd::RawFd,
          sync::{Arc, Mutex, Weak,
                 atomic::{AtomicBool, AtomicUsize, Ordering}},
          thread::ThreadId};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::trace;

use super::{runner::RunnerCore,
            value::TaskValue,
            watcher::{Watcher, WatcherCallback, WatcherCore, WatcherFlags, WatcherKind}};
use crate::{common::{Continuation, MutexExt},
            event_loop::LoopMsg,
            task_local::{LocalKey, LocalValue, with_worker_map}};

/// Serializes callback invocation per task: `busy` is the single-occupancy
/// invoker slot, `pending` holds invocations that arrived while it was occupied.
#[derive(Default)]
pub(crate) struct InvokerSlot {
    pub(crate) busy: bool,
    pub(crate) pending: VecDeque<(Arc<WatcherCore>, WatcherFlags)>,
}

/// Shared task state. Tasks hold a weak edge back to the runner; aliveness flows
/// the other way, through the watcher count.
pub(crate) struct TaskCore {
    pub(crate) runner: Weak<RunnerCore>,
    watcher_count: AtomicUsize,
    completion_blocked: AtomicUsize,
    completed: AtomicBool,
    has_run: AtomicBool,
    invoker: Mutex<InvokerSlot>,
    args: Mutex<FxHashMap<String, TaskValue>>,
    result: Mutex<Option<TaskValue>>,
    /// Subtask watchers (owned by parent tasks) waiting on this task's
    /// completion.
    completion_watchers: Mutex<SmallVec<[Arc<WatcherCore>; 4]>>,
    /// The worker currently running a callback for this task, if any.
    current_thread: Mutex<Option<ThreadId>>,
}

impl TaskCore {
    pub(crate) fn new(runner: Weak<RunnerCore>) -> Arc<Self> {
        Arc::new(Self {
            runner,
            watcher_count: AtomicUsize::new(0),
            completion_blocked: AtomicUsize::new(0),
            completed: AtomicBool::new(false),
            has_run: AtomicBool::new(false),
            invoker: Mutex::new(InvokerSlot::default()),
            args: Mutex::new(FxHashMap::default()),
            result: Mutex::new(None),
            completion_watchers: Mutex::new(SmallVec::new()),
            current_thread: Mutex::new(None),
        })
    }

    pub(crate) fn invoker_lock(&self) -> std::sync::MutexGuard<'_, InvokerSlot> {
        self.invoker.lock_unpoisoned()
    }

    pub(crate) fn is_completed(&self) -> bool { self.completed.load(Ordering::SeqCst) }

    pub(crate) fn watchers_inc(&self) { self.watcher_count.fetch_add(1, Ordering::SeqCst); }

    pub(crate) fn watchers_dec(self: &Arc<Self>) {
        let previous = self.watcher_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "watcher count underflow");
        if previous == 1 {
            self.maybe_complete();
        }
    }

    pub(crate) fn block_completion(&self) {
        self.completion_blocked.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn unblock_completion(self: &Arc<Self>) {
        let previous = self.completion_blocked.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "unblock_completion without a matching block");
        if previous == 1 {
            self.maybe_complete();
        }
    }

    /// Completion check run after every decrement of either counter. The CAS on
    /// the completed flag makes the transition exactly-once even when two
    /// decrements race, and makes late watchers on an already-completed task
    /// benign (their detach re-runs this and loses the CAS).
    fn maybe_complete(self: &Arc<Self>) {
        if self.watcher_count.load(Ordering::SeqCst) != 0
            || self.completion_blocked.load(Ordering::SeqCst) != 0
        {
            return;
        }
        if self
            .completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        trace!("task completed");

        // Fan out to parents first, then surface on the completed queue.
        let to_notify = mem::take(&mut *self.completion_watchers.lock_unpoisoned());
        for watcher in to_notify {
            watcher.ready(WatcherFlags::NONE);
        }
        if let Some(runner) = self.runner.upgrade() {
            runner.task_completed(self);
        }
    }

    /// Registers a parent's subtask watcher. If this task already completed, the
    /// watcher fires immediately instead of waiting forever.
    pub(crate) fn add_completion_watcher(self: &Arc<Self>, watcher: Arc<WatcherCore>) {
        let fire_now = {
            let mut list = self.completion_watchers.lock_unpoisoned();
            if self.is_completed() {
                true
            } else {
                list.push(watcher.clone());
                false
            }
        };
        if fire_now {
            watcher.ready(WatcherFlags::NONE);
        }
    }

    pub(crate) fn remove_completion_watcher(&self, watcher: &WatcherCore) {
        self.completion_watchers
            .lock_unpoisoned()
            .retain(|candidate| !std::ptr::eq(Arc::as_ptr(candidate), watcher));
    }

    pub(crate) fn mark_has_run(&self) { self.has_run.store(true, Ordering::SeqCst); }

    pub(crate) fn enter_invoke(&self) {
        *self.current_thread.lock_unpoisoned() = Some(std::thread::current().id());
    }

    pub(crate) fn leave_invoke(&self) { *self.current_thread.lock_unpoisoned() = None; }

    pub(crate) fn in_task_thread(&self) -> bool {
        *self.current_thread.lock_unpoisoned() == Some(std::thread::current().id())
    }

    fn add_arg(&self, name: String, value: TaskValue) {
        assert!(
            !self.has_run.load(Ordering::SeqCst),
            "arguments can only be added before the task first runs"
        );
        let previous = self.args.lock_unpoisoned().insert(name, value);
        assert!(previous.is_none(), "argument added twice");
    }

    fn set_result(&self, value: TaskValue) {
        let mut slot = self.result.lock_unpoisoned();
        assert!(slot.is_none(), "task result set twice");
        *slot = Some(value);
    }
}

impl fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCore")
            .field("watchers", &self.watcher_count.load(Ordering::SeqCst))
            .field("blocked", &self.completion_blocked.load(Ordering::SeqCst))
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Handle to a task. Clones share the same task; equality is identity.
///
/// Create via [`Runner::create_task`] (or [`Task::create_task`] for children),
/// attach watchers, and let the last detach complete the task. See the module
/// docs for the lifecycle.
///
/// [`Runner::create_task`]: super::Runner::create_task
#[derive(Clone, Debug)]
pub struct Task {
    pub(crate) core: Arc<TaskCore>,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.core, &other.core) }
}

impl Eq for Task {}

impl Task {
    pub(crate) fn from_core(core: Arc<TaskCore>) -> Self { Self { core } }

    /// Creates an independent child task in the same runner. The child shares
    /// nothing with this task; attach a subtask watcher to observe it.
    #[must_use]
    pub fn create_task(&self) -> Task {
        let runner = self
            .core
            .runner
            .upgrade()
            .expect("task outlived its runner");
        runner.create_task_handle()
    }

    /// Adds a named argument. Only allowed until the task first runs; each name
    /// can be set once.
    pub fn add_arg(&self, name: impl Into<String>, value: impl Into<TaskValue>) {
        self.core.add_arg(name.into(), value.into());
    }

    #[must_use]
    pub fn get_arg(&self, name: &str) -> Option<TaskValue> {
        self.core.args.lock_unpoisoned().get(name).cloned()
    }

    /// Snapshot of every argument.
    #[must_use]
    pub fn get_args(&self) -> Vec<(String, TaskValue)> {
        self.core
            .args
            .lock_unpoisoned()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Stores the task's result. Single-writer: a second call panics.
    pub fn set_result(&self, value: impl Into<TaskValue>) {
        self.core.set_result(value.into());
    }

    #[must_use]
    pub fn get_result(&self) -> Option<TaskValue> {
        self.core.result.lock_unpoisoned().clone()
    }

    /// Keeps the task alive independently of watchers until the matching
    /// [`unblock_completion`].
    ///
    /// [`unblock_completion`]: Self::unblock_completion
    pub fn block_completion(&self) { self.core.block_completion(); }

    pub fn unblock_completion(&self) { self.core.unblock_completion(); }

    #[must_use]
    pub fn is_completed(&self) -> bool { self.core.is_completed() }

    /// True while the calling thread is running one of this task's callbacks.
    /// Meant for assertions in user code.
    #[must_use]
    pub fn check_in_task_thread(&self) -> bool { self.core.in_task_thread() }

    /// Reads this task's per-worker thread-local slot. Only callable from inside
    /// one of the task's callbacks; the servicing worker may change between
    /// callbacks but never during one.
    #[must_use]
    pub fn get_thread_local(&self, key: LocalKey) -> Option<LocalValue> {
        assert!(
            self.check_in_task_thread(),
            "thread-local access outside the task's current thread"
        );
        with_worker_map(|map| map.get(key))
    }

    /// Writes this task's per-worker thread-local slot, dropping any previous
    /// value. Same threading contract as [`get_thread_local`].
    ///
    /// [`get_thread_local`]: Self::get_thread_local
    pub fn set_thread_local(&self, key: LocalKey, value: LocalValue) {
        assert!(
            self.check_in_task_thread(),
            "thread-local access outside the task's current thread"
        );
        with_worker_map(|map| map.set(key, value));
    }

    /// Clears this task's per-worker thread-local slot, dropping the previous
    /// value if any.
    pub fn remove_thread_local(&self, key: LocalKey) {
        assert!(
            self.check_in_task_thread(),
            "thread-local access outside the task's current thread"
        );
        with_worker_map(|map| map.remove(key));
    }

    /// Adds a watcher that fires exactly once, as soon as possible. The callback
    /// return value is ignored (the watcher always detaches after firing).
    pub fn add_immediate(
        &self,
        callback: impl FnMut(&Task, WatcherFlags) -> Continuation + Send + 'static,
    ) -> Watcher {
        self.add_watcher(WatcherKind::Immediate, Box::new(callback))
    }

    /// Adds a watcher that fires whenever the loop is otherwise idle, until the
    /// callback returns [`Continuation::Stop`] or the watcher is removed.
    ///
    /// [`Continuation::Stop`]: crate::Continuation::Stop
    pub fn add_idle(
        &self,
        callback: impl FnMut(&Task, WatcherFlags) -> Continuation + Send + 'static,
    ) -> Watcher {
        self.add_watcher(WatcherKind::Idle, Box::new(callback))
    }

    /// Adds a level-triggered fd watcher. The callback receives the observed
    /// ready directions; the fd is not monitored again until the callback
    /// returns.
    pub fn add_io(
        &self,
        fd: RawFd,
        interest: WatcherFlags,
        callback: impl FnMut(&Task, WatcherFlags) -> Continuation + Send + 'static,
    ) -> Watcher {
        assert!(!interest.is_empty(), "io watcher needs a read or write interest");
        self.add_watcher(WatcherKind::Io { fd, interest }, Box::new(callback))
    }

    /// Adds a watcher on this task that fires once when `child` completes. Keeps
    /// this task alive until then. If `child` already completed, the watcher
    /// fires right away.
    pub fn add_subtask(
        &self,
        child: &Task,
        callback: impl FnMut(&Task, WatcherFlags) -> Continuation + Send + 'static,
    ) -> Watcher {
        assert!(
            !self.core.is_completed(),
            "subtask watcher added to an already-completed task"
        );
        self.add_watcher(
            WatcherKind::Subtask { target: child.core.clone() },
            Box::new(callback),
        )
    }

    fn add_watcher(&self, kind: WatcherKind, callback: WatcherCallback) -> Watcher {
        let runner = self
            .core
            .runner
            .upgrade()
            .expect("watcher added after the runner was dropped");
        assert!(
            !runner.is_disposing(),
            "watcher added to a runner that is shutting down"
        );

        self.core.watchers_inc();
        let core = WatcherCore::new(
            self.core.clone(),
            kind,
            Arc::downgrade(&runner),
            callback,
        );
        runner.register_watcher(&core);

        match &core.kind {
            WatcherKind::Immediate => core.ready(WatcherFlags::NONE),
            WatcherKind::Idle => runner.event_loop().post(LoopMsg::StartIdle(core.clone())),
            WatcherKind::Io { .. } => runner.event_loop().post(LoopMsg::StartIo(core.clone())),
            WatcherKind::Subtask { target } => target.add_completion_watcher(core.clone()),
        }

        Watcher { core }
    }
}
