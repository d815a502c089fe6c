// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The invocation path: what happens between "watcher is ready" and "user
//! callback ran".
//!
//! Workers pop [`Invocation`]s off the pool queue. Before running the callback a
//! worker must win the task's invoker slot; losing parks the invocation on the
//! task's pending queue, and whichever worker finishes the running callback
//! re-dispatches the next pending invocation to the pool. This is what guarantees
//! at most one callback per task at any instant, across all workers.

use std::sync::Arc;

use tracing::error;

use super::{task_core::TaskCore,
            watcher::{WatcherCore, WatcherFlags},
            Task};
use crate::{common::Continuation,
            pool::WorkerHooks,
            task_local::{install_worker_map, teardown_worker_map}};

/// A ready watcher plus the observed ready flags, on its way to a worker.
pub(crate) struct Invocation {
    pub(crate) watcher: Arc<WatcherCore>,
    pub(crate) flags: WatcherFlags,
}

/// Pool hooks for runner workers: each worker carries a thread-local map for
/// task thread-local state, built at startup and destroyed (running every stored
/// value's destructor) at pool shutdown.
pub(crate) struct InvokeHooks;

impl WorkerHooks<Invocation> for InvokeHooks {
    type ThreadState = ();

    fn thread_start(&self) { install_worker_map(); }

    fn handle_item(&self, (): &mut (), invocation: Invocation) {
        run_invocation(invocation);
    }

    fn thread_finish(&self, (): ()) { teardown_worker_map(); }
}

/// Runs one invocation under task serialization.
pub(crate) fn run_invocation(invocation: Invocation) {
    let Invocation { watcher, flags } = invocation;
    if watcher.is_detached() {
        return;
    }
    let task_core = watcher.task.clone();

    // Try to claim the invoker slot; park the invocation if it is occupied. The
    // finishing worker re-dispatches parked invocations, so nothing is lost.
    {
        let mut slot = task_core.invoker_lock();
        if slot.busy {
            slot.pending.push_back((watcher, flags));
            return;
        }
        slot.busy = true;
    }

    invoke(&task_core, &watcher, flags);

    let next = {
        let mut slot = task_core.invoker_lock();
        slot.busy = false;
        slot.pending.pop_front()
    };
    if let Some((next_watcher, next_flags)) = next {
        // Back through the pool rather than inline, so one busy task cannot
        // monopolize this worker.
        next_watcher.ready(next_flags);
    }
}

/// Aborts the process if dropped during an unwind. Panics must not cross the
/// pool: a panicking user callback would otherwise silently kill one worker and
/// leave its task wedged with the invoker slot claimed.
struct AbortOnPanic;

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("user callback panicked; aborting");
            std::process::abort();
        }
    }
}

/// Runs the user callback (unless the watcher was removed) and applies the
/// keep/detach verdict.
fn invoke(task_core: &Arc<TaskCore>, watcher: &Arc<WatcherCore>, flags: WatcherFlags) {
    let mut callback = watcher.take_callback();
    let mut verdict = Continuation::Stop;

    if !watcher.is_removed() {
        if let Some(callback) = callback.as_mut() {
            task_core.mark_has_run();
            let handle = Task::from_core(task_core.clone());
            task_core.enter_invoke();
            let abort_guard = AbortOnPanic;
            verdict = callback(&handle, flags);
            std::mem::forget(abort_guard);
            task_core.leave_invoke();
        }
    }

    // Re-check removed: the callback itself may have called remove().
    let keep = verdict == Continuation::Continue
        && watcher.kind.rearmable()
        && !watcher.is_removed();
    if keep {
        watcher.put_back_callback(callback);
        watcher.rearm();
    } else {
        watcher.detach(callback);
    }
}
