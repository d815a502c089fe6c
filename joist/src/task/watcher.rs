// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Watchers: the readiness sources a task stays alive for.
//!
//! A watcher couples a readiness condition (fire now, loop idle, fd ready, child
//! task completed) with a user callback invoked on a pool worker under task
//! serialization. Lifecycle invariants:
//!
//! - Creating a watcher increments its task's watcher count.
//! - Detaching decrements it exactly once, whether the callback returned
//!   [`Continuation::Stop`], the user called [`Watcher::remove`], or the runner
//!   shut down.
//! - The user callback (and with it the destructors of everything it captured) is
//!   dropped exactly once, at detach, before the count decrement - so by the time
//!   the owning task completes, its watchers' user state is gone.
//!
//! [`Continuation::Stop`]: crate::Continuation::Stop

use std::{fmt,
          ops::BitOr,
          os::fd::RawFd,
          sync::{Arc, Mutex, Weak,
                 atomic::{AtomicBool, Ordering}}};

use tracing::trace;

use super::{invoke::Invocation, runner::RunnerCore, task_core::TaskCore, Task};
use crate::{common::{Continuation, MutexExt},
            event_loop::LoopMsg};

/// Read/write direction bits for I/O watchers; also carried (empty) on every
/// other watcher kind so all callbacks share one signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatcherFlags(u8);

impl WatcherFlags {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(1 << 1);

    #[must_use]
    pub fn is_empty(self) -> bool { self.0 == 0 }

    #[must_use]
    pub fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }

    #[must_use]
    pub fn intersects(self, other: Self) -> bool { self.0 & other.0 != 0 }

    #[must_use]
    pub fn intersection(self, other: Self) -> Self { Self(self.0 & other.0) }
}

impl BitOr for WatcherFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self { Self(self.0 | rhs.0) }
}

/// Signature of every watcher callback. Returning [`Continuation::Continue`]
/// keeps the watcher armed; [`Continuation::Stop`] detaches it.
pub(crate) type WatcherCallback = Box<dyn FnMut(&Task, WatcherFlags) -> Continuation + Send>;

/// What the watcher waits for.
pub(crate) enum WatcherKind {
    /// Ready as soon as created; fires exactly once.
    Immediate,
    /// Fires whenever the loop has nothing else to do.
    Idle,
    /// Fires when `fd` is ready in at least one requested direction.
    Io { fd: RawFd, interest: WatcherFlags },
    /// Fires once when `target` completes.
    Subtask { target: Arc<TaskCore> },
}

impl WatcherKind {
    /// Whether this kind can fire more than once.
    pub(crate) fn rearmable(&self) -> bool {
        matches!(self, WatcherKind::Idle | WatcherKind::Io { .. })
    }
}

impl fmt::Debug for WatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherKind::Immediate => f.write_str("Immediate"),
            WatcherKind::Idle => f.write_str("Idle"),
            WatcherKind::Io { fd, interest } => {
                f.debug_struct("Io").field("fd", fd).field("interest", interest).finish()
            }
            WatcherKind::Subtask { .. } => f.write_str("Subtask"),
        }
    }
}

/// Shared watcher state. Forward ownership runs watcher -> task; the runner is a
/// weak back edge so a disposed runner never keeps watchers alive.
pub(crate) struct WatcherCore {
    pub(crate) task: Arc<TaskCore>,
    pub(crate) kind: WatcherKind,
    pub(crate) runner: Weak<RunnerCore>,
    removed: AtomicBool,
    detached: AtomicBool,
    callback: Mutex<Option<WatcherCallback>>,
}

impl WatcherCore {
    pub(crate) fn new(
        task: Arc<TaskCore>,
        kind: WatcherKind,
        runner: Weak<RunnerCore>,
        callback: WatcherCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            task,
            kind,
            runner,
            removed: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
        })
    }

    pub(crate) fn is_removed(&self) -> bool { self.removed.load(Ordering::SeqCst) }

    pub(crate) fn is_detached(&self) -> bool { self.detached.load(Ordering::SeqCst) }

    /// Marks removed without scheduling a detach pass. Used by runner shutdown,
    /// which detaches directly afterwards.
    pub(crate) fn set_removed_flag(&self) { self.removed.store(true, Ordering::SeqCst); }

    pub(crate) fn take_callback(&self) -> Option<WatcherCallback> {
        self.callback.lock_unpoisoned().take()
    }

    pub(crate) fn put_back_callback(&self, callback: Option<WatcherCallback>) {
        *self.callback.lock_unpoisoned() = callback;
    }

    /// The readiness entry point: backends and completing tasks hand the watcher
    /// here, and an invocation travels to the pool.
    pub(crate) fn ready(self: &Arc<Self>, flags: WatcherFlags) {
        if self.is_detached() {
            return;
        }
        match self.runner.upgrade() {
            Some(runner) => runner.dispatch(Invocation { watcher: self.clone(), flags }),
            None => self.detach(None),
        }
    }

    /// Re-enables the backend source after a callback returned
    /// [`Continuation::Continue`].
    pub(crate) fn rearm(self: &Arc<Self>) {
        debug_assert!(self.kind.rearmable());
        match self.runner.upgrade() {
            Some(runner) => runner.event_loop().post(LoopMsg::Rearm(self.clone())),
            None => self.detach(None),
        }
    }

    /// Requests removal from any thread. The actual detach runs under task
    /// serialization (a dedicated invocation that skips the user callback), so it
    /// can never overlap a running callback of the same watcher.
    pub(crate) fn request_remove(self: &Arc<Self>) {
        if self.removed.swap(true, Ordering::SeqCst) || self.is_detached() {
            return;
        }
        match self.runner.upgrade() {
            Some(runner) => {
                runner.dispatch(Invocation { watcher: self.clone(), flags: WatcherFlags::NONE });
            }
            None => self.detach(None),
        }
    }

    /// Tears the watcher down: exactly once, in this order - stop the backend
    /// registration, drop the user callback (running its captured destructors),
    /// then decrement the task's watcher count so completion can only be observed
    /// after the user state is gone.
    ///
    /// `taken` is the callback if the caller already pulled it out of the slot.
    pub(crate) fn detach(self: &Arc<Self>, taken: Option<WatcherCallback>) {
        if self.detached.swap(true, Ordering::SeqCst) {
            drop(taken);
            return;
        }
        trace!(kind = ?self.kind, "watcher detaching");
        match &self.kind {
            WatcherKind::Immediate => {}
            WatcherKind::Idle | WatcherKind::Io { .. } => {
                if let Some(runner) = self.runner.upgrade() {
                    runner.event_loop().post(LoopMsg::Release(self.clone()));
                }
            }
            WatcherKind::Subtask { target } => target.remove_completion_watcher(self),
        }
        drop(taken);
        drop(self.callback.lock_unpoisoned().take());
        self.task.watchers_dec();
    }
}

impl fmt::Debug for WatcherCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherCore")
            .field("kind", &self.kind)
            .field("removed", &self.is_removed())
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// Owner handle to a watcher.
///
/// Dropping the handle does not detach the watcher (the watcher's own lifecycle
/// does); call [`remove`] to cancel it.
///
/// [`remove`]: Self::remove
#[derive(Clone, Debug)]
pub struct Watcher {
    pub(crate) core: Arc<WatcherCore>,
}

impl Watcher {
    /// Cancels the watcher from any thread. The user callback will not run again;
    /// the destructor of its captured data still runs exactly once, on a worker
    /// under task serialization.
    pub fn remove(&self) { self.core.request_remove(); }

    #[must_use]
    pub fn is_removed(&self) -> bool { self.core.is_removed() }
}
