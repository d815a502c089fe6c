// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll kqueue

//! The single-threaded I/O + idle dispatcher behind every runner.
//!
//! One dedicated thread blocks in an OS poller; everything else talks to it by
//! posting [`LoopMsg`]s and poking the backend's waker. That makes watcher
//! registration safe from any thread: the message crosses over, and the actual
//! backend registration happens on the loop thread.
//!
//! When a source becomes ready the loop does **not** run the user callback.
//! It masks the source (so it cannot re-fire mid-callback) and hands the watcher
//! to the runner, which queues an invocation on the worker pool. The source is
//! re-armed only after the callback returns [`Continuation::Continue`] - which is
//! what makes fd watchers level-triggered from the user's point of view.
//!
//! Two interchangeable backends implement this contract: [`MioBackend`]
//! (epoll/kqueue via `mio`, the default) and [`PollingBackend`] (the `polling`
//! crate with its built-in notifier). Select one through
//! [`EventLoopKind`](crate::EventLoopKind).
//!
//! [`Continuation::Continue`]: crate::Continuation::Continue
//! [`MioBackend`]: mio_backend::MioBackend
//! [`PollingBackend`]: polling_backend::PollingBackend

// Attach sources.
pub(crate) mod mio_backend;
pub(crate) mod polling_backend;

use std::{mem,
          os::fd::RawFd,
          sync::{Arc, Condvar, Mutex, PoisonError},
          thread::JoinHandle,
          time::Duration};

use crossbeam_channel::{Receiver, Sender, unbounded};
use smallvec::SmallVec;
use tracing::debug;

use crate::{common::MutexExt,
            config::EventLoopKind,
            task::watcher::{WatcherCore, WatcherFlags, WatcherKind}};

/// Failed to bring up an event loop.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum EventLoopError {
    /// The OS poller could not be created.
    #[error("failed to create the {kind} poller")]
    #[diagnostic(
        code(r3bl_joist::event_loop::backend_creation),
        help(
            "Pollers consume file descriptors; check the fd limit with `ulimit -n` \
             if this happens under load."
        )
    )]
    BackendCreation {
        kind: EventLoopKind,
        #[source]
        source: std::io::Error,
    },

    /// [`std::thread::Builder::spawn`] failed for the loop thread.
    #[error("failed to spawn the event loop thread")]
    #[diagnostic(
        code(r3bl_joist::event_loop::thread_spawn),
        help("The process may have hit its thread limit; check `ulimit -u`.")
    )]
    ThreadSpawn(#[source] std::io::Error),
}

/// Work posted to the loop thread.
pub(crate) enum LoopMsg {
    /// Arm an idle watcher.
    StartIdle(Arc<WatcherCore>),
    /// Register an fd watcher with the poller.
    StartIo(Arc<WatcherCore>),
    /// Re-enable a masked source after its callback returned "keep".
    Rearm(Arc<WatcherCore>),
    /// Drop the backend state of a detached watcher.
    Release(Arc<WatcherCore>),
    /// Run a closure on the loop thread (used for the tasks-completed
    /// notification).
    Run(Box<dyn FnOnce() + Send>),
    /// Make `run` return once pending messages drain.
    Quit,
}

/// Interrupts the loop thread's blocking poll so freshly posted messages get
/// seen. One waker exists per loop, coupled to its poller instance.
pub(crate) trait LoopWaker: Send + Sync + 'static {
    fn wake(&self);
}

/// A backend's whole job: block in its poller, dispatch readiness, drain
/// messages, return when told to quit.
pub(crate) trait LoopBackend: Send {
    fn run(&mut self);
}

/// Mutex + condvar gate publishing whether the loop thread is inside `run`.
/// Lets the runner post work only once the loop is really up, and observe the
/// loop winding down.
pub(crate) struct RunningGate {
    state: Mutex<bool>,
    cond: Condvar,
}

impl RunningGate {
    fn new() -> Self {
        Self { state: Mutex::new(false), cond: Condvar::new() }
    }

    fn set(&self, running: bool) {
        *self.state.lock_unpoisoned() = running;
        self.cond.notify_all();
    }

    fn wait(&self, running: bool) {
        let mut guard = self.state.lock_unpoisoned();
        while *guard != running {
            guard = self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Handle to a running event loop thread.
pub(crate) struct EventLoop {
    kind: EventLoopKind,
    tx: Sender<LoopMsg>,
    waker: Box<dyn LoopWaker>,
    running: RunningGate,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Builds the chosen backend and spawns the loop thread.
    pub(crate) fn spawn(kind: EventLoopKind) -> Result<Arc<Self>, EventLoopError> {
        let (tx, rx) = unbounded();
        let (backend, waker): (Box<dyn LoopBackend + Send>, Box<dyn LoopWaker>) = match kind {
            EventLoopKind::Mio => {
                let (backend, waker) = mio_backend::MioBackend::new(rx)
                    .map_err(|source| EventLoopError::BackendCreation { kind, source })?;
                (Box::new(backend), Box::new(waker))
            }
            EventLoopKind::Polling => {
                let (backend, waker) = polling_backend::PollingBackend::new(rx)
                    .map_err(|source| EventLoopError::BackendCreation { kind, source })?;
                (Box::new(backend), Box::new(waker))
            }
        };

        let event_loop = Arc::new(EventLoop {
            kind,
            tx,
            waker,
            running: RunningGate::new(),
            thread: Mutex::new(None),
        });

        let thread = std::thread::Builder::new()
            .name("joist-loop".into())
            .spawn({
                let event_loop = event_loop.clone();
                let mut backend = backend;
                move || {
                    debug!(kind = %event_loop.kind, "event loop running");
                    event_loop.running.set(true);
                    backend.run();
                    event_loop.running.set(false);
                    debug!(kind = %event_loop.kind, "event loop exited");
                }
            })
            .map_err(EventLoopError::ThreadSpawn)?;
        *event_loop.thread.lock_unpoisoned() = Some(thread);

        Ok(event_loop)
    }

    /// Posts a message and wakes the loop thread. Safe from any thread; silently
    /// drops the message if the loop already exited.
    pub(crate) fn post(&self, msg: LoopMsg) {
        if self.tx.send(msg).is_ok() {
            self.waker.wake();
        }
    }

    pub(crate) fn quit(&self) { self.post(LoopMsg::Quit); }

    /// Blocks until the loop thread's running flag matches `running`.
    pub(crate) fn wait_running(&self, running: bool) { self.running.wait(running); }

    pub(crate) fn join(&self) {
        if let Some(handle) = self.thread.lock_unpoisoned().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop").field("kind", &self.kind).finish()
    }
}

/// Backend-side fd registrar; each backend maps these onto its poller calls.
pub(crate) trait IoRegistrar {
    fn start_io(&mut self, watcher: Arc<WatcherCore>);
    fn rearm_io(&mut self, watcher: &Arc<WatcherCore>);
    fn release_io(&mut self, watcher: &Arc<WatcherCore>);
}

/// Message and idle-watcher handling common to both backends.
pub(crate) struct LoopState {
    rx: Receiver<LoopMsg>,
    idle_armed: Vec<Arc<WatcherCore>>,
    pub(crate) quitting: bool,
}

impl LoopState {
    pub(crate) fn new(rx: Receiver<LoopMsg>) -> Self {
        Self { rx, idle_armed: Vec::new(), quitting: false }
    }

    /// Applies every message currently queued.
    pub(crate) fn drain_msgs(&mut self, io: &mut impl IoRegistrar) {
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                LoopMsg::StartIdle(watcher) => {
                    if !watcher.is_detached() {
                        self.idle_armed.push(watcher);
                    }
                }
                LoopMsg::StartIo(watcher) => {
                    if !watcher.is_detached() {
                        io.start_io(watcher);
                    }
                }
                LoopMsg::Rearm(watcher) => {
                    if watcher.is_detached() {
                        continue;
                    }
                    match &watcher.kind {
                        WatcherKind::Idle => self.idle_armed.push(watcher),
                        WatcherKind::Io { .. } => io.rearm_io(&watcher),
                        WatcherKind::Immediate | WatcherKind::Subtask { .. } => {}
                    }
                }
                LoopMsg::Release(watcher) => match &watcher.kind {
                    WatcherKind::Idle => {
                        self.idle_armed.retain(|candidate| !Arc::ptr_eq(candidate, &watcher));
                    }
                    WatcherKind::Io { .. } => io.release_io(&watcher),
                    WatcherKind::Immediate | WatcherKind::Subtask { .. } => {}
                },
                LoopMsg::Run(f) => f(),
                LoopMsg::Quit => self.quitting = true,
            }
        }
    }

    /// Zero when idle watchers are armed (poll must not block), unbounded
    /// otherwise.
    pub(crate) fn poll_timeout(&self) -> Option<Duration> {
        if self.idle_armed.is_empty() { None } else { Some(Duration::ZERO) }
    }

    /// Fires every armed idle watcher once. Fired watchers are masked (off the
    /// armed list) until their callback finishes and a rearm message returns
    /// them.
    pub(crate) fn dispatch_idles(&mut self) {
        for watcher in mem::take(&mut self.idle_armed) {
            if !watcher.is_detached() {
                watcher.ready(WatcherFlags::NONE);
            }
        }
    }
}

/// Extracts the fd parameters of an io watcher.
pub(crate) fn io_params(watcher: &WatcherCore) -> (RawFd, WatcherFlags) {
    match &watcher.kind {
        WatcherKind::Io { fd, interest } => (*fd, *interest),
        _ => unreachable!("io_params on a non-io watcher"),
    }
}

/// One fd watcher's registration state inside a backend.
pub(crate) struct IoSlot {
    watcher: Arc<WatcherCore>,
    interest: WatcherFlags,
    /// Set while an invocation is in flight; a masked slot contributes nothing
    /// to the fd's armed interest.
    masked: bool,
}

/// All watchers sharing one fd. Their unmasked interests are OR-ed into the
/// single registration the poller sees.
#[derive(Default)]
pub(crate) struct FdSlots(SmallVec<[IoSlot; 2]>);

impl FdSlots {
    pub(crate) fn push(&mut self, watcher: Arc<WatcherCore>) {
        let (_, interest) = io_params(&watcher);
        self.0.push(IoSlot { watcher, interest, masked: false });
    }

    pub(crate) fn remove(&mut self, watcher: &Arc<WatcherCore>) {
        self.0.retain(|slot| !Arc::ptr_eq(&slot.watcher, watcher));
    }

    pub(crate) fn unmask(&mut self, watcher: &Arc<WatcherCore>) {
        for slot in &mut self.0 {
            if Arc::ptr_eq(&slot.watcher, watcher) {
                slot.masked = false;
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Union of the unmasked interests: what the poller should watch right now.
    pub(crate) fn desired(&self) -> WatcherFlags {
        self.0
            .iter()
            .filter(|slot| !slot.masked && !slot.watcher.is_detached())
            .fold(WatcherFlags::NONE, |acc, slot| acc | slot.interest)
    }

    /// Routes observed readiness to the interested unmasked slots, masking each
    /// one it fires. `error` readiness (hup and friends) wakes every interested
    /// direction so callbacks observe the failure from their own read/write.
    pub(crate) fn deliver(&mut self, ready: WatcherFlags, error: bool) {
        for slot in &mut self.0 {
            if slot.masked || slot.watcher.is_detached() {
                continue;
            }
            let hit = if error { slot.interest } else { slot.interest.intersection(ready) };
            if hit.is_empty() {
                continue;
            }
            slot.masked = true;
            slot.watcher.ready(hit);
        }
    }
}
