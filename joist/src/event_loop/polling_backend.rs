// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words oneshot

//! Alternate backend: the [`polling`] crate's poller with its built-in notifier.
//!
//! `polling` delivers sources in oneshot mode - after an event fires for an fd,
//! the kernel-side interest is cleared until the next `modify`. That lines up
//! with the mask-until-rearm protocol: after every delivery the registration is
//! re-synced from the unmasked slots.

use std::{collections::HashMap,
          io,
          os::fd::{BorrowedFd, RawFd},
          sync::Arc};

use crossbeam_channel::Receiver;
use polling::{Event, Events, Poller};
use tracing::trace;

use super::{FdSlots, IoRegistrar, LoopBackend, LoopMsg, LoopState, LoopWaker, io_params};
use crate::task::watcher::{WatcherCore, WatcherFlags};

/// Waker half: shares the poller and calls its notifier.
pub(crate) struct PollingWaker(Arc<Poller>);

impl LoopWaker for PollingWaker {
    fn wake(&self) {
        let _ = self.0.notify();
    }
}

struct FdEntry {
    added: bool,
    /// Interest currently armed in the kernel. Reset to empty after each
    /// delivery (oneshot).
    armed: WatcherFlags,
    slots: FdSlots,
}

pub(crate) struct PollingBackend {
    state: LoopState,
    io: PollingIo,
    events: Events,
}

pub(crate) struct PollingIo {
    poller: Arc<Poller>,
    fds: HashMap<RawFd, FdEntry>,
}

impl PollingBackend {
    /// Creates the poller and a waker sharing it.
    pub(crate) fn new(rx: Receiver<LoopMsg>) -> io::Result<(Self, PollingWaker)> {
        let poller = Arc::new(Poller::new()?);
        let waker = PollingWaker(poller.clone());
        Ok((
            Self {
                state: LoopState::new(rx),
                io: PollingIo { poller, fds: HashMap::new() },
                events: Events::new(),
            },
            waker,
        ))
    }
}

impl LoopBackend for PollingBackend {
    fn run(&mut self) {
        loop {
            self.state.drain_msgs(&mut self.io);
            if self.state.quitting {
                break;
            }

            let timeout = self.state.poll_timeout();
            self.events.clear();
            if let Err(e) = self.io.poller.wait(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                panic!("event loop wait failed: {e}");
            }

            let fired: Vec<(RawFd, WatcherFlags)> = self
                .events
                .iter()
                .map(|event| {
                    let fd = event.key as RawFd;
                    let mut ready = WatcherFlags::NONE;
                    if event.readable {
                        ready = ready | WatcherFlags::READ;
                    }
                    if event.writable {
                        ready = ready | WatcherFlags::WRITE;
                    }
                    (fd, ready)
                })
                .collect();

            for (fd, ready) in fired {
                trace!(fd, ?ready, "fd ready");
                if let Some(entry) = self.io.fds.get_mut(&fd) {
                    // The kernel side disarmed on delivery (oneshot).
                    entry.armed = WatcherFlags::NONE;
                    // A wakeup with neither direction set is an error/hangup
                    // report; wake every interested direction.
                    let error = ready.is_empty();
                    entry.slots.deliver(ready, error);
                }
                self.io.sync(fd);
            }

            self.state.dispatch_idles();
        }
    }
}

impl IoRegistrar for PollingIo {
    fn start_io(&mut self, watcher: Arc<WatcherCore>) {
        let (fd, _) = io_params(&watcher);
        let entry = self.fds.entry(fd).or_insert_with(|| FdEntry {
            added: false,
            armed: WatcherFlags::NONE,
            slots: FdSlots::default(),
        });
        entry.slots.push(watcher);
        self.sync(fd);
    }

    fn rearm_io(&mut self, watcher: &Arc<WatcherCore>) {
        let (fd, _) = io_params(watcher);
        if let Some(entry) = self.fds.get_mut(&fd) {
            entry.slots.unmask(watcher);
        }
        self.sync(fd);
    }

    fn release_io(&mut self, watcher: &Arc<WatcherCore>) {
        let (fd, _) = io_params(watcher);
        if let Some(entry) = self.fds.get_mut(&fd) {
            entry.slots.remove(watcher);
        }
        self.sync(fd);
    }
}

impl PollingIo {
    /// Reconciles the kernel-side interest of `fd` with the slots' desired
    /// interest.
    fn sync(&mut self, fd: RawFd) {
        let Some(entry) = self.fds.get_mut(&fd) else { return };

        if entry.slots.is_empty() {
            if entry.added {
                // Safety: the fd was alive when added and watchers release it
                // before closing; borrowing for the delete call is the caller's
                // contract.
                let _ = self.poller.delete(unsafe { BorrowedFd::borrow_raw(fd) });
            }
            self.fds.remove(&fd);
            return;
        }

        let desired = entry.slots.desired();
        if !entry.added {
            // Safety: caller guarantees the fd outlives its watchers.
            unsafe { self.poller.add(fd, event_for(fd, desired)) }
                .expect("fd registration failed");
            entry.added = true;
            entry.armed = desired;
        } else if entry.armed != desired {
            // Safety: same fd-lifetime contract as add above.
            self.poller
                .modify(unsafe { BorrowedFd::borrow_raw(fd) }, event_for(fd, desired))
                .expect("fd re-registration failed");
            entry.armed = desired;
        }
    }
}

fn event_for(fd: RawFd, flags: WatcherFlags) -> Event {
    let key = usize::try_from(fd).expect("fd fits in a poller key");
    let read = flags.contains(WatcherFlags::READ);
    let write = flags.contains(WatcherFlags::WRITE);
    match (read, write) {
        (true, true) => Event::all(key),
        (true, false) => Event::readable(key),
        (false, true) => Event::writable(key),
        (false, false) => Event::none(key),
    }
}
