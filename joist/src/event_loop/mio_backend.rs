// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll kqueue reregister deregister

//! Default backend: a [`mio::Poll`] (epoll on Linux, kqueue on macOS) with a
//! [`mio::Waker`] for cross-thread posts.

use std::{collections::HashMap, io, os::fd::RawFd, sync::Arc};

use crossbeam_channel::Receiver;
use mio::{Events, Interest, Poll, Token, Waker, unix::SourceFd};
use tracing::trace;

use super::{FdSlots, IoRegistrar, LoopBackend, LoopMsg, LoopState, LoopWaker, io_params};
use crate::task::watcher::{WatcherCore, WatcherFlags};

const WAKER_TOKEN: Token = Token(0);

/// Waker half: coupled to the `Poll` it was created from.
pub(crate) struct MioWaker(Waker);

impl LoopWaker for MioWaker {
    fn wake(&self) {
        // A failed wake only delays message pickup until the next poll timeout
        // or readiness event; nothing to do about it here.
        let _ = self.0.wake();
    }
}

struct FdEntry {
    token: Token,
    registered: bool,
    armed: WatcherFlags,
    slots: FdSlots,
}

pub(crate) struct MioBackend {
    state: LoopState,
    io: MioIo,
    events: Events,
}

pub(crate) struct MioIo {
    poll: Poll,
    fds: HashMap<RawFd, FdEntry>,
    tokens: HashMap<Token, RawFd>,
    next_token: usize,
}

impl MioBackend {
    /// Creates the poller and its waker as a coupled pair.
    pub(crate) fn new(rx: Receiver<LoopMsg>) -> io::Result<(Self, MioWaker)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok((
            Self {
                state: LoopState::new(rx),
                io: MioIo {
                    poll,
                    fds: HashMap::new(),
                    tokens: HashMap::new(),
                    next_token: WAKER_TOKEN.0 + 1,
                },
                events: Events::with_capacity(256),
            },
            MioWaker(waker),
        ))
    }
}

impl LoopBackend for MioBackend {
    fn run(&mut self) {
        loop {
            self.state.drain_msgs(&mut self.io);
            if self.state.quitting {
                break;
            }

            let timeout = self.state.poll_timeout();
            if let Err(e) = self.io.poll.poll(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                panic!("event loop poll failed: {e}");
            }

            for event in self.events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                let Some(&fd) = self.io.tokens.get(&token) else { continue };

                let mut ready = WatcherFlags::NONE;
                if event.is_readable() {
                    ready = ready | WatcherFlags::READ;
                }
                if event.is_writable() {
                    ready = ready | WatcherFlags::WRITE;
                }
                let error =
                    event.is_error() || event.is_read_closed() || event.is_write_closed();
                trace!(fd, ?ready, error, "fd ready");

                if let Some(entry) = self.io.fds.get_mut(&fd) {
                    entry.slots.deliver(ready, error);
                }
                self.io.sync(fd);
            }

            self.state.dispatch_idles();
        }
    }
}

impl IoRegistrar for MioIo {
    fn start_io(&mut self, watcher: Arc<WatcherCore>) {
        let (fd, _) = io_params(&watcher);
        if !self.fds.contains_key(&fd) {
            let token = Token(self.next_token);
            self.next_token += 1;
            self.tokens.insert(token, fd);
            self.fds.insert(fd, FdEntry {
                token,
                registered: false,
                armed: WatcherFlags::NONE,
                slots: FdSlots::default(),
            });
        }
        self.fds
            .get_mut(&fd)
            .expect("entry inserted above")
            .slots
            .push(watcher);
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

impl MioIo {
    /// Reconciles the poller registration of `fd` with the slots' desired
    /// interest: register, reregister, deregister, or drop the entry entirely.
    fn sync(&mut self, fd: RawFd) {
        let Some(entry) = self.fds.get_mut(&fd) else { return };

        if entry.slots.is_empty() {
            if entry.registered {
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            }
            let token = entry.token;
            self.tokens.remove(&token);
            self.fds.remove(&fd);
            return;
        }

        let desired = entry.slots.desired();
        if desired.is_empty() {
            // Everything on this fd is masked (callbacks in flight); drop the
            // registration so the level-triggered poller stops re-reporting it.
            if entry.registered {
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                entry.registered = false;
                entry.armed = WatcherFlags::NONE;
            }
        } else if !entry.registered {
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), entry.token, to_interest(desired))
                .expect("fd registration failed");
            entry.registered = true;
            entry.armed = desired;
        } else if entry.armed != desired {
            self.poll
                .registry()
                .reregister(&mut SourceFd(&fd), entry.token, to_interest(desired))
                .expect("fd reregistration failed");
            entry.armed = desired;
        }
    }
}

fn to_interest(flags: WatcherFlags) -> Interest {
    let read = flags.contains(WatcherFlags::READ);
    let write = flags.contains(WatcherFlags::WRITE);
    match (read, write) {
        (true, true) => Interest::READABLE.add(Interest::WRITABLE),
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => unreachable!("empty interest never reaches the poller"),
    }
}
