// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Several output streams, one fd, wire order preserved. See [`OutputChain`].

use std::{collections::VecDeque,
          fmt,
          os::fd::RawFd,
          sync::{Arc, Mutex}};

use tracing::trace;

use crate::{common::MutexExt,
            task::Task};

use super::output_stream::OutputStream;

/// Callback fired the first time the chain transitions to empty.
pub type EmptyNotify = Box<dyn FnOnce(&OutputChain) + Send>;

/// An ordered list of [`OutputStream`]s sharing one fd.
///
/// Only the head stream drives the fd; the others queue bytes in peace. When the
/// head finishes, it is popped and the next stream takes over the same fd. This
/// is how a response can queue header bytes and body bytes as two independent
/// streams, produced by different tasks, and still hit the socket in order.
///
/// [`got_error`] is the logical OR of the members' error states. The empty
/// notify fires the first time the last stream leaves the chain.
///
/// [`got_error`]: Self::got_error
#[derive(Clone)]
pub struct OutputChain {
    inner: Arc<ChainInner>,
}

struct ChainInner {
    task: Task,
    state: Mutex<ChainState>,
}

#[derive(Default)]
struct ChainState {
    fd: Option<RawFd>,
    streams: VecDeque<OutputStream>,
    got_error: bool,
    empty_notified: bool,
    empty_notify: Option<EmptyNotify>,
}

impl OutputChain {
    /// Creates an empty chain. `task` anchors bookkeeping; each member stream
    /// drains under its own task.
    #[must_use]
    pub fn new(task: &Task) -> Self {
        Self {
            inner: Arc::new(ChainInner {
                task: task.clone(),
                state: Mutex::new(ChainState::default()),
            }),
        }
    }

    /// The task this chain was created on.
    #[must_use]
    pub fn task(&self) -> &Task { &self.inner.task }

    /// Attaches the shared fd. The head stream (now and after every handoff)
    /// gets it; the fd must be non-blocking.
    pub fn set_fd(&self, fd: RawFd) {
        let head = {
            let mut st = self.inner.state.lock_unpoisoned();
            st.fd = Some(fd);
            st.streams.front().cloned()
        };
        if let Some(head) = head {
            head.set_fd(fd);
        }
    }

    /// Appends a stream. The chain takes over the stream's done notification to
    /// drive the handoff; if the stream becomes head and the fd is known, it
    /// starts draining.
    pub fn add_stream(&self, stream: &OutputStream) {
        let arm = {
            let mut st = self.inner.state.lock_unpoisoned();
            st.streams.push_back(stream.clone());
            if st.streams.len() == 1 { st.fd } else { None }
        };

        let chain = self.clone();
        let observed = stream.clone();
        stream.set_done_notify(move |_| chain.on_stream_done(&observed));

        if let Some(fd) = arm {
            stream.set_fd(fd);
        }
    }

    /// True when no streams remain.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.inner.state.lock_unpoisoned().streams.is_empty() }

    /// Whether any member stream errored so far.
    #[must_use]
    pub fn got_error(&self) -> bool { self.inner.state.lock_unpoisoned().got_error }

    /// Installs the fire-once empty callback. Fires inline if the chain already
    /// emptied.
    pub fn set_empty_notify(&self, notify: impl FnOnce(&OutputChain) + Send + 'static) {
        let mut st = self.inner.state.lock_unpoisoned();
        if st.empty_notified {
            drop(st);
            notify(self);
            return;
        }
        st.empty_notify = Some(Box::new(notify));
    }

    /// Handoff: pops the finished head (plus any queued streams that finished
    /// while waiting their turn), arms the next live stream, fires the empty
    /// notify when the last one leaves.
    fn on_stream_done(&self, done_stream: &OutputStream) {
        enum Next {
            Arm(OutputStream, RawFd),
            NowEmpty(Option<EmptyNotify>),
            Nothing,
        }

        let next = {
            let mut st = self.inner.state.lock_unpoisoned();
            if done_stream.got_error() {
                st.got_error = true;
            }
            // Only a finished head triggers a handoff; a stream that finishes
            // while queued deeper is popped by the cascade below when its turn
            // comes.
            let is_head = st
                .streams
                .front()
                .is_some_and(|head| head.same_stream(done_stream));
            if !is_head {
                Next::Nothing
            } else {
                st.streams.pop_front();
                trace!(remaining = st.streams.len(), "output chain head finished");
                loop {
                    match st.streams.front().cloned() {
                        // Finished while waiting (closed empty, or errored):
                        // skip straight past it.
                        Some(head) if head.is_done() => {
                            if head.got_error() {
                                st.got_error = true;
                            }
                            st.streams.pop_front();
                        }
                        Some(head) => {
                            break match st.fd {
                                Some(fd) => Next::Arm(head, fd),
                                None => Next::Nothing,
                            };
                        }
                        None => {
                            st.empty_notified = true;
                            break Next::NowEmpty(st.empty_notify.take());
                        }
                    }
                }
            }
        };

        match next {
            Next::Arm(next_head, fd) => next_head.set_fd(fd),
            Next::NowEmpty(notify) => {
                if let Some(notify) = notify {
                    notify(self);
                }
            }
            Next::Nothing => {}
        }
    }
}

impl fmt::Debug for OutputChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock_unpoisoned();
        f.debug_struct("OutputChain")
            .field("fd", &st.fd)
            .field("streams", &st.streams.len())
            .field("got_error", &st.got_error)
            .finish()
    }
}
