// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! A FIFO of locked buffers draining onto an fd. See [`OutputStream`].

use std::{collections::VecDeque,
          fmt,
          os::fd::{BorrowedFd, RawFd},
          sync::{Arc, Mutex, MutexGuard}};

use tracing::{debug, trace};

use crate::{buffer::Buffer,
            common::{Continuation, MutexExt},
            task::{Task, Watcher, WatcherFlags}};

/// Callback fired exactly once when a stream finishes (drained after close, or
/// errored).
pub type DoneNotify = Box<dyn FnOnce(&OutputStream) + Send>;

/// Ordered, non-blocking writer of locked buffers onto one fd.
///
/// Producer side: [`write`] queues locked buffers (from any task thread),
/// [`close`] marks the end. Drain side: a write watcher on the stream's task
/// fires whenever the fd is writable and pushes queued bytes out with
/// [`Buffer::write_to_fd`]; partial writes keep the watcher armed. Bytes reach
/// the fd in `write` order.
///
/// The fd can be attached late via [`set_fd`] - producers may queue bytes before
/// the socket exists - and draining starts once both an fd and bytes (or a
/// pending close) are present. When the FIFO empties after [`close`], the stream
/// is *done*: the done-notify fires once and the watcher detaches. A write error
/// on the fd sets both the error and done states; queued bytes are discarded and
/// later writes are ignored.
///
/// Writing to a closed stream, or writing an unlocked buffer, is a caller bug
/// and panics.
///
/// [`close`]: Self::close
/// [`set_fd`]: Self::set_fd
/// [`write`]: Self::write
#[derive(Clone)]
pub struct OutputStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    task: Task,
    state: Mutex<StreamState>,
}

struct QueuedBuffer {
    buffer: Buffer,
    remaining: usize,
}

#[derive(Default)]
struct StreamState {
    fd: Option<RawFd>,
    fifo: VecDeque<QueuedBuffer>,
    closed: bool,
    error: bool,
    done: bool,
    armed: bool,
    watcher: Option<Watcher>,
    done_notify: Option<DoneNotify>,
}

impl OutputStream {
    /// Creates an idle stream whose drain callbacks run under `task`'s
    /// serialization.
    #[must_use]
    pub fn new(task: &Task) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                task: task.clone(),
                state: Mutex::new(StreamState::default()),
            }),
        }
    }

    /// Queues a locked buffer. Cheap (clones the buffer handle); the bytes drain
    /// when the fd is writable. Ignored after [`error`]; panics after [`close`].
    ///
    /// [`close`]: Self::close
    /// [`error`]: Self::error
    pub fn write(&self, locked_buffer: &Buffer) {
        assert!(locked_buffer.is_locked(), "output stream fed an unlocked buffer");
        let mut st = self.inner.state.lock_unpoisoned();
        assert!(!st.closed, "write on a closed output stream");
        if st.error {
            return;
        }
        st.fifo.push_back(QueuedBuffer {
            buffer: locked_buffer.clone(),
            remaining: locked_buffer.write_size(),
        });
        self.maybe_arm(st);
    }

    /// Marks the end of the stream. Once queued bytes drain (immediately, if
    /// there are none and an error did not already finish the stream), the
    /// stream becomes done.
    pub fn close(&self) {
        let mut st = self.inner.state.lock_unpoisoned();
        if st.closed {
            return;
        }
        st.closed = true;
        if st.fifo.is_empty() {
            if st.done {
                return;
            }
            self.finish(st);
        } else {
            // Ensure a drain is scheduled even if the fd arrived after the last
            // write.
            self.maybe_arm(st);
        }
    }

    /// Puts the stream into the error state: queued bytes are dropped, the
    /// stream is done, and subsequent writes are silently ignored.
    pub fn error(&self) {
        let mut st = self.inner.state.lock_unpoisoned();
        if st.done {
            st.error = true;
            return;
        }
        st.error = true;
        st.fifo.clear();
        self.finish(st);
    }

    /// Attaches (or replaces) the destination fd. The fd must be non-blocking;
    /// the stream never blocks the loop or a worker on it.
    pub fn set_fd(&self, fd: RawFd) {
        let mut st = self.inner.state.lock_unpoisoned();
        st.fd = Some(fd);
        self.maybe_arm(st);
    }

    /// Installs the done callback, replacing any previous one. Runs exactly once,
    /// on the worker that finished the stream (or inline if already done).
    pub fn set_done_notify(&self, notify: impl FnOnce(&OutputStream) + Send + 'static) {
        let mut st = self.inner.state.lock_unpoisoned();
        if st.done {
            drop(st);
            notify(self);
            return;
        }
        st.done_notify = Some(Box::new(notify));
    }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.inner.state.lock_unpoisoned().closed }

    #[must_use]
    pub fn got_error(&self) -> bool { self.inner.state.lock_unpoisoned().error }

    #[must_use]
    pub fn is_done(&self) -> bool { self.inner.state.lock_unpoisoned().done }

    /// Identity comparison (clones of one stream share their state).
    #[must_use]
    pub fn same_stream(&self, other: &OutputStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Arms the write watcher when there is an fd and something to drain.
    fn maybe_arm(&self, mut st: MutexGuard<'_, StreamState>) {
        if st.armed || st.done {
            return;
        }
        let Some(fd) = st.fd else { return };
        if st.fifo.is_empty() && !st.closed {
            return;
        }
        st.armed = true;
        let stream = self.clone();
        let watcher = self
            .inner
            .task
            .add_io(fd, WatcherFlags::WRITE, move |_task, _flags| stream.drive(fd));
        st.watcher = Some(watcher);
    }

    /// The write watcher callback: drains head-first until the fd stops taking
    /// bytes or the FIFO empties.
    fn drive(&self, fd: RawFd) -> Continuation {
        let mut st = self.inner.state.lock_unpoisoned();
        if st.done {
            // An error() or a racing close finished the stream while this
            // invocation was queued.
            st.armed = false;
            st.watcher = None;
            return Continuation::Stop;
        }

        loop {
            let (progressed, drained, write_err) = {
                let Some(front) = st.fifo.front_mut() else { break };
                let before = front.remaining;
                let mut write_err = None;
                if before > 0 {
                    // Safety: the embedding keeps the fd open for the life of
                    // the stream; it was handed over via set_fd.
                    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                    if let Err(e) = front.buffer.write_to_fd(borrowed, &mut front.remaining)
                    {
                        write_err = Some(e);
                    }
                }
                (front.remaining < before, front.remaining == 0, write_err)
            };
            if let Some(e) = write_err {
                debug!(fd, error = %e, "output stream write failed");
                st.error = true;
                st.fifo.clear();
                return self.finish(st);
            }
            if drained {
                st.fifo.pop_front();
                trace!(fd, "output buffer drained");
                continue;
            }
            if !progressed {
                // EAGAIN: stay armed and wait for the next writable edge.
                return Continuation::Continue;
            }
        }

        // FIFO drained.
        st.armed = false;
        st.watcher = None;
        if st.closed {
            return self.finish(st);
        }
        Continuation::Stop
    }

    /// Transitions to done exactly once: clears the watcher, fires the
    /// done-notify outside the state lock, detaches the (possibly current)
    /// watcher.
    fn finish(&self, mut st: MutexGuard<'_, StreamState>) -> Continuation {
        debug_assert!(!st.done);
        st.done = true;
        st.armed = false;
        let watcher = st.watcher.take();
        let notify = st.done_notify.take();
        drop(st);

        if let Some(watcher) = watcher {
            watcher.remove();
        }
        if let Some(notify) = notify {
            notify(self);
        }
        Continuation::Stop
    }
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock_unpoisoned();
        f.debug_struct("OutputStream")
            .field("fd", &st.fd)
            .field("queued", &st.fifo.len())
            .field("closed", &st.closed)
            .field("error", &st.error)
            .field("done", &st.done)
            .finish()
    }
}
