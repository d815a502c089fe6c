// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Single-stream behavior: ordering, partial writes, errors, done notification.

use std::{os::fd::AsRawFd,
          sync::mpsc,
          time::Duration};

use pretty_assertions::assert_eq;

use super::{locked_text, nonblocking_pipe, read_exactly, test_runner};
use crate::{buffer::{Buffer, BufferEncoding, HeapAllocator},
            output::output_stream::OutputStream};

const WAIT: Duration = Duration::from_secs(30);

#[test]
fn stream_writes_buffers_in_order() {
    let runner = test_runner();
    let task = runner.create_task();
    let (read_end, write_end) = nonblocking_pipe();

    let stream = OutputStream::new(&task);
    let (done_tx, done_rx) = mpsc::channel();
    stream.set_done_notify(move |s| {
        let _ = done_tx.send(s.got_error());
    });

    // Bytes are queued before the fd exists; draining starts at set_fd.
    stream.write(&locked_text("hello "));
    stream.write(&locked_text("world"));
    stream.set_fd(write_end.as_raw_fd());
    stream.close();

    let bytes = read_exactly(&read_end, 11);
    assert_eq!(bytes, b"hello world");

    let errored = done_rx.recv_timeout(WAIT).expect("done notify fires");
    assert!(!errored);
    assert!(stream.is_done());
    assert!(stream.is_closed());
    assert!(!stream.got_error());

    runner.shutdown();
}

#[test]
fn stream_survives_partial_writes() {
    let runner = test_runner();
    let task = runner.create_task();
    let (read_end, write_end) = nonblocking_pipe();

    // Far more than any default pipe capacity, so the drain must park on
    // EAGAIN and resume when the reader makes room.
    let payload = Buffer::new(BufferEncoding::Binary, HeapAllocator);
    let chunk = [b'x'; 4096];
    for _ in 0..192 {
        payload.append_ascii(&chunk);
    }
    payload.lock();
    let total = payload.write_size();

    let stream = OutputStream::new(&task);
    let (done_tx, done_rx) = mpsc::channel();
    stream.set_done_notify(move |s| {
        let _ = done_tx.send(s.got_error());
    });
    stream.set_fd(write_end.as_raw_fd());
    stream.write(&payload);
    stream.close();

    let bytes = read_exactly(&read_end, total);
    assert!(bytes.iter().all(|b| *b == b'x'));

    let errored = done_rx.recv_timeout(WAIT).expect("done notify fires");
    assert!(!errored);
    runner.shutdown();
}

#[test]
fn write_error_puts_the_stream_into_error_state() {
    let runner = test_runner();
    let task = runner.create_task();

    // Read-only fd: poll reports it writable (character device), write(2)
    // fails with EBADF.
    let bad_fd = rustix::fs::open(
        "/dev/null",
        rustix::fs::OFlags::RDONLY,
        rustix::fs::Mode::empty(),
    )
    .expect("open /dev/null");

    let stream = OutputStream::new(&task);
    let (done_tx, done_rx) = mpsc::channel();
    stream.set_done_notify(move |s| {
        let _ = done_tx.send(s.got_error());
    });
    stream.set_fd(bad_fd.as_raw_fd());
    stream.write(&locked_text("doomed"));

    let errored = done_rx.recv_timeout(WAIT).expect("done notify fires");
    assert!(errored);
    assert!(stream.got_error());
    assert!(stream.is_done());

    // Writes after an error are discarded, not an error in themselves.
    stream.write(&locked_text("ignored"));

    runner.shutdown();
}

#[test]
fn close_with_nothing_queued_is_done_immediately() {
    let runner = test_runner();
    let task = runner.create_task();

    let stream = OutputStream::new(&task);
    let (done_tx, done_rx) = mpsc::channel();
    stream.set_done_notify(move |_s| {
        let _ = done_tx.send(());
    });
    stream.close();

    done_rx.recv_timeout(WAIT).expect("done notify fires");
    assert!(stream.is_done());
    assert!(!stream.got_error());
    runner.shutdown();
}

#[test]
fn done_notify_installed_after_done_fires_inline() {
    let runner = test_runner();
    let task = runner.create_task();

    let stream = OutputStream::new(&task);
    stream.close();
    assert!(stream.is_done());

    let (done_tx, done_rx) = mpsc::channel();
    stream.set_done_notify(move |_s| {
        let _ = done_tx.send(());
    });
    done_rx.recv_timeout(WAIT).expect("late notify still fires");
    runner.shutdown();
}

#[test]
#[should_panic(expected = "write on a closed output stream")]
fn writing_after_close_panics() {
    let runner = test_runner();
    let task = runner.create_task();
    let stream = OutputStream::new(&task);
    stream.close();
    let buffer = locked_text("too late");
    stream.write(&buffer);
    runner.shutdown();
}

#[test]
#[should_panic(expected = "output stream fed an unlocked buffer")]
fn writing_an_unlocked_buffer_panics() {
    let runner = test_runner();
    let task = runner.create_task();
    let stream = OutputStream::new(&task);
    let buffer = Buffer::new_copy_utf8("not locked");
    stream.write(&buffer);
    runner.shutdown();
}
