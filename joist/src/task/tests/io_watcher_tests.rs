// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Fd watchers: level-triggered delivery, observed ready flags, fd sharing.

use std::{os::fd::AsRawFd,
          sync::{Arc,
                 atomic::{AtomicUsize, Ordering}}};

use pretty_assertions::assert_eq;

use super::fixtures::CompletionFixture;
use crate::{common::Continuation,
            config::EventLoopKind,
            task::watcher::WatcherFlags};

fn read_watcher_is_level_triggered(kind: EventLoopKind) {
    let fixture = CompletionFixture::new(kind);
    let (read_end, write_end) = rustix::pipe::pipe().expect("pipe");
    rustix::io::ioctl_fionbio(&read_end, true).expect("nonblocking");

    let bytes_read = Arc::new(AtomicUsize::new(0));
    let fires = Arc::new(AtomicUsize::new(0));

    let task = fixture.runner.create_task();
    {
        let bytes_read = bytes_read.clone();
        let fires = fires.clone();
        let fd = read_end.as_raw_fd();
        let read_end_for_cb = read_end;
        task.add_io(fd, WatcherFlags::READ, move |_task, flags| {
            assert!(flags.contains(WatcherFlags::READ));
            fires.fetch_add(1, Ordering::SeqCst);
            // Deliberately read one byte per fire: the remaining byte must
            // re-trigger the level-triggered watcher.
            let mut byte = [0u8; 1];
            let n = rustix::io::read(&read_end_for_cb, &mut byte).unwrap_or(0);
            let total = bytes_read.fetch_add(n, Ordering::SeqCst) + n;
            if total >= 2 { Continuation::Stop } else { Continuation::Continue }
        });
    }

    rustix::io::write(&write_end, b"ab").expect("write");

    fixture.wait_for_completions(1);
    assert_eq!(bytes_read.load(Ordering::SeqCst), 2);
    assert_eq!(fires.load(Ordering::SeqCst), 2);
    fixture.runner.shutdown();
}

#[test]
fn mio_read_watcher_is_level_triggered() {
    read_watcher_is_level_triggered(EventLoopKind::Mio);
}

#[test]
fn polling_read_watcher_is_level_triggered() {
    read_watcher_is_level_triggered(EventLoopKind::Polling);
}

fn write_watcher_reports_writable(kind: EventLoopKind) {
    let fixture = CompletionFixture::new(kind);
    let (_read_end, write_end) = rustix::pipe::pipe().expect("pipe");

    let observed = Arc::new(AtomicUsize::new(0));
    let task = fixture.runner.create_task();
    {
        let observed = observed.clone();
        let fd = write_end.as_raw_fd();
        let _keep_open = write_end;
        task.add_io(fd, WatcherFlags::WRITE, move |_task, flags| {
            assert!(flags.contains(WatcherFlags::WRITE));
            observed.fetch_add(1, Ordering::SeqCst);
            Continuation::Stop
        });
    }

    fixture.wait_for_completions(1);
    assert_eq!(observed.load(Ordering::SeqCst), 1);
    fixture.runner.shutdown();
}

#[test]
fn mio_write_watcher_reports_writable() {
    write_watcher_reports_writable(EventLoopKind::Mio);
}

#[test]
fn polling_write_watcher_reports_writable() {
    write_watcher_reports_writable(EventLoopKind::Polling);
}

fn two_watchers_share_one_fd(kind: EventLoopKind) {
    let fixture = CompletionFixture::new(kind);
    let (_read_end, write_end) = rustix::pipe::pipe().expect("pipe");
    let fd = write_end.as_raw_fd();

    let fired = Arc::new(AtomicUsize::new(0));
    let task_a = fixture.runner.create_task();
    let task_b = fixture.runner.create_task();
    for task in [&task_a, &task_b] {
        let fired = fired.clone();
        task.add_io(fd, WatcherFlags::WRITE, move |_task, _flags| {
            fired.fetch_add(1, Ordering::SeqCst);
            Continuation::Stop
        });
    }

    fixture.wait_for_completions(2);
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    drop(write_end);
    fixture.runner.shutdown();
}

#[test]
fn mio_two_watchers_share_one_fd() {
    two_watchers_share_one_fd(EventLoopKind::Mio);
}

#[test]
fn polling_two_watchers_share_one_fd() {
    two_watchers_share_one_fd(EventLoopKind::Polling);
}
