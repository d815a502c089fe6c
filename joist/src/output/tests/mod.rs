// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! End-to-end tests for the output pipeline, over real pipes.

mod stream_tests;

use std::os::fd::OwnedFd;

use crate::{buffer::Buffer,
            config::RunnerConfig,
            task::runner::Runner};

/// A runner for output tests; the pipeline drives its own fds, so no completion
/// plumbing is needed.
pub(super) fn test_runner() -> Runner {
    Runner::new(RunnerConfig::default()).expect("runner spawns")
}

/// A pipe whose write end is non-blocking, as the output pipeline requires.
pub(super) fn nonblocking_pipe() -> (OwnedFd, OwnedFd) {
    let (read_end, write_end) = rustix::pipe::pipe().expect("pipe");
    rustix::io::ioctl_fionbio(&write_end, true).expect("nonblocking");
    (read_end, write_end)
}

/// A locked UTF-8 buffer holding `text`.
pub(super) fn locked_text(text: &str) -> Buffer {
    let buffer = Buffer::new_copy_utf8(text);
    buffer.lock();
    buffer
}

/// Blocking-reads exactly `n` bytes from `fd`.
pub(super) fn read_exactly(fd: &OwnedFd, n: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(n);
    let mut chunk = [0u8; 4096];
    while out.len() < n {
        let got = rustix::io::read(fd, &mut chunk).expect("read");
        assert!(got > 0, "writer closed early after {} bytes", out.len());
        out.extend_from_slice(&chunk[..got]);
    }
    assert_eq!(out.len(), n, "read more bytes than expected");
    out
}
