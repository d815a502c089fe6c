// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll kqueue servlet

//! # r3bl_joist
//!
//! Task runtime for an experimental servlet-style embedding container: a
//! single-threaded event loop (I/O and idle dispatch) coupled to a
//! multi-threaded worker pool (callback invocation), mediated by
//! reference-counted *watchers* grouped under reference-counted *tasks*.
//!
//! The embedding container accepts HTTP connections and runs JavaScript
//! handlers; this crate is the concurrency engine underneath. The TCP listener,
//! HTTP framing, JS bridge, and process entry point are separate collaborators
//! that consume the interfaces exported here.
//!
//! ## The model
//!
//! 1. Create a [`Runner`]; it spawns one loop thread (running a [`mio`] or
//!    [`polling`] backend, see [`EventLoopKind`]) and a fixed worker pool.
//! 2. Create [`Task`]s and attach watchers: [`add_immediate`] (run on a worker
//!    as soon as possible), [`add_idle`] (run while the loop has nothing better
//!    to do), [`add_io`] (fd readiness, level-triggered), [`add_subtask`] (fires
//!    when a child task completes).
//! 3. Watcher callbacks run on pool workers, **serialized per task**: at most
//!    one callback per task at any instant, across all workers. Callbacks on
//!    different tasks run in parallel.
//! 4. A task completes, exactly once, when its watcher count and completion
//!    blocks both hit zero. Parents holding subtask watchers hear about it, and
//!    the task surfaces through [`Runner::pop_completed`] after a
//!    tasks-completed notification on the loop thread.
//!
//! Producer data moves in [`Buffer`]s: build, [`lock`], then share - a locked
//! buffer is immutable and crosses threads freely. [`OutputStream`] /
//! [`OutputChain`] drain locked buffers onto one fd in a defined order, so
//! independent producer tasks can each write their part of a response without
//! interleaving.
//!
//! ## Example
//!
//! ```
//! use r3bl_joist::{Continuation, Runner, RunnerConfig, TaskValue};
//! use std::sync::mpsc;
//!
//! let runner = Runner::new(RunnerConfig::default())?;
//! let (tx, rx) = mpsc::channel();
//! let drainer = runner.clone();
//! runner.set_tasks_completed_notify(move || {
//!     while let Some(task) = drainer.pop_completed() {
//!         let _ = tx.send(task.get_result());
//!     }
//! });
//!
//! let task = runner.create_task();
//! task.add_arg("answer", 42_i64);
//! task.add_immediate(|task, _flags| {
//!     let answer = task.get_arg("answer").and_then(|v| v.as_int()).unwrap_or(0);
//!     task.set_result(answer);
//!     Continuation::Stop
//! });
//!
//! assert_eq!(rx.recv()?, Some(TaskValue::Int(42)));
//! runner.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! [`add_idle`]: Task::add_idle
//! [`add_immediate`]: Task::add_immediate
//! [`add_io`]: Task::add_io
//! [`add_subtask`]: Task::add_subtask
//! [`lock`]: Buffer::lock

// Enforce strict error handling in production code, but relax for tests.
#![cfg_attr(not(test), deny(clippy::unwrap_in_result))]

// Attach sources.
pub mod buffer;
pub mod common;
pub mod config;
pub(crate) mod event_loop;
pub mod output;
pub mod pool;
pub mod task;
pub mod task_local;

// Re-export.
pub use buffer::*;
pub use common::*;
pub use config::*;
pub use event_loop::EventLoopError;
pub use output::*;
pub use pool::*;
pub use task::*;
pub use task_local::*;
