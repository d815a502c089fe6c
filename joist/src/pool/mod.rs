// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Fixed-size worker pool draining an unbounded MPMC queue. See [`WorkerPool`]
//! for details.

// Attach sources.
pub mod worker_pool;

// Re-export.
pub use worker_pool::*;
