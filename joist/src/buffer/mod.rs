// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Growable byte container used to hand producer data across threads.
//!
//! A [`Buffer`] starts out mutable on one thread, is filled with
//! [`append_ascii`], then [`lock`]ed. Locking publishes the contents: a locked
//! buffer is immutable (except for [`steal`]ing the allocation out) and safe to
//! clone across threads, which is how response bytes travel from producer tasks to
//! the output pipeline. Storage is managed through a pluggable [`BufferAllocator`]
//! so an embedding (for example a JS engine with its own heap) can own the
//! allocation that [`steal_utf16`] later transfers to it.
//!
//! [`append_ascii`]: Buffer::append_ascii
//! [`lock`]: Buffer::lock
//! [`steal`]: Buffer::steal_utf8
//! [`steal_utf16`]: Buffer::steal_utf16

// Attach sources.
pub mod allocator;
pub mod byte_buffer;

// Re-export.
pub use allocator::*;
pub use byte_buffer::*;
