// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Extension trait for [`Mutex`] that recovers from poisoning. See [`MutexExt`] for
//! details.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock helper that treats poisoning as recoverable.
///
/// A poisoned mutex only means some thread panicked while holding the guard. The
/// runtime aborts the process when a user callback panics (see the invoker), so the
/// protected state can never be observed mid-update; recovering the guard is always
/// sound here and saves every call site from unwrapping a [`PoisonError`].
pub trait MutexExt<T> {
    fn lock_unpoisoned(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_unpoisoned(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
