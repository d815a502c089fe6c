// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The pointer-keyed map plus the worker-thread installation plumbing.

use std::{any::Any, cell::RefCell, rc::Rc};

use rustc_hash::FxHashMap;

/// Identity of a thread-local slot: the address of some stable object.
///
/// Callers typically key on the address of a long-lived value (a `static`, or an
/// engine singleton), which guarantees uniqueness without any registration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalKey(usize);

impl LocalKey {
    /// Keys on the address of `anchor`. The `'static` bound keeps the address
    /// stable for the life of the process.
    #[must_use]
    pub fn from_ref<T>(anchor: &'static T) -> Self {
        Self(std::ptr::from_ref(anchor) as usize)
    }
}

/// Values stored in a [`TaskLocalMap`].
///
/// [`Rc`] because the map lives and dies on a single worker thread; callers clone
/// the handle out of `get` and downcast. Dropping the last handle is the value's
/// destructor.
pub type LocalValue = Rc<dyn Any>;

/// Map of per-worker values, keyed by stable addresses.
///
/// One map exists per worker thread; task callbacks reach it through
/// [`Task::get_thread_local`] / [`Task::set_thread_local`] while they run on that
/// worker. Because task callbacks serialize, the servicing worker can change
/// between two callbacks of the same task but never during one, so callers treat
/// the state as per-(task, current-thread).
///
/// Overwriting a key drops the previous value; dropping the map (worker teardown)
/// drops every value.
///
/// [`Task::get_thread_local`]: crate::Task::get_thread_local
/// [`Task::set_thread_local`]: crate::Task::set_thread_local
#[derive(Debug, Default)]
pub struct TaskLocalMap {
    slots: FxHashMap<LocalKey, LocalValue>,
}

impl TaskLocalMap {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    #[must_use]
    pub fn get(&self, key: LocalKey) -> Option<LocalValue> {
        self.slots.get(&key).cloned()
    }

    /// Stores `value`, dropping whatever the key previously held.
    pub fn set(&mut self, key: LocalKey, value: LocalValue) {
        self.slots.insert(key, value);
    }

    /// Clears the slot, dropping the previous value if the key was occupied.
    pub fn remove(&mut self, key: LocalKey) { self.slots.remove(&key); }
}

thread_local! {
    /// The map belonging to the current worker thread. `None` outside workers.
    static WORKER_LOCALS: RefCell<Option<TaskLocalMap>> = const { RefCell::new(None) };
}

/// Installs a fresh map on the current thread. Called once per worker on startup.
pub(crate) fn install_worker_map() {
    WORKER_LOCALS.with(|cell| {
        let previous = cell.borrow_mut().replace(TaskLocalMap::new());
        debug_assert!(previous.is_none(), "worker map installed twice");
    });
}

/// Drops the current thread's map, running every stored value's destructor.
/// Called once per worker on teardown.
pub(crate) fn teardown_worker_map() {
    WORKER_LOCALS.with(|cell| {
        cell.borrow_mut().take();
    });
}

/// Runs `f` against the current worker's map.
///
/// # Panics
///
/// Panics when called from a thread that is not a pool worker; task thread-local
/// access is only meaningful inside a task callback.
pub(crate) fn with_worker_map<R>(f: impl FnOnce(&mut TaskLocalMap) -> R) -> R {
    WORKER_LOCALS.with(|cell| {
        let mut borrow = cell.borrow_mut();
        let map = borrow
            .as_mut()
            .expect("thread-local access outside a worker thread");
        f(map)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    static KEY_A: u8 = 0;
    static KEY_B: u8 = 0;
    static KEY_C: u8 = 0;

    /// Flips a flag when dropped, standing in for a user destructor.
    struct DropFlag(Rc<Cell<bool>>);

    impl Drop for DropFlag {
        fn drop(&mut self) { self.0.set(true); }
    }

    #[test]
    fn get_set_overwrite_and_teardown_run_destructors() {
        let (a, b, c) = (
            Rc::new(Cell::new(false)),
            Rc::new(Cell::new(false)),
            Rc::new(Cell::new(false)),
        );
        let (key_a, key_b, key_c) = (
            LocalKey::from_ref(&KEY_A),
            LocalKey::from_ref(&KEY_B),
            LocalKey::from_ref(&KEY_C),
        );

        let mut map = TaskLocalMap::new();
        assert!(map.get(key_a).is_none());
        assert!(map.get(key_b).is_none());
        assert!(map.get(key_c).is_none());

        map.set(key_a, Rc::new(DropFlag(a.clone())));
        map.set(key_b, Rc::new(DropFlag(b.clone())));
        map.set(key_c, Rc::new(DropFlag(c.clone())));

        assert!(map.get(key_a).is_some());
        assert!(!a.get() && !b.get() && !c.get());

        // Clearing one slot and overwriting another both run the previous
        // destructor; the third is left for map teardown.
        map.remove(key_a);
        map.set(key_b, Rc::new(42_u32));
        assert!(a.get());
        assert!(b.get());
        assert!(!c.get());

        let got = map.get(key_b).expect("key_b was just overwritten");
        let Ok(got) = got.downcast::<u32>() else { panic!("stored a u32") };
        assert_eq!(*got, 42);

        drop(map);
        assert!(c.get());
    }

    #[test]
    fn distinct_anchors_make_distinct_keys() {
        assert_ne!(LocalKey::from_ref(&KEY_A), LocalKey::from_ref(&KEY_B));
        assert_eq!(LocalKey::from_ref(&KEY_A), LocalKey::from_ref(&KEY_A));
    }

    #[test]
    fn worker_map_install_and_teardown() {
        install_worker_map();
        let key = LocalKey::from_ref(&KEY_A);
        with_worker_map(|map| map.set(key, Rc::new(5_i64)));
        let value = with_worker_map(|map| map.get(key)).expect("just set");
        let Ok(value) = value.downcast::<i64>() else { panic!("stored an i64") };
        assert_eq!(*value, 5);
        drop(value);
        teardown_worker_map();
    }

    #[test]
    #[should_panic(expected = "thread-local access outside a worker thread")]
    fn access_without_install_panics() {
        with_worker_map(|_| {});
    }
}
