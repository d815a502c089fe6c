// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! A subtask tree of depth 5 with branching 10: 111,111 tasks, each reporting
//! its descendant count up to its parent.

use std::sync::{Arc,
                atomic::{AtomicI64, AtomicUsize, Ordering}};

use pretty_assertions::assert_eq;

use super::fixtures::{CompletionFixture, DropCounter};
use crate::{common::Continuation,
            config::EventLoopKind,
            task::{Task, value::TaskValue}};

const MAX_DEPTH: i64 = 5;
const BRANCHES_PER_NODE: usize = 10;
// 1 + 10 + 100 + 1_000 + 10_000 + 100_000.
const NUM_TASKS: usize = 111_111;

/// Shared among one parent's subtask watchers.
struct SubtasksShared {
    total_descendants: AtomicI64,
    subtasks_completed: AtomicUsize,
}

struct TreeCounters {
    started: AtomicUsize,
    dnotify: Arc<AtomicUsize>,
}

/// The per-task work: at max depth report zero descendants, otherwise spawn
/// `BRANCHES_PER_NODE` children and sum their reports.
fn on_task_invoked(task: &Task, counters: &Arc<TreeCounters>) -> Continuation {
    let depth = task
        .get_arg("depth")
        .and_then(|v| v.as_int())
        .expect("every tree task carries a depth arg");

    if depth >= MAX_DEPTH {
        task.set_result(0_i64);
        return Continuation::Stop;
    }

    let shared = Arc::new(SubtasksShared {
        total_descendants: AtomicI64::new(0),
        subtasks_completed: AtomicUsize::new(0),
    });

    for _ in 0..BRANCHES_PER_NODE {
        let subtask = task.create_task();
        counters.started.fetch_add(1, Ordering::SeqCst);
        subtask.add_arg("depth", depth + 1);

        // Notify on subtask completion. These callbacks run on the parent and
        // therefore serialize with each other.
        {
            let shared = shared.clone();
            let subtask_for_closure = subtask.clone();
            task.add_subtask(&subtask, move |parent, _flags| {
                let subtask = &subtask_for_closure;
                let descendants = subtask
                    .get_result()
                    .and_then(|v| v.as_int())
                    .expect("completed subtask reported a result")
                    + 1;
                shared.total_descendants.fetch_add(descendants, Ordering::SeqCst);

                let parent_depth =
                    parent.get_arg("depth").and_then(|v| v.as_int()).expect("depth");
                let child_depth =
                    subtask.get_arg("depth").and_then(|v| v.as_int()).expect("depth");
                assert_eq!(child_depth, parent_depth + 1);

                let done = shared.subtasks_completed.fetch_add(1, Ordering::SeqCst) + 1;
                if done == BRANCHES_PER_NODE {
                    parent.set_result(shared.total_descendants.load(Ordering::SeqCst));
                }
                Continuation::Stop
            });
        }

        // The subtask's own work: recurse.
        let counters_for_child = counters.clone();
        let guard = DropCounter(counters.dnotify.clone());
        subtask.add_immediate(move |child, _flags| {
            let _ = &guard;
            on_task_invoked(child, &counters_for_child)
        });
    }

    Continuation::Stop
}

#[test]
fn subtask_tree_counts_all_descendants() {
    let fixture = CompletionFixture::new(EventLoopKind::Mio);
    let counters = Arc::new(TreeCounters {
        started: AtomicUsize::new(0),
        dnotify: Arc::new(AtomicUsize::new(0)),
    });

    let root = fixture.runner.create_task();
    counters.started.fetch_add(1, Ordering::SeqCst);
    root.add_arg("depth", 0_i64);
    {
        let counters_for_root = counters.clone();
        let guard = DropCounter(counters.dnotify.clone());
        root.add_immediate(move |task, _flags| {
            let _ = &guard;
            on_task_invoked(task, &counters_for_root)
        });
    }

    fixture.wait_for_completions(NUM_TASKS);

    assert_eq!(counters.started.load(Ordering::SeqCst), NUM_TASKS);
    assert_eq!(fixture.completed_count.load(Ordering::SeqCst), NUM_TASKS);
    assert_eq!(counters.dnotify.load(Ordering::SeqCst), NUM_TASKS);
    assert!(root.is_completed());
    assert_eq!(
        root.get_result(),
        Some(TaskValue::Int(i64::try_from(NUM_TASKS).unwrap() - 1))
    );

    fixture.runner.shutdown();
}
