// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll kqueue

//! Runner construction knobs: which event loop backend to use and how many worker
//! threads to spawn. See [`RunnerConfig`] for details.

use strum_macros::{Display, EnumString};

/// Number of worker threads a runner spawns unless configured otherwise.
///
/// Three or four threads measured best on the 2-core machines this was tuned on,
/// with two or five clearly worse. Hosts on very different core counts can override
/// via [`RunnerConfig::worker_count`].
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Selects the event loop backend a [`Runner`] drives on its loop thread.
///
/// Both backends are behaviorally equivalent; they differ only in the OS readiness
/// mechanism. The kebab-case string forms (`"mio"`, `"polling"`) parse via
/// [`FromStr`], so hosts can accept the selector from CLI flags or environment
/// text.
///
/// [`FromStr`]: std::str::FromStr
/// [`Runner`]: crate::Runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum EventLoopKind {
    /// [`mio`] poller (epoll on Linux, kqueue on macOS). The default.
    #[default]
    Mio,
    /// [`polling`] poller with its built-in notifier.
    Polling,
}

/// Configuration consumed once by [`Runner::new`].
///
/// [`Runner::new`]: crate::Runner::new
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Which backend the loop thread runs.
    pub event_loop: EventLoopKind,
    /// How many worker threads invoke task callbacks.
    pub worker_count: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            event_loop: EventLoopKind::default(),
            worker_count: DEFAULT_WORKER_COUNT,
        }
    }
}
