// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Configuration (spec.md §4.7): constructed once and handed to
//! [crate::api::Shim::new], never read from a hidden global (spec.md §9
//! "Global state").

/// Tunables for a [crate::api::Shim] instance. `EPOLL_BASE`/`SOCKET_BASE`
/// (spec.md §3) are fixed implementation constants, not configuration --
/// see [crate::handle] -- since they partition a single shared descriptor
/// namespace that every `Shim` in a process must agree on.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Initial capacity of the buffer used to harvest kernel epoll events
    /// on each `epoll_wait` (spec.md §4.5 step 4).
    pub kernel_event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            kernel_event_capacity: 32,
        }
    }
}
