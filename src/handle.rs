// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Descriptor Namespace (spec.md §3, §4.1): partitions the 32-bit
//! descriptor space into three disjoint ranges so that a handle can be
//! routed without any caller-supplied annotation.

/// A public descriptor handed back to callers of the Public API Shim.
pub type Descriptor = i32;

/// First bypass-epoll handle. Chosen to exceed any realistic kernel FD.
pub const EPOLL_BASE: Descriptor = 1 << 16;

/// First bypass-socket handle.
pub const SOCKET_BASE: Descriptor = (1 << 16) + (1 << 10);

/// Which domain a [Descriptor] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// `[0, EPOLL_BASE)` -- untranslated kernel file descriptor.
    Kernel,
    /// `[EPOLL_BASE, SOCKET_BASE)` -- a bypass epoll set.
    Epoll,
    /// `[SOCKET_BASE, ..)` -- a bypass socket.
    Socket,
}

/// Classifies `fd` into its domain. A single comparison each way, per
/// spec.md §3 ("range membership is a single comparison").
pub fn classify(fd: Descriptor) -> Domain {
    if fd < EPOLL_BASE {
        Domain::Kernel
    } else if fd < SOCKET_BASE {
        Domain::Epoll
    } else {
        Domain::Socket
    }
}

/// Converts a bypass-epoll handle to its slab index. Caller must have
/// already classified `fd` as [Domain::Epoll].
pub fn epoll_index(fd: Descriptor) -> usize {
    debug_assert_eq!(classify(fd), Domain::Epoll);
    (fd - EPOLL_BASE) as usize
}

/// Converts a bypass-socket handle to its slab index. Caller must have
/// already classified `fd` as [Domain::Socket].
pub fn socket_index(fd: Descriptor) -> usize {
    debug_assert_eq!(classify(fd), Domain::Socket);
    (fd - SOCKET_BASE) as usize
}

/// Inverse of [epoll_index].
pub fn epoll_handle(index: usize) -> Descriptor {
    EPOLL_BASE + index as Descriptor
}

/// Inverse of [socket_index].
pub fn socket_handle(index: usize) -> Descriptor {
    SOCKET_BASE + index as Descriptor
}
