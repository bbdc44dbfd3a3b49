// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Handle Table (spec.md §4.2): two independent free-list-backed slabs
//! mapping a dense index to either a bypass socket or a bypass epoll set.
//! `slab::Slab` already gives O(1) allocation/deallocation via an embedded
//! free list and keeps indices stable across growth, so it is used
//! directly rather than reimplemented (same crate the teacher depends on
//! for its own `FileTable`).

use crate::backend::Backend;
use crate::epoll::{EpollSet, Event};
use crate::fail::Fail;
use crate::socket::Socket;

use slab::Slab;
use std::time::Duration;

/// Owns every live bypass socket and bypass epoll set. A socket's index
/// never refers to two distinct sockets simultaneously: the caller must
/// drain the socket (`Socket::close`) before calling `free_socket`, exactly
/// as spec.md §4.2 requires ("a close releases the backend descriptor only
/// after all outstanding tokens ... are reaped").
pub struct HandleTable<B: Backend> {
    sockets: Slab<Socket<B>>,
    epolls: Slab<EpollSet<B>>,
}

impl<B: Backend> HandleTable<B> {
    pub fn new() -> Self {
        HandleTable {
            sockets: Slab::new(),
            epolls: Slab::new(),
        }
    }

    pub fn alloc_socket(&mut self, socket: Socket<B>) -> usize {
        self.sockets.insert(socket)
    }

    pub fn socket(&self, index: usize) -> Option<&Socket<B>> {
        self.sockets.get(index)
    }

    pub fn socket_mut(&mut self, index: usize) -> Option<&mut Socket<B>> {
        self.sockets.get_mut(index)
    }

    pub fn free_socket(&mut self, index: usize) -> Option<Socket<B>> {
        if self.sockets.contains(index) {
            Some(self.sockets.remove(index))
        } else {
            None
        }
    }

    pub fn alloc_epoll(&mut self, set: EpollSet<B>) -> usize {
        self.epolls.insert(set)
    }

    pub fn epoll(&self, index: usize) -> Option<&EpollSet<B>> {
        self.epolls.get(index)
    }

    pub fn epoll_mut(&mut self, index: usize) -> Option<&mut EpollSet<B>> {
        self.epolls.get_mut(index)
    }

    pub fn free_epoll(&mut self, index: usize) -> Option<EpollSet<B>> {
        if self.epolls.contains(index) {
            Some(self.epolls.remove(index))
        } else {
            None
        }
    }

    /// Runs the readiness engine's sweep-and-wait for the epoll set at
    /// `index` against this table's sockets. Lives here rather than on
    /// `EpollSet` directly so it can borrow the `sockets` and `epolls`
    /// slabs as the disjoint fields they are.
    pub fn epoll_wait(
        &mut self,
        index: usize,
        out: &mut Vec<Event>,
        maxevents: usize,
        timeout: Option<Duration>,
    ) -> Result<usize, Fail> {
        match self.epolls.get_mut(index) {
            Some(epoll_set) => epoll_set.wait(&mut self.sockets, out, maxevents, timeout),
            None => Err(Fail::BadFileDescriptor {}),
        }
    }
}

impl<B: Backend> Default for HandleTable<B> {
    fn default() -> Self {
        Self::new()
    }
}
