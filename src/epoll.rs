// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Epoll item, epoll set, and the Readiness Engine's sweep-and-wait
//! (spec.md §4.5). Ready-list and sorted-container membership are
//! non-intrusive here -- an `IndexMap`/`IndexSet` pair gives the same O(1)
//! link/unlink property an intrusive list would, without `unsafe` (spec.md
//! §9 "Intrusive containers").

use crate::backend::{Backend, QToken};
use crate::config::Config;
use crate::fail::Fail;
use crate::socket::Socket;

use indexmap::{IndexMap, IndexSet};
use slab::Slab;

use std::os::unix::io::RawFd;
use std::time::Duration;

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;

/// One reported readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub data: u64,
    pub events: u32,
}

/// Per (epoll-set, watched bypass-socket) pair (spec.md §3 "Epoll item").
/// Keyed by the socket's handle-table index, which stands in for the
/// backend queue descriptor: each socket owns exactly one `qd`, so the two
/// keyings are equivalent here.
struct Item {
    interests: u32,
    user_data: u64,
}

/// Owns the host kernel epoll descriptor used for non-bypass FDs added to
/// this set, the sorted container of bypass epoll items, the ready-list,
/// and a reusable token buffer (spec.md §3 "Epoll set").
pub struct EpollSet<B: Backend> {
    backend: B,
    kernel_epfd: RawFd,
    items: IndexMap<usize, Item>,
    ready: IndexSet<usize>,
    token_buf: Vec<QToken>,
    /// Sizes the kernel-epoll event buffer used in the sweep's step 4
    /// (spec.md §4.5 step 4; spec.md §4.7 `Config::kernel_event_capacity`).
    kernel_event_capacity: usize,
}

impl<B: Backend> EpollSet<B> {
    pub fn new(backend: B, config: &Config) -> Result<Self, Fail> {
        let kernel_epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if kernel_epfd < 0 {
            return Err(Fail::from(std::io::Error::last_os_error()));
        }
        Ok(EpollSet {
            backend,
            kernel_epfd,
            items: IndexMap::new(),
            ready: IndexSet::new(),
            token_buf: Vec::new(),
            kernel_event_capacity: config.kernel_event_capacity,
        })
    }

    /// `epoll_ctl(ADD, ...)` on a bypass socket: add it to the internal
    /// sorted container.
    pub fn add_socket(&mut self, socket_index: usize, interests: u32, user_data: u64) -> Result<(), Fail> {
        if self.items.contains_key(&socket_index) {
            return Err(Fail::Invalid {
                details: "socket already registered in this epoll set",
            });
        }
        self.items.insert(
            socket_index,
            Item {
                interests,
                user_data,
            },
        );
        Ok(())
    }

    pub fn modify_socket(&mut self, socket_index: usize, interests: u32, user_data: u64) -> Result<(), Fail> {
        match self.items.get_mut(&socket_index) {
            Some(item) => {
                item.interests = interests;
                item.user_data = user_data;
                Ok(())
            }
            None => Err(Fail::Invalid {
                details: "socket not registered in this epoll set",
            }),
        }
    }

    pub fn delete_socket(&mut self, socket_index: usize) -> Result<(), Fail> {
        match self.items.shift_remove(&socket_index) {
            Some(_) => {
                self.ready.shift_remove(&socket_index);
                Ok(())
            }
            None => Err(Fail::Invalid {
                details: "socket not registered in this epoll set",
            }),
        }
    }

    /// `epoll_ctl` on a kernel FD: forwarded to the owned kernel epoll
    /// descriptor unchanged.
    pub fn add_kernel_fd(&self, fd: RawFd, interests: u32, user_data: u64) -> Result<(), Fail> {
        let mut event = libc::epoll_event {
            events: interests,
            u64: user_data,
        };
        let rc = unsafe { libc::epoll_ctl(self.kernel_epfd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc < 0 {
            return Err(Fail::from(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn modify_kernel_fd(&self, fd: RawFd, interests: u32, user_data: u64) -> Result<(), Fail> {
        let mut event = libc::epoll_event {
            events: interests,
            u64: user_data,
        };
        let rc = unsafe { libc::epoll_ctl(self.kernel_epfd, libc::EPOLL_CTL_MOD, fd, &mut event) };
        if rc < 0 {
            return Err(Fail::from(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn delete_kernel_fd(&self, fd: RawFd) -> Result<(), Fail> {
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        let rc = unsafe { libc::epoll_ctl(self.kernel_epfd, libc::EPOLL_CTL_DEL, fd, &mut event) };
        if rc < 0 {
            return Err(Fail::from(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// The sweep-and-wait routine (spec.md §4.5). `out` receives up to
    /// `maxevents` events; returns the number emitted.
    pub fn wait(
        &mut self,
        sockets: &mut Slab<Socket<B>>,
        out: &mut Vec<Event>,
        maxevents: usize,
        timeout: Option<Duration>,
    ) -> Result<usize, Fail> {
        out.clear();

        // ---- 1. Sweep -----------------------------------------------------
        self.token_buf.clear();
        let mut token_owners: Vec<usize> = Vec::new();
        let mut dead: Vec<usize> = Vec::new();

        for (&socket_index, item) in self.items.iter() {
            let socket = match sockets.get_mut(socket_index) {
                Some(s) => s,
                None => {
                    dead.push(socket_index);
                    continue;
                }
            };
            if !socket.is_open() {
                dead.push(socket_index);
                continue;
            }

            let mut available = 0u32;
            if item.interests & EPOLLIN != 0 && (socket.can_read() || socket.can_accept()) {
                available |= EPOLLIN;
            }
            if item.interests & EPOLLOUT != 0 && socket.can_write() {
                available |= EPOLLOUT;
            }

            if available != 0 {
                self.ready.insert(socket_index);
            }

            // EPOLLOUT's "missing" case is simply waiting for an existing
            // in-flight push; only EPOLLIN/accept readiness needs a fresh
            // submission (spec.md §4.5 step 1).
            if item.interests & EPOLLIN != 0 && available & EPOLLIN == 0 {
                socket.ensure_recv_submitted()?;
            }

            for token in socket.outstanding_tokens() {
                self.token_buf.push(token);
                token_owners.push(socket_index);
            }
        }

        // ---- 2. Evict -------------------------------------------------
        for socket_index in dead {
            self.items.shift_remove(&socket_index);
            self.ready.shift_remove(&socket_index);
        }

        // ---- 3. Wait ----------------------------------------------------
        let effective_timeout = if !self.ready.is_empty() {
            Some(Duration::from_secs(0))
        } else {
            timeout
        };

        if !self.token_buf.is_empty() {
            if let Some((i, completion)) = self.backend.wait_any(&self.token_buf, effective_timeout) {
                let socket_index = token_owners[i];
                if let Some(socket) = sockets.get_mut(socket_index) {
                    socket.apply_completion(completion);
                    if self.items.contains_key(&socket_index) {
                        self.ready.insert(socket_index);
                    }
                }
            }
        }

        // ---- 4. Kernel epoll drain ---------------------------------------
        // Derived from `effective_timeout`, not the caller's raw `timeout`:
        // a non-empty ready-list must coerce this to zero too, or an
        // already-deliverable bypass event would starve behind a blocking
        // `epoll_wait` (spec.md §5, §8 "wait with ready-list non-empty
        // coerces timeout to 0 even if the caller asked for infinite").
        let kernel_timeout_ms: libc::c_int = if self.token_buf.is_empty() {
            match effective_timeout {
                None => -1,
                Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            }
        } else {
            0
        };
        let kernel_buf_len = self.kernel_event_capacity.min(maxevents).max(1);
        let mut kernel_events: Vec<libc::epoll_event> =
            vec![libc::epoll_event { events: 0, u64: 0 }; kernel_buf_len];
        let n = unsafe {
            libc::epoll_wait(
                self.kernel_epfd,
                kernel_events.as_mut_ptr(),
                kernel_buf_len as libc::c_int,
                kernel_timeout_ms,
            )
        };
        let n = if n < 0 { 0 } else { n as usize };
        for e in kernel_events.into_iter().take(n) {
            out.push(Event {
                data: e.u64,
                events: e.events,
            });
            if out.len() >= maxevents {
                return Ok(out.len());
            }
        }

        // ---- 5. Drain ready-list -------------------------------------
        let budget = maxevents.saturating_sub(out.len());
        let emit: Vec<usize> = self.ready.iter().take(budget).copied().collect();
        for socket_index in emit {
            self.ready.shift_remove(&socket_index);
            let item = match self.items.get(&socket_index) {
                Some(item) => item,
                None => continue,
            };
            let socket = match sockets.get(socket_index) {
                Some(s) => s,
                None => continue,
            };
            let mut available = 0u32;
            if item.interests & EPOLLIN != 0 && (socket.can_read() || socket.can_accept()) {
                available |= EPOLLIN;
            }
            if item.interests & EPOLLOUT != 0 && socket.can_write() {
                available |= EPOLLOUT;
            }
            if available == 0 {
                continue;
            }
            out.push(Event {
                data: item.user_data,
                events: available,
            });
        }

        Ok(out.len())
    }
}

impl<B: Backend> Drop for EpollSet<B> {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kernel_epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::LoopbackBackend;
    use crate::backend::Backend;

    #[test]
    fn new_epoll_set_has_empty_ready_list() {
        let backend = LoopbackBackend::init(&[]).unwrap();
        let set = EpollSet::new(backend, &Config::default()).unwrap();
        assert!(set.ready.is_empty());
        assert!(set.items.is_empty());
    }
}
