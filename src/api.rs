// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Public API Shim (spec.md §4.6): thin wrappers replicating POSIX socket +
//! epoll signatures that dispatch through the descriptor-namespace router
//! (spec.md §4.1).

use crate::backend::{Backend, Qd};
use crate::config::Config;
use crate::epoll::{Event, EpollSet, EPOLLIN, EPOLLOUT};
use crate::fail::Fail;
use crate::file_table::HandleTable;
use crate::handle::{self, Descriptor, Domain};
use crate::logging;
use crate::socket::Socket;

use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Top-level entry point. Owns the backend handle and the handle table;
/// analogous to the teacher's `LibOS<RT>`.
pub struct Shim<B: Backend> {
    backend: B,
    handles: HandleTable<B>,
    config: Config,
    /// Kept alive for the lifetime of the shim: dropping it shuts
    /// `flexi_logger` down (spec.md §4.8).
    _logger_handle: Option<flexi_logger::LoggerHandle>,
}

impl<B: Backend> Shim<B> {
    /// Calls [Backend::init] and wraps the result. Must be called exactly
    /// once per process before any bypass operation (spec.md §6 "A small
    /// init entry point must be called once").
    pub fn new(args: &[String], config: Config) -> Result<Self, Fail> {
        let logger_handle = logging::init_tracing();
        let backend = B::init(args)?;
        Ok(Shim {
            backend,
            handles: HandleTable::new(),
            config,
            _logger_handle: logger_handle,
        })
    }

    /// Wraps an already-initialised backend instead of calling
    /// [Backend::init]. Exists so a caller that needs to keep a handle onto
    /// the same backend instance alongside the shim (the test suite's
    /// `LoopbackBackend`, which exposes `simulate_connect`/`deliver` for
    /// driving the simulated peer side) can share a single instance rather
    /// than create a second, disconnected one.
    pub fn from_backend(backend: B, config: Config) -> Self {
        Shim {
            backend,
            handles: HandleTable::new(),
            config,
            _logger_handle: None,
        }
    }

    /// The backend queue descriptor underlying a bypass-socket handle, if
    /// `fd` is one. Used by tests that need to drive a mock backend
    /// directly (e.g. `LoopbackBackend::simulate_connect`).
    pub fn socket_qd(&self, fd: Descriptor) -> Option<Qd> {
        match handle::classify(fd) {
            Domain::Socket => self.handles.socket(handle::socket_index(fd)).map(Socket::qd),
            _ => None,
        }
    }

    // ---- Socket family ----------------------------------------------------

    pub fn socket(
        &mut self,
        domain: libc::c_int,
        ty: libc::c_int,
        protocol: libc::c_int,
    ) -> Result<Descriptor, Fail> {
        trace!("socket(): domain={:?} ty={:?} protocol={:?}", domain, ty, protocol);
        if domain == libc::AF_INET && ty == libc::SOCK_STREAM {
            let qd = self.backend.socket(domain, ty, protocol)?;
            let socket = Socket::new(self.backend.clone(), qd);
            let index = self.handles.alloc_socket(socket);
            return Ok(handle::socket_handle(index));
        }
        // Non-bypass-eligible combination: fall through to the kernel.
        let fd = unsafe { libc::socket(domain, ty, protocol) };
        if fd < 0 {
            return Err(Fail::from(std::io::Error::last_os_error()));
        }
        Ok(fd as Descriptor)
    }

    pub fn bind(&mut self, fd: Descriptor, addr: SocketAddrV4) -> Result<(), Fail> {
        trace!("bind(): fd={:?} addr={:?}", fd, addr);
        match handle::classify(fd) {
            Domain::Socket => {
                let index = handle::socket_index(fd);
                let socket = self.get_socket_mut(index)?;
                self.backend.bind(socket.qd(), addr)?;
                socket.set_local_addr(addr);
                Ok(())
            }
            Domain::Kernel => kernel_bind(fd as RawFd, addr),
            Domain::Epoll => Err(Fail::BadFileDescriptor {}),
        }
    }

    pub fn listen(&mut self, fd: Descriptor, backlog: usize) -> Result<(), Fail> {
        trace!("listen(): fd={:?} backlog={:?}", fd, backlog);
        if backlog == 0 {
            return Err(Fail::Invalid {
                details: "backlog length",
            });
        }
        match handle::classify(fd) {
            Domain::Socket => {
                let index = handle::socket_index(fd);
                let socket = self.get_socket_mut(index)?;
                self.backend.listen(socket.qd(), backlog)?;
                socket.enter_accepting_mode();
                Ok(())
            }
            Domain::Kernel => {
                let rc = unsafe { libc::listen(fd as RawFd, backlog as libc::c_int) };
                if rc < 0 {
                    Err(Fail::from(std::io::Error::last_os_error()))
                } else {
                    Ok(())
                }
            }
            Domain::Epoll => Err(Fail::BadFileDescriptor {}),
        }
    }

    /// Bypass `connect()` is a Non-goal (spec.md §1, §9 open question):
    /// surfaces `Fail::NotSupported` instead of guessing an async
    /// submit/complete shape the backend contract doesn't define.
    pub fn connect(&mut self, fd: Descriptor, addr: SocketAddrV4) -> Result<(), Fail> {
        match handle::classify(fd) {
            Domain::Socket => Err(Fail::NotSupported {
                details: "connect on a bypass socket",
            }),
            Domain::Kernel => kernel_connect(fd as RawFd, addr),
            Domain::Epoll => Err(Fail::BadFileDescriptor {}),
        }
    }

    pub fn accept(&mut self, fd: Descriptor) -> Result<Descriptor, Fail> {
        trace!("accept(): fd={:?}", fd);
        match handle::classify(fd) {
            Domain::Socket => {
                let index = handle::socket_index(fd);
                let (new_qd, _peer, early_data) = self.get_socket_mut(index)?.accept()?;
                let mut new_socket = Socket::new(self.backend.clone(), new_qd);
                if let Some(sga) = early_data {
                    new_socket.seed_recv(sga);
                }
                let new_index = self.handles.alloc_socket(new_socket);
                Ok(handle::socket_handle(new_index))
            }
            Domain::Kernel => {
                let rc = unsafe { libc::accept(fd as RawFd, std::ptr::null_mut(), std::ptr::null_mut()) };
                if rc < 0 {
                    Err(Fail::from(std::io::Error::last_os_error()))
                } else {
                    Ok(rc as Descriptor)
                }
            }
            Domain::Epoll => Err(Fail::BadFileDescriptor {}),
        }
    }

    pub fn close(&mut self, fd: Descriptor) -> Result<(), Fail> {
        trace!("close(): fd={:?}", fd);
        match handle::classify(fd) {
            Domain::Socket => {
                let index = handle::socket_index(fd);
                let mut socket = self
                    .handles
                    .free_socket(index)
                    .ok_or(Fail::BadFileDescriptor {})?;
                socket.close()
            }
            Domain::Epoll => {
                let index = handle::epoll_index(fd);
                self.handles
                    .free_epoll(index)
                    .map(|_| ())
                    .ok_or(Fail::BadFileDescriptor {})
            }
            Domain::Kernel => {
                let rc = unsafe { libc::close(fd as RawFd) };
                if rc < 0 {
                    Err(Fail::from(std::io::Error::last_os_error()))
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn read(&mut self, fd: Descriptor, buf: &mut [u8]) -> Result<usize, Fail> {
        match handle::classify(fd) {
            Domain::Socket => {
                let index = handle::socket_index(fd);
                self.get_socket_mut(index)?.read(buf)
            }
            Domain::Kernel => kernel_read(fd as RawFd, buf),
            Domain::Epoll => Err(Fail::BadFileDescriptor {}),
        }
    }

    pub fn write(&mut self, fd: Descriptor, buf: &[u8]) -> Result<usize, Fail> {
        match handle::classify(fd) {
            Domain::Socket => {
                let index = handle::socket_index(fd);
                self.get_socket_mut(index)?.write(buf)
            }
            Domain::Kernel => kernel_write(fd as RawFd, buf),
            Domain::Epoll => Err(Fail::BadFileDescriptor {}),
        }
    }

    pub fn readv(&mut self, fd: Descriptor, iovecs: &mut [&mut [u8]]) -> Result<usize, Fail> {
        match handle::classify(fd) {
            Domain::Socket => {
                let index = handle::socket_index(fd);
                self.get_socket_mut(index)?.readv(iovecs)
            }
            Domain::Kernel => {
                let mut total = 0;
                for iov in iovecs.iter_mut() {
                    let n = kernel_read(fd as RawFd, iov)?;
                    total += n;
                    if n < iov.len() {
                        break;
                    }
                }
                Ok(total)
            }
            Domain::Epoll => Err(Fail::BadFileDescriptor {}),
        }
    }

    pub fn writev(&mut self, fd: Descriptor, iovecs: &[&[u8]]) -> Result<usize, Fail> {
        match handle::classify(fd) {
            Domain::Socket => {
                let index = handle::socket_index(fd);
                self.get_socket_mut(index)?.writev(iovecs)
            }
            Domain::Kernel => {
                let mut total = 0;
                for iov in iovecs {
                    total += kernel_write(fd as RawFd, iov)?;
                }
                Ok(total)
            }
            Domain::Epoll => Err(Fail::BadFileDescriptor {}),
        }
    }

    /// Explicitly unimplemented (spec.md §4.6: "may be left unimplemented
    /// (explicit fatal)").
    pub fn sendmsg(&mut self, _fd: Descriptor) -> ! {
        unimplemented!("sendmsg is not implemented by this shim")
    }

    /// Explicitly unimplemented (spec.md §4.6).
    pub fn recvmsg(&mut self, _fd: Descriptor) -> ! {
        unimplemented!("recvmsg is not implemented by this shim")
    }

    pub fn getsockname(&mut self, fd: Descriptor) -> Result<SocketAddrV4, Fail> {
        match handle::classify(fd) {
            Domain::Socket => {
                let index = handle::socket_index(fd);
                self.get_socket_mut(index)?
                    .local_addr()
                    .ok_or(Fail::Invalid {
                        details: "socket is not bound",
                    })
            }
            Domain::Kernel => kernel_getsockname(fd as RawFd),
            Domain::Epoll => Err(Fail::BadFileDescriptor {}),
        }
    }

    /// Bypass sockets accept and ignore every option (spec.md §4.6); a
    /// kernel-FD socket is forwarded verbatim to the host OS (spec.md §4.1).
    pub fn setsockopt(
        &mut self,
        fd: Descriptor,
        level: libc::c_int,
        optname: libc::c_int,
        optval: &[u8],
    ) -> Result<(), Fail> {
        trace!("setsockopt(): fd={:?} level={:?} optname={:?}", fd, level, optname);
        match handle::classify(fd) {
            Domain::Socket => Ok(()),
            Domain::Kernel => {
                let rc = unsafe {
                    libc::setsockopt(
                        fd as RawFd,
                        level,
                        optname,
                        optval.as_ptr() as *const libc::c_void,
                        optval.len() as libc::socklen_t,
                    )
                };
                if rc < 0 {
                    Err(Fail::from(std::io::Error::last_os_error()))
                } else {
                    Ok(())
                }
            }
            Domain::Epoll => Err(Fail::BadFileDescriptor {}),
        }
    }

    // ---- Epoll family -------------------------------------------------

    pub fn epoll_create(&mut self) -> Result<Descriptor, Fail> {
        trace!("epoll_create()");
        let set = EpollSet::new(self.backend.clone(), &self.config)?;
        let index = self.handles.alloc_epoll(set);
        Ok(handle::epoll_handle(index))
    }

    pub fn epoll_ctl(
        &mut self,
        epfd: Descriptor,
        op: libc::c_int,
        target_fd: Descriptor,
        interests: u32,
        user_data: u64,
    ) -> Result<(), Fail> {
        trace!(
            "epoll_ctl(): epfd={:?} op={:?} target_fd={:?} interests={:x}",
            epfd,
            op,
            target_fd,
            interests
        );
        if handle::classify(epfd) != Domain::Epoll {
            return Err(Fail::BadFileDescriptor {});
        }
        let epoll_index = handle::epoll_index(epfd);
        let epoll_set = self
            .handles
            .epoll_mut(epoll_index)
            .ok_or(Fail::BadFileDescriptor {})?;

        match handle::classify(target_fd) {
            Domain::Socket => {
                let socket_index = handle::socket_index(target_fd);
                match op {
                    libc::EPOLL_CTL_ADD => epoll_set.add_socket(socket_index, interests, user_data),
                    libc::EPOLL_CTL_MOD => epoll_set.modify_socket(socket_index, interests, user_data),
                    libc::EPOLL_CTL_DEL => epoll_set.delete_socket(socket_index),
                    _ => Err(Fail::Invalid {
                        details: "unknown epoll_ctl op",
                    }),
                }
            }
            Domain::Kernel => match op {
                libc::EPOLL_CTL_ADD => epoll_set.add_kernel_fd(target_fd as RawFd, interests, user_data),
                libc::EPOLL_CTL_MOD => epoll_set.modify_kernel_fd(target_fd as RawFd, interests, user_data),
                libc::EPOLL_CTL_DEL => epoll_set.delete_kernel_fd(target_fd as RawFd),
                _ => Err(Fail::Invalid {
                    details: "unknown epoll_ctl op",
                }),
            },
            Domain::Epoll => Err(Fail::Unsupported {
                details: "nesting an epoll set inside another is not supported",
            }),
        }
    }

    pub fn epoll_wait(
        &mut self,
        epfd: Descriptor,
        out: &mut Vec<Event>,
        maxevents: usize,
        timeout: Option<Duration>,
    ) -> Result<usize, Fail> {
        trace!("epoll_wait(): epfd={:?} maxevents={:?} timeout={:?}", epfd, maxevents, timeout);
        if handle::classify(epfd) != Domain::Epoll {
            return Err(Fail::BadFileDescriptor {});
        }
        let epoll_index = handle::epoll_index(epfd);
        self.handles.epoll_wait(epoll_index, out, maxevents, timeout)
    }

    fn get_socket_mut(&mut self, index: usize) -> Result<&mut Socket<B>, Fail> {
        self.handles.socket_mut(index).ok_or(Fail::BadFileDescriptor {})
    }
}

pub const EPOLLIN_BIT: u32 = EPOLLIN;
pub const EPOLLOUT_BIT: u32 = EPOLLOUT;

fn sockaddr_in(addr: &SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
    }
}

fn kernel_bind(fd: RawFd, addr: SocketAddrV4) -> Result<(), Fail> {
    let sockaddr = sockaddr_in(&addr);
    let rc = unsafe {
        libc::bind(
            fd,
            &sockaddr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        Err(Fail::from(std::io::Error::last_os_error()))
    } else {
        Ok(())
    }
}

fn kernel_connect(fd: RawFd, addr: SocketAddrV4) -> Result<(), Fail> {
    let sockaddr = sockaddr_in(&addr);
    let rc = unsafe {
        libc::connect(
            fd,
            &sockaddr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            return Ok(());
        }
        Err(Fail::from(err))
    } else {
        Ok(())
    }
}

fn kernel_read(fd: RawFd, buf: &mut [u8]) -> Result<usize, Fail> {
    let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) || err.raw_os_error() == Some(libc::EAGAIN) {
            return Err(Fail::WouldBlock {});
        }
        Err(Fail::from(err))
    } else {
        Ok(rc as usize)
    }
}

fn kernel_write(fd: RawFd, buf: &[u8]) -> Result<usize, Fail> {
    let rc = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) || err.raw_os_error() == Some(libc::EAGAIN) {
            return Err(Fail::WouldBlock {});
        }
        Err(Fail::from(err))
    } else {
        Ok(rc as usize)
    }
}

fn kernel_getsockname(fd: RawFd) -> Result<SocketAddrV4, Fail> {
    let mut sockaddr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut sockaddr as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(Fail::from(std::io::Error::last_os_error()));
    }
    let ip = std::net::Ipv4Addr::from(sockaddr.sin_addr.s_addr.to_ne_bytes());
    let port = u16::from_be(sockaddr.sin_port);
    Ok(SocketAddrV4::new(ip, port))
}
