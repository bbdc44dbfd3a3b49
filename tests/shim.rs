// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use catnap::api::Shim;
use catnap::backend::mock::LoopbackBackend;
use catnap::backend::Backend;
use catnap::config::Config;
use catnap::epoll::{EPOLLIN, EPOLLOUT};
use catnap::fail::Fail;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

fn addr(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)
}

/// Sets up a listening socket on a fresh `Shim` sharing `backend`, so the
/// test can drive the simulated peer side through `backend` directly.
fn listening(backend: &LoopbackBackend, port: u16) -> (Shim<LoopbackBackend>, i32) {
    let mut s = Shim::<LoopbackBackend>::from_backend(backend.clone(), Config::default());
    let fd = s.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    s.bind(fd, addr(port)).unwrap();
    s.listen(fd, 1).unwrap();
    (s, fd)
}

fn accept_blocking(s: &mut Shim<LoopbackBackend>, listen_fd: i32) -> i32 {
    loop {
        match s.accept(listen_fd) {
            Ok(fd) => return fd,
            Err(Fail::WouldBlock {}) => continue,
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }
}

/// spec.md §8 concrete scenario 1: echo once.
#[test]
fn echo_once() {
    let backend = LoopbackBackend::init(&[]).unwrap();
    let (mut s, listen_fd) = listening(&backend, 2137);

    let epfd = s.epoll_create().unwrap();
    s.epoll_ctl(epfd, libc::EPOLL_CTL_ADD, listen_fd, EPOLLIN, 42).unwrap();

    let listen_qd = s.socket_qd(listen_fd).unwrap();
    let remote = backend.simulate_connect(listen_qd, addr(9000));
    backend.deliver(remote, b"hi");

    let mut events = Vec::new();
    let n = s.epoll_wait(epfd, &mut events, 8, Some(Duration::from_millis(0))).unwrap();
    assert_eq!(n, 1);
    assert_eq!(events[0].data, 42);
    assert_eq!(events[0].events & EPOLLIN, EPOLLIN);

    let accepted = s.accept(listen_fd).unwrap();
    s.epoll_ctl(epfd, libc::EPOLL_CTL_ADD, accepted, EPOLLIN, 7).unwrap();

    let n = s.epoll_wait(epfd, &mut events, 8, Some(Duration::from_millis(0))).unwrap();
    assert_eq!(n, 1);
    assert_eq!(events[0].data, 7);

    let mut buf = [0u8; 2];
    let read = s.read(accepted, &mut buf).unwrap();
    assert_eq!(read, 2);
    assert_eq!(&buf, b"hi");
}

/// spec.md §8 concrete scenario 2: short read.
#[test]
fn short_read_splits_across_calls() {
    let backend = LoopbackBackend::init(&[]).unwrap();
    let (mut s, listen_fd) = listening(&backend, 2138);
    let listen_qd = s.socket_qd(listen_fd).unwrap();
    let remote = backend.simulate_connect(listen_qd, addr(9001));
    let accepted = accept_blocking(&mut s, listen_fd);

    backend.deliver(remote, b"0123456789");

    let mut buf = [0u8; 4];
    let n = loop {
        match s.read(accepted, &mut buf) {
            Ok(n) => break n,
            Err(Fail::WouldBlock {}) => continue,
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    };
    assert_eq!(n, 4);
    assert_eq!(&buf, b"0123");

    let n = s.read(accepted, &mut buf).unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf, b"4567");

    let n = s.read(accepted, &mut buf[..2]).unwrap();
    assert_eq!(n, 2);
    assert_eq!(&buf[..2], b"89");

    let err = s.read(accepted, &mut buf).unwrap_err();
    assert_eq!(err, Fail::WouldBlock {});
}

/// spec.md §8 concrete scenario 3: write-then-wait.
#[test]
fn write_then_wait_reports_epollout_after_completion() {
    let backend = LoopbackBackend::init(&[]).unwrap();
    let (mut s, listen_fd) = listening(&backend, 2139);
    let listen_qd = s.socket_qd(listen_fd).unwrap();
    let _remote = backend.simulate_connect(listen_qd, addr(9002));
    let accepted = accept_blocking(&mut s, listen_fd);

    let n = s.write(accepted, b"abc").unwrap();
    assert_eq!(n, 3);

    let epfd = s.epoll_create().unwrap();
    s.epoll_ctl(epfd, libc::EPOLL_CTL_ADD, accepted, EPOLLOUT, 1).unwrap();

    let mut events = Vec::new();
    let n = s.epoll_wait(epfd, &mut events, 8, Some(Duration::from_millis(0))).unwrap();
    assert_eq!(n, 0, "push still in flight, EPOLLOUT must not be reported yet");

    let n = s.epoll_wait(epfd, &mut events, 8, Some(Duration::from_millis(50))).unwrap();
    assert_eq!(n, 1);
    assert_eq!(events[0].events & EPOLLOUT, EPOLLOUT);
}

/// spec.md §8 concrete scenario 5: level-triggered residue.
#[test]
fn level_triggered_residue_without_new_backend_activity() {
    let backend = LoopbackBackend::init(&[]).unwrap();
    let (mut s, listen_fd) = listening(&backend, 2140);
    let listen_qd = s.socket_qd(listen_fd).unwrap();
    let remote = backend.simulate_connect(listen_qd, addr(9003));
    let accepted = accept_blocking(&mut s, listen_fd);
    backend.deliver(remote, b"0123456789");

    let epfd = s.epoll_create().unwrap();
    s.epoll_ctl(epfd, libc::EPOLL_CTL_ADD, accepted, EPOLLIN, 9).unwrap();

    let mut events = Vec::new();
    let n = s.epoll_wait(epfd, &mut events, 8, Some(Duration::from_millis(50))).unwrap();
    assert_eq!(n, 1);

    let mut buf = [0u8; 3];
    let read = s.read(accepted, &mut buf).unwrap();
    assert_eq!(read, 3);

    // No new backend activity: the remaining 7 buffered bytes must still
    // report readiness.
    let n = s.epoll_wait(epfd, &mut events, 8, Some(Duration::from_millis(0))).unwrap();
    assert_eq!(n, 1);
    assert_eq!(events[0].events & EPOLLIN, EPOLLIN);
}

/// spec.md §8 concrete scenario 6: accept early-data.
#[test]
fn accept_early_data_needs_no_new_pop() {
    let backend = LoopbackBackend::init(&[]).unwrap();
    let (mut s, listen_fd) = listening(&backend, 2141);
    let listen_qd = s.socket_qd(listen_fd).unwrap();
    let remote = backend.simulate_connect(listen_qd, addr(9004));

    let payload = vec![7u8; 1000];
    backend.deliver(remote, &payload);

    let accepted = accept_blocking(&mut s, listen_fd);

    let mut buf = vec![0u8; 1000];
    let n = s.read(accepted, &mut buf).unwrap();
    assert_eq!(n, 1000);
    assert_eq!(buf, payload);
}

/// spec.md §8 round-trip law: two successive reads against one SGA deliver
/// k and n-k bytes for any split k.
#[test]
fn split_k_round_trip_for_any_k() {
    let data = b"the quick brown fox jumps";
    for k in 0..=data.len() {
        let backend = LoopbackBackend::init(&[]).unwrap();
        let (mut s, listen_fd) = listening(&backend, 2200 + k as u16);
        let listen_qd = s.socket_qd(listen_fd).unwrap();
        let remote = backend.simulate_connect(listen_qd, addr(9100));
        let accepted = accept_blocking(&mut s, listen_fd);
        backend.deliver(remote, data);

        let mut first = vec![0u8; k];
        let n1 = loop {
            match s.read(accepted, &mut first) {
                Ok(n) => break n,
                Err(Fail::WouldBlock {}) => continue,
                Err(e) => panic!("{:?}", e),
            }
        };
        assert_eq!(n1, k);

        let mut second = vec![0u8; data.len() - k];
        let n2 = if second.is_empty() {
            0
        } else {
            s.read(accepted, &mut second).unwrap()
        };
        assert_eq!(n2, data.len() - k);

        let mut combined = first;
        combined.extend(second);
        assert_eq!(&combined[..], &data[..]);
    }
}

/// spec.md §8 concrete scenario 4: "Mixed epoll" -- one bypass socket and
/// one kernel fd registered in the same epoll set, both ready, returned in
/// one `wait` call. Exercises the kernel-epoll-drain step (epoll.rs step 4)
/// alongside the bypass sweep/ready-list path (step 5) in a single sweep.
#[test]
fn mixed_epoll_reports_bypass_and_kernel_events_in_one_wait() {
    let backend = LoopbackBackend::init(&[]).unwrap();
    let (mut s, listen_fd) = listening(&backend, 2300);

    let epfd = s.epoll_create().unwrap();
    s.epoll_ctl(epfd, libc::EPOLL_CTL_ADD, listen_fd, EPOLLIN, 42).unwrap();

    let listen_qd = s.socket_qd(listen_fd).unwrap();
    let remote = backend.simulate_connect(listen_qd, addr(9200));
    backend.deliver(remote, b"hi");

    let mut pipe_fds = [0i32; 2];
    let rc = unsafe { libc::pipe(pipe_fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    let [read_fd, write_fd] = pipe_fds;
    let n = unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(n, 1);

    s.epoll_ctl(epfd, libc::EPOLL_CTL_ADD, read_fd, EPOLLIN, 99).unwrap();

    let mut events = Vec::new();
    let n = s.epoll_wait(epfd, &mut events, 8, Some(Duration::from_secs(5))).unwrap();
    assert_eq!(n, 2);
    let datas: Vec<u64> = events.iter().map(|e| e.data).collect();
    assert!(datas.contains(&42));
    assert!(datas.contains(&99));
    for e in &events {
        assert_eq!(e.events & EPOLLIN, EPOLLIN);
    }

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

/// spec.md §8/§5 boundary behaviour: a non-empty ready-list coerces the
/// kernel epoll drain's timeout to 0 as well, not just the bypass
/// `wait_any`. A registered kernel fd with nothing to report must not make
/// `wait` block on the caller's (here infinite) timeout when a bypass
/// socket is already ready.
#[test]
fn mixed_epoll_ready_bypass_does_not_block_on_idle_kernel_fd() {
    let backend = LoopbackBackend::init(&[]).unwrap();
    let (mut s, listen_fd) = listening(&backend, 2301);

    let epfd = s.epoll_create().unwrap();
    s.epoll_ctl(epfd, libc::EPOLL_CTL_ADD, listen_fd, EPOLLIN, 42).unwrap();

    let listen_qd = s.socket_qd(listen_fd).unwrap();
    let remote = backend.simulate_connect(listen_qd, addr(9201));
    backend.deliver(remote, b"hi");

    let mut pipe_fds = [0i32; 2];
    let rc = unsafe { libc::pipe(pipe_fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    let [read_fd, write_fd] = pipe_fds;
    // Nothing written to write_fd: read_fd stays un-readable throughout.
    s.epoll_ctl(epfd, libc::EPOLL_CTL_ADD, read_fd, EPOLLIN, 99).unwrap();

    let mut events = Vec::new();
    // Infinite timeout: must still return promptly because the ready-list
    // is already non-empty from the bypass accept event.
    let n = s.epoll_wait(epfd, &mut events, 8, None).unwrap();
    assert_eq!(n, 1);
    assert_eq!(events[0].data, 42);

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

/// spec.md §8 boundary behaviour: `wait` with timeout 0 and no ready events
/// returns 0 without blocking.
#[test]
fn epoll_wait_zero_timeout_returns_immediately_when_empty() {
    let mut s = Shim::<LoopbackBackend>::new(&[], Config::default()).unwrap();
    let epfd = s.epoll_create().unwrap();
    let mut events = Vec::new();
    let n = s.epoll_wait(epfd, &mut events, 8, Some(Duration::from_millis(0))).unwrap();
    assert_eq!(n, 0);
}

/// spec.md §8 boundary behaviour: a bypass `connect()` surfaces the chosen
/// open-question resolution (`Fail::NotSupported`).
#[test]
fn bypass_connect_is_not_supported() {
    let mut s = Shim::<LoopbackBackend>::new(&[], Config::default()).unwrap();
    let fd = s.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    let err = s.connect(fd, addr(1)).unwrap_err();
    assert_eq!(
        err,
        Fail::NotSupported {
            details: "connect on a bypass socket"
        }
    );
}

/// A closed socket discovered mid-sweep is evicted rather than surfaced as
/// an error event (spec.md §9 open question, resolved in DESIGN.md).
#[test]
fn closed_socket_is_evicted_from_epoll_set_on_next_sweep() {
    let mut s = Shim::<LoopbackBackend>::new(&[], Config::default()).unwrap();
    let fd = s.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    let epfd = s.epoll_create().unwrap();
    s.epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, EPOLLIN, 1).unwrap();
    s.close(fd).unwrap();

    let mut events = Vec::new();
    let n = s.epoll_wait(epfd, &mut events, 8, Some(Duration::from_millis(0))).unwrap();
    assert_eq!(n, 0);
}

/// spec.md §8 invariant: unsupported address family/socket type on a
/// bypass-eligible path surfaces a distinct `Fail`, not a panic.
#[test]
fn unsupported_socket_family_is_rejected_by_mock_backend() {
    let backend = LoopbackBackend::init(&[]).unwrap();
    let err = backend.socket(libc::AF_INET6, libc::SOCK_STREAM, 0).unwrap_err();
    assert_eq!(err, Fail::AddressFamilySupport {});

    let err = backend.socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap_err();
    assert_eq!(err, Fail::SocketTypeSupport {});
}
