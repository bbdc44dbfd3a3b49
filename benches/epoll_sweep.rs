// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Benchmarks the readiness engine's sweep-and-wait (spec.md §4.5) over a
//! growing number of watched, all-idle bypass sockets: the cost the
//! specification requires to stay linear in watched items.

use catnap::api::Shim;
use catnap::backend::mock::LoopbackBackend;
use catnap::backend::Backend;
use catnap::config::Config;
use catnap::epoll::EPOLLIN;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

fn idle_sweep(n: usize) {
    let backend = LoopbackBackend::init(&[]).unwrap();
    let mut s = Shim::<LoopbackBackend>::from_backend(backend, Config::default());
    let epfd = s.epoll_create().unwrap();

    for i in 0..n {
        let fd = s.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        let addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 3000 + i as u16);
        s.bind(fd, addr).unwrap();
        s.listen(fd, 1).unwrap();
        s.epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, EPOLLIN, i as u64).unwrap();
    }

    let mut events = Vec::new();
    s.epoll_wait(epfd, &mut events, n.max(1), Some(Duration::from_millis(0)))
        .unwrap();
}

fn bench_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("epoll_sweep");
    for n in [1usize, 16, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| idle_sweep(n));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sweep);
criterion_main!(benches);
