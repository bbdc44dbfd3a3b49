// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A deterministic, in-memory stand-in for the external kernel-bypass
//! backend, used only by this crate's own tests. Submissions that can
//! complete immediately (a push into an already-open connection, a pop
//! against a non-empty inbox, an accept against a non-empty backlog) do so
//! synchronously; everything else is probed on each `wait`/`wait_any` call.
//!
//! There is no background thread producing completions -- this backend
//! never becomes ready on its own. Callers (tests) must call
//! [LoopbackBackend::deliver] or [LoopbackBackend::simulate_connect] before
//! the `wait` that is meant to observe the result, exactly as a real NIC
//! interrupt would precede a real backend's completion.

use crate::backend::{Backend, CompletionResult, Completion, Qd, QToken, Sga};
use crate::fail::Fail;

use slab::Slab;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

/// Safety valve for a timeout of `None` (spec.md "a negative timeout waits
/// indefinitely"): since this mock has no external producer, an unbounded
/// wait would hang the test process forever on a misconfigured scenario.
const UNBOUNDED_WAIT_CAP: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(1);

type Inbox = Rc<RefCell<VecDeque<u8>>>;

struct PendingAccept {
    peer_addr: SocketAddrV4,
    /// Bytes the accepted connection already has waiting for it (early data,
    /// spec.md §8 scenario 6).
    inbox: Inbox,
    peer_inbox: Inbox,
}

enum Kind {
    Plain,
    Listening { backlog: VecDeque<PendingAccept> },
    Connected { inbox: Inbox, peer_inbox: Inbox },
}

struct MockSocket {
    local: Option<SocketAddrV4>,
    kind: Kind,
}

enum PendingOp {
    Accept { qd: Qd },
    Pop { qd: Qd },
    Push { qd: Qd },
}

struct Inner {
    sockets: Slab<MockSocket>,
    pending: Slab<PendingOp>,
}

/// Test-only [Backend] implementation. See the module docs.
#[derive(Clone)]
pub struct LoopbackBackend {
    inner: Rc<RefCell<Inner>>,
}

impl LoopbackBackend {
    fn qd_token(slot: usize) -> QToken {
        slot as QToken
    }

    /// Simulates a remote peer connecting to a listening bypass socket.
    /// Returns a `Qd` the test can use with [Self::deliver] to push bytes
    /// "from the kernel side" into the accepted connection's inbox.
    pub fn simulate_connect(&self, listen_qd: Qd, peer_addr: SocketAddrV4) -> Qd {
        let mut inner = self.inner.borrow_mut();
        let inbox: Inbox = Rc::new(RefCell::new(VecDeque::new()));
        let peer_inbox: Inbox = Rc::new(RefCell::new(VecDeque::new()));

        let remote = inner.sockets.insert(MockSocket {
            local: Some(peer_addr),
            kind: Kind::Connected {
                inbox: peer_inbox.clone(),
                peer_inbox: inbox.clone(),
            },
        });

        let listener = &mut inner.sockets[listen_qd as usize];
        match &mut listener.kind {
            Kind::Listening { backlog } => backlog.push_back(PendingAccept {
                peer_addr,
                inbox,
                peer_inbox,
            }),
            _ => panic!("simulate_connect on a non-listening socket"),
        }
        remote as Qd
    }

    /// Pushes bytes into `qd`'s connected peer inbox, as if they had arrived
    /// from the kernel side of the connection.
    pub fn deliver(&self, qd: Qd, bytes: &[u8]) {
        let inner = self.inner.borrow();
        match &inner.sockets[qd as usize].kind {
            Kind::Connected { peer_inbox, .. } => peer_inbox.borrow_mut().extend(bytes),
            _ => panic!("deliver on a non-connected socket"),
        }
    }

    fn try_complete(inner: &mut Inner, pending_key: usize) -> Option<Completion> {
        let op = &inner.pending[pending_key];
        match op {
            PendingOp::Accept { qd } => {
                let qd = *qd;
                let pending_accept = match &mut inner.sockets[qd as usize].kind {
                    Kind::Listening { backlog } => backlog.pop_front(),
                    _ => unreachable!("accept slot points at a non-listening socket"),
                }?;
                let early: Vec<u8> = pending_accept.inbox.borrow_mut().drain(..).collect();
                let early_data = if early.is_empty() {
                    None
                } else {
                    Some(Sga {
                        segments: vec![crate::backend::SgaSegment {
                            data: early.into_boxed_slice(),
                        }],
                    })
                };
                let new_qd = inner.sockets.insert(MockSocket {
                    local: None,
                    kind: Kind::Connected {
                        inbox: pending_accept.inbox,
                        peer_inbox: pending_accept.peer_inbox,
                    },
                }) as Qd;
                inner.pending.remove(pending_key);
                Some(Completion {
                    qd,
                    token: Self::qd_token(pending_key),
                    result: CompletionResult::Accept {
                        new_qd,
                        peer: pending_accept.peer_addr,
                        early_data,
                    },
                })
            }
            PendingOp::Pop { qd } => {
                let qd = *qd;
                let inbox = match &inner.sockets[qd as usize].kind {
                    Kind::Connected { inbox, .. } => inbox.clone(),
                    _ => unreachable!("pop slot points at a non-connected socket"),
                };
                if inbox.borrow().is_empty() {
                    return None;
                }
                let drained: Vec<u8> = inbox.borrow_mut().drain(..).collect();
                inner.pending.remove(pending_key);
                Some(Completion {
                    qd,
                    token: Self::qd_token(pending_key),
                    result: CompletionResult::Pop(Sga {
                        segments: vec![crate::backend::SgaSegment {
                            data: drained.into_boxed_slice(),
                        }],
                    }),
                })
            }
            PendingOp::Push { qd } => {
                let qd = *qd;
                inner.pending.remove(pending_key);
                Some(Completion {
                    qd,
                    token: Self::qd_token(pending_key),
                    result: CompletionResult::Push,
                })
            }
        }
    }
}

impl Backend for LoopbackBackend {
    fn init(_args: &[String]) -> Result<Self, Fail> {
        Ok(LoopbackBackend {
            inner: Rc::new(RefCell::new(Inner {
                sockets: Slab::new(),
                pending: Slab::new(),
            })),
        })
    }

    fn socket(
        &self,
        family: libc::c_int,
        ty: libc::c_int,
        _proto: libc::c_int,
    ) -> Result<Qd, Fail> {
        if family != libc::AF_INET {
            return Err(Fail::AddressFamilySupport {});
        }
        if ty != libc::SOCK_STREAM {
            return Err(Fail::SocketTypeSupport {});
        }
        let mut inner = self.inner.borrow_mut();
        let qd = inner.sockets.insert(MockSocket {
            local: None,
            kind: Kind::Plain,
        });
        Ok(qd as Qd)
    }

    fn bind(&self, qd: Qd, addr: SocketAddrV4) -> Result<(), Fail> {
        let mut inner = self.inner.borrow_mut();
        inner.sockets[qd as usize].local = Some(addr);
        Ok(())
    }

    fn listen(&self, qd: Qd, _backlog: usize) -> Result<(), Fail> {
        let mut inner = self.inner.borrow_mut();
        inner.sockets[qd as usize].kind = Kind::Listening {
            backlog: VecDeque::new(),
        };
        Ok(())
    }

    fn accept(&self, qd: Qd) -> Result<QToken, Fail> {
        let mut inner = self.inner.borrow_mut();
        let key = inner.pending.insert(PendingOp::Accept { qd });
        Ok(Self::qd_token(key))
    }

    fn push(&self, qd: Qd, sga: Sga) -> Result<QToken, Fail> {
        let mut inner = self.inner.borrow_mut();
        let peer_inbox = match &inner.sockets[qd as usize].kind {
            Kind::Connected { peer_inbox, .. } => peer_inbox.clone(),
            _ => return Err(Fail::BadFileDescriptor {}),
        };
        for segment in &sga.segments {
            peer_inbox.borrow_mut().extend(segment.data.iter().copied());
        }
        // The copy into the peer's inbox already happened above; the
        // pending entry exists only so `wait`/`wait_any` has a token to
        // resolve on the next probe, matching the async submit/complete
        // shape of a real push.
        let key = inner.pending.insert(PendingOp::Push { qd });
        Ok(Self::qd_token(key))
    }

    fn pop(&self, qd: Qd) -> Result<QToken, Fail> {
        let mut inner = self.inner.borrow_mut();
        let key = inner.pending.insert(PendingOp::Pop { qd });
        Ok(Self::qd_token(key))
    }

    fn wait(&self, token: QToken, timeout: Option<Duration>) -> Option<Completion> {
        let bound = timeout.unwrap_or(UNBOUNDED_WAIT_CAP).min(UNBOUNDED_WAIT_CAP);
        let hard_deadline = Instant::now() + bound;
        loop {
            {
                let mut inner = self.inner.borrow_mut();
                let key = token as usize;
                if !inner.pending.contains(key) {
                    return None;
                }
                if let Some(c) = Self::try_complete(&mut inner, key) {
                    return Some(c);
                }
            }
            if Instant::now() >= hard_deadline {
                return None;
            }
            thread::sleep(POLL_INTERVAL.min(bound));
        }
    }

    fn wait_any(&self, tokens: &[QToken], timeout: Option<Duration>) -> Option<(usize, Completion)> {
        let bound = timeout.unwrap_or(UNBOUNDED_WAIT_CAP).min(UNBOUNDED_WAIT_CAP);
        let hard_deadline = Instant::now() + bound;
        loop {
            for (i, &token) in tokens.iter().enumerate() {
                let mut inner = self.inner.borrow_mut();
                let key = token as usize;
                if !inner.pending.contains(key) {
                    continue;
                }
                if let Some(c) = Self::try_complete(&mut inner, key) {
                    return Some((i, c));
                }
            }
            if Instant::now() >= hard_deadline {
                return None;
            }
            thread::sleep(POLL_INTERVAL.min(bound.max(Duration::from_micros(1))));
        }
    }

    fn sga_alloc(&self, size: usize) -> Sga {
        Sga::zeroed(size)
    }

    fn sga_free(&self, _sga: Sga) {}

    fn close(&self, qd: Qd) -> Result<(), Fail> {
        let mut inner = self.inner.borrow_mut();
        if inner.sockets.contains(qd as usize) {
            inner.sockets.remove(qd as usize);
        }
        Ok(())
    }
}
