// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The backend contract (spec.md §6): the narrow interface this crate
//! consumes from the external kernel-bypass I/O library. Everything in this
//! module is a trait and a handful of plain-data types; the implementation
//! lives outside this crate. [mock::LoopbackBackend] is a test-only stand-in
//! used by the integration tests.

/// A single-threaded, in-memory [Backend] used by this crate's own test
/// suite in place of a real kernel-bypass provider. Not a production
/// backend.
pub mod mock;

use crate::fail::Fail;
use std::net::SocketAddrV4;
use std::time::Duration;

/// Backend queue descriptor. Analogous to a file descriptor, but scoped to
/// the backend's own namespace -- never exposed directly to shim callers.
pub type Qd = u32;

/// Backend queue token. Identifies a single outstanding submission; never
/// reused across operations (spec.md §3 "Token").
pub type QToken = u64;

/// One segment of a scatter-gather array.
#[derive(Debug, Clone)]
pub struct SgaSegment {
    pub data: Box<[u8]>,
}

impl SgaSegment {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A scatter-gather array: the unit of push/pop exchanged with the backend.
#[derive(Debug, Clone, Default)]
pub struct Sga {
    pub segments: Vec<SgaSegment>,
}

impl Sga {
    /// Allocates an SGA as a single segment of `size` zeroed bytes.
    pub fn zeroed(size: usize) -> Self {
        Sga {
            segments: vec![SgaSegment {
                data: vec![0u8; size].into_boxed_slice(),
            }],
        }
    }

    /// Total capacity across all segments.
    pub fn capacity(&self) -> usize {
        self.segments.iter().map(SgaSegment::len).sum()
    }
}

/// The payload carried by a completed operation, keyed by opcode so a
/// mismatch against the slot that submitted it is detectable (spec.md §4.4
/// "Event application").
#[derive(Debug)]
pub enum CompletionResult {
    /// `early_data` carries any bytes the peer already sent before the
    /// accept completed, so the first post-accept read need not submit a
    /// fresh pop (spec.md §8 scenario 6 "Accept early-data").
    Accept {
        new_qd: Qd,
        peer: SocketAddrV4,
        early_data: Option<Sga>,
    },
    Push,
    Pop(Sga),
    Failed(Fail),
}

/// A tagged completion result, keyed by the originating queue descriptor and
/// token (spec.md §6 "A completion result is a tagged union keyed by
/// opcode").
#[derive(Debug)]
pub struct Completion {
    pub qd: Qd,
    pub token: QToken,
    pub result: CompletionResult,
}

/// The backend provider contract (spec.md §6). Implementations are
/// expected to be cheaply `Clone`-able handles onto process-wide state, in
/// the same spirit as the teacher's `Runtime` trait.
pub trait Backend: Clone {
    /// Process-wide one-shot initialisation. Must be called exactly once
    /// before any other operation (spec.md §5 "Shared resources").
    fn init(args: &[String]) -> Result<Self, Fail>
    where
        Self: Sized;

    fn socket(&self, family: libc::c_int, ty: libc::c_int, proto: libc::c_int)
        -> Result<Qd, Fail>;

    fn bind(&self, qd: Qd, addr: SocketAddrV4) -> Result<(), Fail>;

    fn listen(&self, qd: Qd, backlog: usize) -> Result<(), Fail>;

    /// Submits an accept; the returned token's completion yields
    /// `CompletionResult::Accept`.
    fn accept(&self, qd: Qd) -> Result<QToken, Fail>;

    /// Submits a send of `sga`; completion yields `CompletionResult::Push`.
    fn push(&self, qd: Qd, sga: Sga) -> Result<QToken, Fail>;

    /// Submits a receive; completion yields `CompletionResult::Pop`.
    fn pop(&self, qd: Qd) -> Result<QToken, Fail>;

    /// Blocks at most `timeout` for `token` specifically. `None` timeout
    /// polls (zero-timeout probe); returns `None` on timeout.
    fn wait(&self, token: QToken, timeout: Option<Duration>) -> Option<Completion>;

    /// Blocks at most `timeout` for any token in `tokens`. Returns the index
    /// into `tokens` of the one that completed, plus its completion.
    fn wait_any(&self, tokens: &[QToken], timeout: Option<Duration>) -> Option<(usize, Completion)>;

    fn sga_alloc(&self, size: usize) -> Sga;

    fn sga_free(&self, sga: Sga);

    fn close(&self, qd: Qd) -> Result<(), Fail>;
}
