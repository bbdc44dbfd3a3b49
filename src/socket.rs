// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Socket State Machine (spec.md §4.4): the per-socket tri-slot (accept,
//! recv, send) with at-most-one in-flight token per slot.

use crate::backend::{Backend, Completion, CompletionResult, Qd, QToken, Sga};
use crate::fail::Fail;
use crate::sga;

use std::net::SocketAddrV4;
use std::time::Duration;

/// The recv slot, valid only while the socket is in connected mode.
#[derive(Default)]
struct RecvSlot {
    pending: Option<QToken>,
    /// `None` until a pop completes; cleared once fully drained
    /// (spec.md §3 "payload ... receive-side byte offset").
    buffered: Option<(Sga, usize)>,
}

/// The accept slot, valid only while the socket is in accepting mode.
#[derive(Default)]
struct AcceptSlot {
    pending: Option<QToken>,
    ready: Option<(Qd, SocketAddrV4, Option<Sga>)>,
}

/// A socket is either accepting (after a successful `listen`) or connected;
/// never both (spec.md §3 "Socket" invariants). Encoded as a sum type
/// rather than the source's sentinel offset trick.
enum Mode {
    Connected(RecvSlot),
    Accepting(AcceptSlot),
}

/// Per-socket state: the backend queue descriptor, bound address, and the
/// three pending slots (send, plus the recv/accept union).
pub struct Socket<B: Backend> {
    backend: B,
    qd: Qd,
    local: Option<SocketAddrV4>,
    open: bool,
    send: Option<QToken>,
    mode: Mode,
    /// Set when a completion carries `CompletionResult::Failed`, surfaced
    /// to the caller on the next `read`/`write`/`accept` (spec.md §7
    /// "Backend failure").
    last_error: Option<Fail>,
}

impl<B: Backend> Socket<B> {
    pub fn new(backend: B, qd: Qd) -> Self {
        Socket {
            backend,
            qd,
            local: None,
            open: true,
            send: None,
            mode: Mode::Connected(RecvSlot::default()),
            last_error: None,
        }
    }

    pub fn qd(&self) -> Qd {
        self.qd
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.local
    }

    pub fn set_local_addr(&mut self, addr: SocketAddrV4) {
        self.local = Some(addr);
    }

    /// Transitions into accepting mode. Only valid before any read/write;
    /// enforced by `Engine`/`Shim`, not here (this type trusts its caller,
    /// matching the teacher's layering where `libos.rs` enforces call
    /// ordering and `engine.rs` assumes a valid `File`).
    pub fn enter_accepting_mode(&mut self) {
        self.mode = Mode::Accepting(AcceptSlot::default());
    }

    pub fn is_accepting(&self) -> bool {
        matches!(self.mode, Mode::Accepting(_))
    }

    // ---- Readiness predicates (spec.md §4.4) -----------------------------

    pub fn can_write(&self) -> bool {
        self.send.is_none()
    }

    pub fn can_read(&self) -> bool {
        match &self.mode {
            Mode::Connected(recv) => recv.buffered.is_some(),
            Mode::Accepting(_) => false,
        }
    }

    pub fn can_accept(&self) -> bool {
        match &self.mode {
            Mode::Accepting(accept) => accept.ready.is_some(),
            Mode::Connected(_) => false,
        }
    }

    /// Ensures an in-flight pop (or accept, in accepting mode) exists so a
    /// currently-unavailable EPOLLIN/accept event becomes reachable. Called
    /// by the readiness engine's sweep (spec.md §4.5 step 1).
    pub fn ensure_recv_submitted(&mut self) -> Result<(), Fail> {
        if !self.open {
            return Ok(());
        }
        match &mut self.mode {
            Mode::Connected(recv) => {
                if recv.pending.is_none() && recv.buffered.is_none() {
                    recv.pending = Some(self.backend.pop(self.qd)?);
                }
            }
            Mode::Accepting(accept) => {
                if accept.pending.is_none() && accept.ready.is_none() {
                    accept.pending = Some(self.backend.accept(self.qd)?);
                }
            }
        }
        Ok(())
    }

    /// Every outstanding token across this socket's slots, for the
    /// readiness engine's token-collection pass.
    pub fn outstanding_tokens(&self) -> Vec<QToken> {
        let mut tokens = Vec::new();
        if let Some(t) = self.send {
            tokens.push(t);
        }
        match &self.mode {
            Mode::Connected(recv) => {
                if let Some(t) = recv.pending {
                    tokens.push(t);
                }
            }
            Mode::Accepting(accept) => {
                if let Some(t) = accept.pending {
                    tokens.push(t);
                }
            }
        }
        tokens
    }

    /// Routes a completion into the slot whose token matches; installs the
    /// payload and clears `pending`. Opcode/slot mismatch is a fatal
    /// invariant violation (spec.md §4.4 "Event application").
    pub fn apply_completion(&mut self, completion: Completion) {
        let Completion { token, result, .. } = completion;
        if self.send == Some(token) {
            match result {
                CompletionResult::Push => {
                    self.send = None;
                }
                CompletionResult::Failed(e) => {
                    self.send = None;
                    self.last_error = Some(e);
                }
                other => panic!("push token completed with mismatched opcode: {:?}", other),
            }
            return;
        }
        match &mut self.mode {
            Mode::Connected(recv) if recv.pending == Some(token) => {
                recv.pending = None;
                match result {
                    CompletionResult::Pop(sga) => {
                        recv.buffered = Some((sga, 0));
                    }
                    CompletionResult::Failed(e) => {
                        self.last_error = Some(e);
                    }
                    other => panic!("pop token completed with mismatched opcode: {:?}", other),
                }
            }
            Mode::Accepting(accept) if accept.pending == Some(token) => {
                accept.pending = None;
                match result {
                    CompletionResult::Accept { new_qd, peer, early_data } => {
                        accept.ready = Some((new_qd, peer, early_data));
                    }
                    CompletionResult::Failed(e) => {
                        self.last_error = Some(e);
                    }
                    other => panic!("accept token completed with mismatched opcode: {:?}", other),
                }
            }
            _ => panic!("completion token does not match any outstanding slot on this socket"),
        }
    }

    /// Non-blocking probe of a single pending token via a zero-timeout
    /// backend wait, applying the completion if one arrived.
    fn probe(&mut self, token: QToken) -> bool {
        if let Some(completion) = self.backend.wait(token, Some(Duration::from_secs(0))) {
            self.apply_completion(completion);
            true
        } else {
            false
        }
    }

    /// spec.md §4.4 `read(buf,len)`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Fail> {
        if let Mode::Accepting(_) = self.mode {
            return Err(Fail::Unsupported {
                details: "read on a listening socket",
            });
        }

        let pending = match &self.mode {
            Mode::Connected(recv) => recv.pending,
            Mode::Accepting(_) => unreachable!(),
        };
        let buffered = matches!(&self.mode, Mode::Connected(recv) if recv.buffered.is_some());

        if !buffered {
            if pending.is_none() {
                let token = self.backend.pop(self.qd)?;
                if let Mode::Connected(recv) = &mut self.mode {
                    recv.pending = Some(token);
                }
                return Err(Fail::WouldBlock {});
            }
            if !self.probe(pending.unwrap()) {
                return Err(Fail::WouldBlock {});
            }
            if let Some(e) = self.last_error.take() {
                return Err(e);
            }
        }

        match &mut self.mode {
            Mode::Connected(recv) => {
                let (n, drained) = match &mut recv.buffered {
                    Some((sga, offset)) => sga::copy_from_sga(buf, sga, offset),
                    None => return Err(Fail::WouldBlock {}),
                };
                if drained {
                    // spec.md §4.4: "if the SGA is drained, free it" --
                    // once every byte has been delivered to the caller the
                    // backend buffer behind it is released back.
                    if let Some((sga, _)) = recv.buffered.take() {
                        self.backend.sga_free(sga);
                    }
                }
                Ok(n)
            }
            Mode::Accepting(_) => unreachable!(),
        }
    }

    /// spec.md §4.4 `write(buf,len)`.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Fail> {
        if !self.open {
            return Err(Fail::BadFileDescriptor {});
        }
        if let Some(token) = self.send {
            // Invariant: buffered-but-not-pending never occurs, so the only
            // reason `write` is called again while `send` is set is the
            // caller retrying after EWOULDBLOCK; just re-probe.
            self.probe(token);
            if self.send.is_some() {
                return Err(Fail::WouldBlock {});
            }
            if let Some(e) = self.last_error.take() {
                return Err(e);
            }
        }
        let mut payload = self.backend.sga_alloc(buf.len());
        sga::copy_into_sga(buf, buf.len(), &mut payload);
        let token = self.backend.push(self.qd, payload)?;
        self.send = Some(token);
        Ok(buf.len())
    }

    /// Vectored form of [Self::read]: distributes a single buffered SGA
    /// across `iovecs` in order, stopping at the first short fill
    /// (spec.md §4.3 "iovec variant").
    pub fn readv(&mut self, iovecs: &mut [&mut [u8]]) -> Result<usize, Fail> {
        if let Mode::Accepting(_) = self.mode {
            return Err(Fail::Unsupported {
                details: "readv on a listening socket",
            });
        }

        let pending = match &self.mode {
            Mode::Connected(recv) => recv.pending,
            Mode::Accepting(_) => unreachable!(),
        };
        let buffered = matches!(&self.mode, Mode::Connected(recv) if recv.buffered.is_some());

        if !buffered {
            if pending.is_none() {
                let token = self.backend.pop(self.qd)?;
                if let Mode::Connected(recv) = &mut self.mode {
                    recv.pending = Some(token);
                }
                return Err(Fail::WouldBlock {});
            }
            if !self.probe(pending.unwrap()) {
                return Err(Fail::WouldBlock {});
            }
            if let Some(e) = self.last_error.take() {
                return Err(e);
            }
        }

        match &mut self.mode {
            Mode::Connected(recv) => {
                let (n, drained) = match &mut recv.buffered {
                    Some((sga, offset)) => sga::copy_from_sga_into_iovecs(iovecs, sga, offset),
                    None => return Err(Fail::WouldBlock {}),
                };
                if drained {
                    if let Some((sga, _)) = recv.buffered.take() {
                        self.backend.sga_free(sga);
                    }
                }
                Ok(n)
            }
            Mode::Accepting(_) => unreachable!(),
        }
    }

    /// Vectored form of [Self::write]: copies every iovec into one SGA
    /// preserving byte order, then submits a single push.
    pub fn writev(&mut self, iovecs: &[&[u8]]) -> Result<usize, Fail> {
        if !self.open {
            return Err(Fail::BadFileDescriptor {});
        }
        if let Some(token) = self.send {
            self.probe(token);
            if self.send.is_some() {
                return Err(Fail::WouldBlock {});
            }
            if let Some(e) = self.last_error.take() {
                return Err(e);
            }
        }
        let total: usize = iovecs.iter().map(|v| v.len()).sum();
        let mut payload = self.backend.sga_alloc(total);
        let copied = sga::copy_iovecs_into_sga(iovecs, &mut payload);
        let token = self.backend.push(self.qd, payload)?;
        self.send = Some(token);
        Ok(copied)
    }

    /// spec.md §4.4 `accept(&out_addr)`. The third tuple element is any
    /// payload the peer already sent before the accept completed (spec.md
    /// §8 scenario 6); the caller seeds the new socket's recv slot with it
    /// via [Self::seed_recv].
    pub fn accept(&mut self) -> Result<(Qd, SocketAddrV4, Option<Sga>), Fail> {
        let accept = match &mut self.mode {
            Mode::Accepting(accept) => accept,
            Mode::Connected(_) => {
                return Err(Fail::Unsupported {
                    details: "accept on a non-listening socket",
                })
            }
        };

        if let Some(ready) = accept.ready.take() {
            return Ok(ready);
        }
        if accept.pending.is_none() {
            accept.pending = Some(self.backend.accept(self.qd)?);
            return Err(Fail::WouldBlock {});
        }
        let token = accept.pending.unwrap();
        if self.probe(token) {
            if let Some(e) = self.last_error.take() {
                return Err(e);
            }
            if let Mode::Accepting(accept) = &mut self.mode {
                if let Some(ready) = accept.ready.take() {
                    return Ok(ready);
                }
            }
        }
        Err(Fail::WouldBlock {})
    }

    /// Seeds a freshly accepted socket's recv slot with early data carried
    /// by the accept completion, so the first `read` need not submit a pop
    /// (spec.md §8 scenario 6).
    pub fn seed_recv(&mut self, sga: Sga) {
        if let Mode::Connected(recv) = &mut self.mode {
            recv.buffered = Some((sga, 0));
        }
    }

    /// spec.md §4.4 `close`: every pending token must be drained
    /// (blocking) before the backend descriptor is released.
    pub fn close(&mut self) -> Result<(), Fail> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        if let Some(token) = self.send.take() {
            if let Some(completion) = self.backend.wait(token, None) {
                // Drain only; a send's payload has already left the slot.
                let _ = completion;
            }
        }
        match &mut self.mode {
            Mode::Connected(recv) => {
                if let Some(token) = recv.pending.take() {
                    let _ = self.backend.wait(token, None);
                }
                if let Some((sga, _)) = recv.buffered.take() {
                    self.backend.sga_free(sga);
                }
            }
            Mode::Accepting(accept) => {
                if let Some(token) = accept.pending.take() {
                    let _ = self.backend.wait(token, None);
                }
            }
        }
        self.backend.close(self.qd)
    }
}
