// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! SGA Marshaller (spec.md §4.3): copies bytes between caller buffers /
//! iovecs and the backend's scatter-gather arrays.

use crate::backend::Sga;

/// Copies `len` bytes from `buf` into `sga`'s segments, filling each
/// segment before moving to the next. `sga` must have been allocated with
/// capacity >= `len`; a caller that violates this has a bug, so this
/// panics rather than returning an error (spec.md §4.3: "Fails loudly if
/// capacity insufficient").
pub fn copy_into_sga(buf: &[u8], len: usize, sga: &mut Sga) -> usize {
    assert!(
        sga.capacity() >= len,
        "sga capacity {} smaller than requested copy of {} bytes",
        sga.capacity(),
        len
    );
    let mut copied = 0;
    for segment in sga.segments.iter_mut() {
        if copied == len {
            break;
        }
        let n = (len - copied).min(segment.data.len());
        segment.data[..n].copy_from_slice(&buf[copied..copied + n]);
        copied += n;
    }
    copied
}

/// Copies up to `buf.len()` bytes out of `sga`, starting at `*off_in_out`,
/// across as many segments as needed; advances `*off_in_out`. Returns
/// `(bytes_copied, drained)` where `drained` is true once every byte of
/// `sga` has been consumed.
pub fn copy_from_sga(buf: &mut [u8], sga: &Sga, off_in_out: &mut usize) -> (usize, bool) {
    let total: usize = sga.capacity();
    let mut remaining_skip = *off_in_out;
    let mut copied = 0usize;

    for segment in sga.segments.iter() {
        if copied == buf.len() {
            break;
        }
        let seg_len = segment.data.len();
        if remaining_skip >= seg_len {
            remaining_skip -= seg_len;
            continue;
        }
        let start = remaining_skip;
        remaining_skip = 0;
        let available = seg_len - start;
        let n = available.min(buf.len() - copied);
        buf[copied..copied + n].copy_from_slice(&segment.data[start..start + n]);
        copied += n;
    }

    *off_in_out += copied;
    (copied, *off_in_out >= total)
}

/// Copies a sequence of caller iovecs into one SGA, preserving byte order.
pub fn copy_iovecs_into_sga(iovecs: &[&[u8]], sga: &mut Sga) -> usize {
    let total: usize = iovecs.iter().map(|v| v.len()).sum();
    assert!(sga.capacity() >= total, "sga too small for iovec total");
    let mut copied = 0;
    for iov in iovecs {
        copied += copy_into_sga_at(iov, sga, copied);
    }
    copied
}

fn copy_into_sga_at(buf: &[u8], sga: &mut Sga, dest_offset: usize) -> usize {
    let mut pos = 0usize;
    let mut copied = 0usize;
    for segment in sga.segments.iter_mut() {
        let seg_len = segment.data.len();
        if pos + seg_len <= dest_offset {
            pos += seg_len;
            continue;
        }
        let seg_start = dest_offset.saturating_sub(pos).min(seg_len);
        let available = seg_len - seg_start;
        let n = available.min(buf.len() - copied);
        segment.data[seg_start..seg_start + n].copy_from_slice(&buf[copied..copied + n]);
        copied += n;
        pos += seg_len;
        if copied == buf.len() {
            break;
        }
    }
    copied
}

/// readv-style loop: copies `sga` (starting at `*off_in_out`) into each
/// iovec in turn, stopping on the first short fill (spec.md §4.3 "iovec
/// variant").
pub fn copy_from_sga_into_iovecs(
    iovecs: &mut [&mut [u8]],
    sga: &Sga,
    off_in_out: &mut usize,
) -> (usize, bool) {
    let mut total_copied = 0usize;
    let mut drained = false;
    for iov in iovecs.iter_mut() {
        let (n, d) = copy_from_sga(iov, sga, off_in_out);
        total_copied += n;
        drained = d;
        if n < iov.len() {
            break;
        }
    }
    (total_copied, drained)
}
