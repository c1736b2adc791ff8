//! Ring-buffer protocol shared by host and backend.
//!
//! Two byte rings live in one host-allocated DMA area: the request ring
//! (host produces, backend consumes via RDMA read) and the response ring
//! (backend produces via RDMA write, host consumes). Cursors are byte
//! offsets modulo the ring capacity; frames are self-describing by a u32
//! length and may wrap the ring boundary.
//!
//! The backend maintains three cursors over the response ring:
//! the parse tail (slots reserved), the completion tail (prefix whose file
//! service results are in), and the transmit tail (prefix pushed to the
//! host). In ring order `head <= transmit <= complete <= parse` always
//! holds.

pub mod layout;
pub mod region;
pub mod request;
pub mod response;

pub use region::DmaRegion;

/// Errors raised by ring-protocol bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("malformed frame at ring offset {offset}")]
    MalformedFrame { offset: u32 },

    #[error("ring full: need {need} bytes, {free} free")]
    Full { need: u32, free: u32 },

    #[error("response ring overflow: batch of {need} bytes, {free} free")]
    ResponseOverflow { need: u32, free: u32 },

    #[error("request larger than the ring: {bytes} bytes")]
    OversizedRequest { bytes: u32 },
}

/// Bytes between two cursors in ring order.
#[inline]
pub fn ring_distance(tail: u32, head: u32, cap: u32) -> u32 {
    if tail >= head {
        tail - head
    } else {
        cap - head + tail
    }
}

/// Advance a cursor, wrapping at the capacity.
#[inline]
pub fn ring_advance(cursor: u32, bytes: u32, cap: u32) -> u32 {
    let next = cursor + bytes;
    if next >= cap {
        next % cap
    } else {
        next
    }
}

/// Copy bytes out of a ring data region, wrapping at the capacity.
///
/// `base` is the offset of the ring data region inside `region`.
pub fn ring_read(region: &DmaRegion, base: usize, cap: u32, off: u32, dst: &mut [u8]) {
    let span = SplitRange::spanning(off, dst.len() as u32, cap);
    region.read_at(base + span.first_off as usize, &mut dst[..span.first_len as usize]);
    if span.is_split() {
        region.read_at(base, &mut dst[span.first_len as usize..]);
    }
}

/// Copy bytes into a ring data region, wrapping at the capacity.
pub fn ring_write(region: &DmaRegion, base: usize, cap: u32, off: u32, src: &[u8]) {
    let span = SplitRange::spanning(off, src.len() as u32, cap);
    region.write_at(base + span.first_off as usize, &src[..span.first_len as usize]);
    if span.is_split() {
        region.write_at(base, &src[span.first_len as usize..]);
    }
}

/// A possibly-wrapping byte range inside a ring.
///
/// The second segment, when present, always starts at ring offset zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitRange {
    pub first_off: u32,
    pub first_len: u32,
    pub second_len: u32,
}

impl SplitRange {
    pub fn contiguous(off: u32, len: u32) -> Self {
        Self {
            first_off: off,
            first_len: len,
            second_len: 0,
        }
    }

    pub fn wrapped(off: u32, first_len: u32, second_len: u32) -> Self {
        Self {
            first_off: off,
            first_len,
            second_len,
        }
    }

    /// Range covering `len` bytes starting at `off`, wrapping at `cap`.
    pub fn spanning(off: u32, len: u32, cap: u32) -> Self {
        if off + len > cap {
            Self::wrapped(off, cap - off, len - (cap - off))
        } else {
            Self::contiguous(off, len)
        }
    }

    #[inline]
    pub fn is_split(&self) -> bool {
        self.second_len != 0
    }

    #[inline]
    pub fn total(&self) -> u32 {
        self.first_len + self.second_len
    }
}

/// Progress of a split DMA transfer.
///
/// A wrapped ring range is moved by two work requests; the state tracks how
/// many of their completions are still outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitState {
    /// Single work request in flight (or idle).
    #[default]
    NotSplit,
    /// Two work requests in flight, none completed.
    PartOne,
    /// Two work requests in flight, one completed.
    PartTwo,
}

impl SplitState {
    /// Arm the state for a transfer covering `range`.
    pub fn arm(&mut self, range: &SplitRange) {
        *self = if range.is_split() {
            SplitState::PartOne
        } else {
            SplitState::NotSplit
        };
    }

    /// Record one work-request completion; returns true when the whole
    /// transfer has finished.
    pub fn on_completion(&mut self) -> bool {
        match *self {
            SplitState::NotSplit => true,
            SplitState::PartOne => {
                *self = SplitState::PartTwo;
                false
            }
            SplitState::PartTwo => {
                *self = SplitState::NotSplit;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_distance() {
        assert_eq!(ring_distance(0, 0, 64), 0);
        assert_eq!(ring_distance(10, 4, 64), 6);
        assert_eq!(ring_distance(4, 10, 64), 58);
        assert_eq!(ring_distance(0, 63, 64), 1);
    }

    #[test]
    fn test_ring_advance_wraps() {
        assert_eq!(ring_advance(60, 4, 64), 0);
        assert_eq!(ring_advance(60, 8, 64), 4);
        assert_eq!(ring_advance(0, 63, 64), 63);
    }

    #[test]
    fn test_split_range_spanning() {
        let r = SplitRange::spanning(10, 20, 64);
        assert!(!r.is_split());
        assert_eq!(r.total(), 20);

        let r = SplitRange::spanning(60, 10, 64);
        assert!(r.is_split());
        assert_eq!(r.first_off, 60);
        assert_eq!(r.first_len, 4);
        assert_eq!(r.second_len, 6);
        assert_eq!(r.total(), 10);

        // Exactly reaching the boundary is not a split.
        let r = SplitRange::spanning(60, 4, 64);
        assert!(!r.is_split());
    }

    #[test]
    fn test_split_state_transitions() {
        let mut s = SplitState::NotSplit;
        s.arm(&SplitRange::contiguous(0, 8));
        assert_eq!(s, SplitState::NotSplit);
        assert!(s.on_completion());

        s.arm(&SplitRange::wrapped(60, 4, 4));
        assert_eq!(s, SplitState::PartOne);
        assert!(!s.on_completion());
        assert_eq!(s, SplitState::PartTwo);
        assert!(s.on_completion());
        assert_eq!(s, SplitState::NotSplit);
    }
}
