//! Response ring: backend-side three-tail bookkeeping and host-side
//! consumer.
//!
//! The backend stages responses locally and tracks three cursors:
//!
//! - `parse`: next slot to reserve while parsing a request batch,
//! - `complete`: prefix whose file-service results are in,
//! - `transmit`: prefix already pushed to the host.
//!
//! Each batch starts with one unit-sized slot holding the batch's total
//! size, so the completion scanner knows when a batch is entirely ready.
//! Slots are reserved in parse order, which preserves FIFO responses even
//! when the file service completes out of order: the scanner only ever
//! advances `complete` over the committed prefix.

use std::sync::atomic::Ordering;

use zerocopy::{FromBytes, IntoBytes};

use super::layout;
use super::{ring_advance, ring_distance, DmaRegion, RingError, SplitRange};
use crate::constants::RESPONSE_RING_USED;
use crate::wire::data::{
    AckFrameHeader, ACK_RESULT_OFFSET, FRAME_LEN_BYTES, RESPONSE_UNIT_BYTES,
};
use crate::wire::status;
use zerocopy::byteorder::little_endian::{U32, U64};

/// The backend's three cursors over the response ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseTails {
    pub parse: u32,
    pub complete: u32,
    pub transmit: u32,
}

impl ResponseTails {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A reserved response slot.
#[derive(Debug, Clone, Copy)]
pub struct ReservedSlot {
    /// Offset of the slot's length prefix.
    pub slot_off: u32,
    /// Slot size including padding.
    pub slot_len: u32,
    /// Payload destination for reads; empty for writes.
    pub payload: SplitRange,
}

/// Reserves response slots for one parse batch.
///
/// `begin` claims the batch-header unit; each `reserve` stages a pending ack
/// and claims payload space; `finish` records the batch total in the header
/// slot.
pub struct BatchBuilder<'a> {
    staging: &'a DmaRegion,
    cap: u32,
    tails: &'a mut ResponseTails,
    batch_header_off: u32,
    total: u32,
    count: u32,
}

impl<'a> BatchBuilder<'a> {
    pub fn begin(staging: &'a DmaRegion, tails: &'a mut ResponseTails) -> Result<Self, RingError> {
        let cap = RESPONSE_RING_USED;
        let batch_header_off = tails.parse;
        let mut builder = Self {
            staging,
            cap,
            tails,
            batch_header_off,
            total: 0,
            count: 0,
        };
        builder.claim(RESPONSE_UNIT_BYTES)?;
        Ok(builder)
    }

    /// Bytes still free for reservation.
    ///
    /// Staged bytes become reusable once transmitted; one unit of slack
    /// keeps a completely full ring distinguishable from an empty one.
    fn free_bytes(&self) -> u32 {
        self.cap
            - RESPONSE_UNIT_BYTES
            - ring_distance(self.tails.parse, self.tails.transmit, self.cap)
    }

    fn claim(&mut self, bytes: u32) -> Result<(), RingError> {
        let free = self.free_bytes();
        if bytes > free {
            return Err(RingError::ResponseOverflow { need: bytes, free });
        }
        self.tails.parse = ring_advance(self.tails.parse, bytes, self.cap);
        self.total += bytes;
        Ok(())
    }

    /// Reserve the response slot for one parsed request and stage its
    /// pending ack.
    pub fn reserve(&mut self, request_id: u64, is_read: bool, bytes: u32) -> Result<ReservedSlot, RingError> {
        let slot_off = self.tails.parse;
        let slot_len = crate::wire::data::response_slot_bytes(is_read, bytes);
        self.claim(slot_len)?;

        // Slot headers never wrap: offsets and the capacity are unit
        // multiples.
        self.staging
            .write_at(slot_off as usize, &slot_len.to_le_bytes());
        let ack = AckFrameHeader {
            request_id: U64::new(request_id),
            result: U32::new(status::IO_PENDING),
            bytes_serviced: U32::new(0),
        };
        self.staging
            .write_at((slot_off + FRAME_LEN_BYTES) as usize, ack.as_bytes());

        let payload = if is_read {
            SplitRange::spanning(
                ring_advance(slot_off, RESPONSE_UNIT_BYTES, self.cap),
                bytes,
                self.cap,
            )
        } else {
            SplitRange::contiguous(0, 0)
        };

        self.count += 1;
        Ok(ReservedSlot {
            slot_off,
            slot_len,
            payload,
        })
    }

    /// Record the batch total in the batch-header slot and return
    /// `(total, count)`.
    pub fn finish(self) -> (u32, u32) {
        self.staging
            .write_at(self.batch_header_off as usize, &self.total.to_le_bytes());
        (self.total, self.count)
    }
}

/// Result of one completion-scan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Nothing new completed.
    Idle,
    /// The completion tail advanced.
    Progress {
        new_complete: u32,
        /// The whole batch at the transmit tail is ready to push.
        batch_done: bool,
    },
}

/// Walk the committed prefix of the current batch.
///
/// Starts at the completion tail, skips the batch-header unit when the scan
/// begins at the transmit tail, and stops at the first slot still marked
/// pending. The file service publishes results with release ordering; the
/// acquire load here pairs with it.
pub fn scan_completions(staging: &DmaRegion, tails: &ResponseTails) -> ScanOutcome {
    let cap = RESPONSE_RING_USED;
    let mut cursor = tails.complete;
    let base = tails.transmit;

    if tails.parse == cursor {
        return ScanOutcome::Idle;
    }

    let mut total_bytes = [0u8; 4];
    staging.read_at(base as usize, &mut total_bytes);
    let batch_total = u32::from_le_bytes(total_bytes);

    if cursor == base {
        cursor = ring_advance(cursor, RESPONSE_UNIT_BYTES, cap);
    }

    while ring_distance(cursor, base, cap) != batch_total {
        let mut len_bytes = [0u8; 4];
        staging.read_at(cursor as usize, &mut len_bytes);
        let slot_len = u32::from_le_bytes(len_bytes);
        debug_assert!(slot_len != 0, "zero-length response slot");
        if slot_len == 0 {
            break;
        }

        let result_off = (cursor + FRAME_LEN_BYTES + ACK_RESULT_OFFSET) as usize;
        let result = u32::from_le(staging.atomic_u32(result_off).load(Ordering::Acquire));
        if result == status::IO_PENDING {
            break;
        }

        cursor = ring_advance(cursor, slot_len, cap);
    }

    if cursor == tails.complete {
        ScanOutcome::Idle
    } else {
        ScanOutcome::Progress {
            new_complete: cursor,
            batch_done: ring_distance(cursor, base, cap) == batch_total,
        }
    }
}

/// The staged range `[transmit, complete)` ready for RDMA write, or `None`.
pub fn transmit_span(tails: &ResponseTails) -> Option<SplitRange> {
    if tails.transmit == tails.complete {
        return None;
    }
    let len = ring_distance(tails.complete, tails.transmit, RESPONSE_RING_USED);
    Some(SplitRange::spanning(tails.transmit, len, RESPONSE_RING_USED))
}

/// Whether the host has consumed far enough for `batch_bytes` to be written
/// at the transmit tail.
pub fn host_can_accept(host_head: u32, transmit: u32, batch_bytes: u32) -> bool {
    let cap = RESPONSE_RING_USED;
    let distance = if transmit >= host_head {
        host_head + cap - transmit
    } else {
        host_head - transmit
    };
    distance >= batch_bytes
}

/// One response as seen by the host consumer.
pub struct ResponseView<'a> {
    pub request_id: u64,
    pub result: u32,
    pub bytes_serviced: u32,
    area: &'a DmaRegion,
    payload: SplitRange,
}

impl ResponseView<'_> {
    /// Whether this response carries read payload bytes.
    pub fn has_payload(&self) -> bool {
        self.payload.total() != 0
    }

    /// Copy serviced payload bytes out of the ring; returns the count
    /// copied.
    pub fn copy_payload_to(&self, dst: &mut [u8]) -> usize {
        let len = (self.bytes_serviced as usize).min(dst.len());
        super::ring_read(
            self.area,
            layout::RESP_DATA,
            RESPONSE_RING_USED,
            self.payload.first_off,
            &mut dst[..len],
        );
        len
    }
}

/// Host-side response consumer over the shared DMA area.
pub struct ResponseConsumer<'a> {
    area: &'a DmaRegion,
    cap: u32,
    head: u32,
}

impl<'a> ResponseConsumer<'a> {
    pub fn new(area: &'a DmaRegion) -> Self {
        Self::resume(area, 0)
    }

    /// Rebuild a consumer view at a previously saved head.
    pub fn resume(area: &'a DmaRegion, head: u32) -> Self {
        Self {
            area,
            cap: RESPONSE_RING_USED,
            head,
        }
    }

    /// Transmit tail as last written by the backend.
    fn published_tail(&self) -> u32 {
        self.area.atomic_u32(layout::RESP_TAIL).load(Ordering::Acquire)
    }

    fn read_u32(&self, off: u32) -> u32 {
        let mut bytes = [0u8; 4];
        self.area
            .read_at(layout::RESP_DATA + off as usize, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    /// Consume every complete batch currently visible, invoking `f` per
    /// response in ring order. Returns the number of responses consumed.
    pub fn poll(&mut self, mut f: impl FnMut(ResponseView<'_>)) -> u32 {
        let mut consumed = 0u32;
        let tail = self.published_tail();

        while self.head != tail {
            let batch_total = self.read_u32(self.head);
            let mut off = ring_advance(self.head, RESPONSE_UNIT_BYTES, self.cap);
            let mut walked = RESPONSE_UNIT_BYTES;

            while walked != batch_total {
                let slot_len = self.read_u32(off);
                let mut header_bytes = [0u8; 16];
                self.area.read_at(
                    layout::RESP_DATA + (off + FRAME_LEN_BYTES) as usize,
                    &mut header_bytes,
                );
                let ack = AckFrameHeader::read_from_bytes(&header_bytes)
                    .expect("ack header size");

                let payload = if slot_len > RESPONSE_UNIT_BYTES {
                    SplitRange::spanning(
                        ring_advance(off, RESPONSE_UNIT_BYTES, self.cap),
                        slot_len - RESPONSE_UNIT_BYTES,
                        self.cap,
                    )
                } else {
                    SplitRange::contiguous(0, 0)
                };

                f(ResponseView {
                    request_id: ack.request_id.get(),
                    result: ack.result.get(),
                    bytes_serviced: ack.bytes_serviced.get(),
                    area: self.area,
                    payload,
                });
                consumed += 1;

                walked += slot_len;
                off = ring_advance(off, slot_len, self.cap);
            }

            self.head = ring_advance(self.head, batch_total, self.cap);
        }

        if consumed != 0 {
            self.publish_head();
        }
        consumed
    }

    /// Publish the consumer head: head word first, then its check copy.
    fn publish_head(&self) {
        self.area
            .atomic_u32(layout::RESP_HEAD)
            .store(self.head, Ordering::Release);
        self.area
            .atomic_u32(layout::RESP_HEAD_CHECK)
            .store(self.head, Ordering::Release);
    }

    pub fn head(&self) -> u32 {
        self.head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::RESPONSE_RING_BYTES;

    fn staging() -> DmaRegion {
        DmaRegion::alloc(RESPONSE_RING_BYTES as usize)
    }

    fn set_result(region: &DmaRegion, slot: &ReservedSlot, result: u32, bytes: u32) {
        let off = (slot.slot_off + FRAME_LEN_BYTES) as usize;
        region.write_at(
            off + crate::wire::data::ACK_BYTES_SERVICED_OFFSET as usize,
            &bytes.to_le_bytes(),
        );
        region
            .atomic_u32(off + ACK_RESULT_OFFSET as usize)
            .store(u32::to_le(result), Ordering::Release);
    }

    #[test]
    fn test_reserve_layout_and_alignment() {
        let region = staging();
        let mut tails = ResponseTails::new();
        let mut batch = BatchBuilder::begin(&region, &mut tails).unwrap();

        let w = batch.reserve(1, false, 4096).unwrap();
        assert_eq!(w.slot_len, RESPONSE_UNIT_BYTES);
        assert_eq!(w.slot_off, RESPONSE_UNIT_BYTES);

        let r = batch.reserve(2, true, 1024).unwrap();
        assert_eq!(r.slot_off, 2 * RESPONSE_UNIT_BYTES);
        assert_eq!(r.payload.first_off, 3 * RESPONSE_UNIT_BYTES);
        assert_eq!(r.payload.total(), 1024);

        let (total, count) = batch.finish();
        assert_eq!(count, 2);
        assert_eq!(total % RESPONSE_UNIT_BYTES, 0);
        assert_eq!(tails.parse, total);

        // The batch header slot records the total.
        let mut bytes = [0u8; 4];
        region.read_at(0, &mut bytes);
        assert_eq!(u32::from_le_bytes(bytes), total);
    }

    #[test]
    fn test_scan_stops_at_pending_and_preserves_order() {
        let region = staging();
        let mut tails = ResponseTails::new();
        let mut batch = BatchBuilder::begin(&region, &mut tails).unwrap();
        let a = batch.reserve(1, false, 0).unwrap();
        let b = batch.reserve(2, false, 0).unwrap();
        let c = batch.reserve(3, false, 0).unwrap();
        let (total, _) = batch.finish();

        // Nothing finished yet: the scanner steps over the batch header but
        // stops at the first pending slot.
        match scan_completions(&region, &tails) {
            ScanOutcome::Progress { new_complete, batch_done } => {
                assert_eq!(new_complete, RESPONSE_UNIT_BYTES);
                assert!(!batch_done);
                tails.complete = new_complete;
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        // Completing the *middle* request does not move the tail past the
        // still-pending first one.
        set_result(&region, &b, status::SUCCESS, 0);
        assert_eq!(scan_completions(&region, &tails), ScanOutcome::Idle);

        set_result(&region, &a, status::SUCCESS, 0);
        match scan_completions(&region, &tails) {
            ScanOutcome::Progress { new_complete, batch_done } => {
                assert_eq!(new_complete, c.slot_off);
                assert!(!batch_done);
                tails.complete = new_complete;
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        set_result(&region, &c, status::NOT_FOUND, 0);
        match scan_completions(&region, &tails) {
            ScanOutcome::Progress { new_complete, batch_done } => {
                assert!(batch_done);
                assert_eq!(ring_distance(new_complete, tails.transmit, RESPONSE_RING_USED), total);
                tails.complete = new_complete;
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let span = transmit_span(&tails).unwrap();
        assert_eq!(span.total(), total);
    }

    #[test]
    fn test_exact_fit_succeeds_one_more_fails() {
        let region = staging();
        let mut tails = ResponseTails::new();
        let mut batch = BatchBuilder::begin(&region, &mut tails).unwrap();

        // Drain the free space with one giant read reservation, leaving
        // exactly one write slot free.
        let free_after_header =
            RESPONSE_RING_USED - 2 * RESPONSE_UNIT_BYTES - RESPONSE_UNIT_BYTES;
        let giant_payload = free_after_header - RESPONSE_UNIT_BYTES;
        batch.reserve(1, true, giant_payload).unwrap();

        batch.reserve(2, false, 0).unwrap();
        let err = batch.reserve(3, false, 0).unwrap_err();
        assert!(matches!(err, RingError::ResponseOverflow { .. }));
    }

    #[test]
    fn test_host_can_accept() {
        // Host fully drained: whole capacity available.
        assert!(host_can_accept(0, 0, RESPONSE_RING_USED));
        // Host lagging by everything except one unit.
        assert!(!host_can_accept(
            RESPONSE_UNIT_BYTES,
            0,
            2 * RESPONSE_UNIT_BYTES
        ));
        assert!(host_can_accept(RESPONSE_UNIT_BYTES, 0, RESPONSE_UNIT_BYTES));
    }

    #[test]
    fn test_consumer_round_trip_with_payload() {
        // Backend staging and "host" area are distinct memories; emulate the
        // RDMA write by copying the transmitted span across.
        let region = staging();
        let area = DmaRegion::alloc(crate::constants::DMA_AREA_BYTES);
        let mut tails = ResponseTails::new();

        let mut batch = BatchBuilder::begin(&region, &mut tails).unwrap();
        let w = batch.reserve(10, false, 0).unwrap();
        let r = batch.reserve(11, true, 5).unwrap();
        let (total, _) = batch.finish();

        set_result(&region, &w, status::SUCCESS, 4096);
        let payload = b"hello";
        region.write_at(r.payload.first_off as usize, payload);
        set_result(&region, &r, status::SUCCESS, payload.len() as u32);

        tails.complete = ring_advance(tails.transmit, total, RESPONSE_RING_USED);
        let span = transmit_span(&tails).unwrap();
        let mut bytes = vec![0u8; span.total() as usize];
        super::super::ring_read(&region, 0, RESPONSE_RING_USED, span.first_off, &mut bytes);
        super::super::ring_write(
            &area,
            layout::RESP_DATA,
            RESPONSE_RING_USED,
            span.first_off,
            &bytes,
        );
        tails.transmit = tails.complete;
        area.atomic_u32(layout::RESP_TAIL)
            .store(tails.transmit, Ordering::Release);

        let mut consumer = ResponseConsumer::new(&area);
        let mut seen = Vec::new();
        let count = consumer.poll(|view| {
            let mut buf = vec![0u8; view.bytes_serviced as usize];
            if view.has_payload() {
                view.copy_payload_to(&mut buf);
            }
            seen.push((view.request_id, view.result, buf));
        });

        assert_eq!(count, 2);
        assert_eq!(seen[0].0, 10);
        assert_eq!(seen[0].1, status::SUCCESS);
        assert_eq!(seen[1].0, 11);
        assert_eq!(seen[1].2, payload.to_vec());

        // Consumer published its head for the backend to poll.
        assert_eq!(
            area.atomic_u32(layout::RESP_HEAD).load(Ordering::Acquire),
            consumer.head()
        );
        assert_eq!(
            area.atomic_u32(layout::RESP_HEAD_CHECK)
                .load(Ordering::Acquire),
            consumer.head()
        );
    }
}
