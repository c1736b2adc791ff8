//! Request ring: host-side producer and backend-side batch parser.
//!
//! The host appends length-prefixed frames at its tail and publishes the
//! tail (plus its check copy) for the backend to poll. The backend fetches
//! the region `[head, tail)` into a local mirror by RDMA read and parses it
//! here. Frames may wrap the ring boundary at any byte; the parser and the
//! producer are both wrap-aware.

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, IntoBytes};

use super::layout;
use super::{ring_advance, ring_distance, ring_read, ring_write, DmaRegion, RingError, SplitRange};
use crate::constants::REQUEST_RING_BYTES;
use crate::wire::data::{ReqFrameHeader, FRAME_LEN_BYTES, READ_FRAME_BYTES, REQ_FRAME_HEADER_BYTES};
use std::sync::atomic::Ordering;

/// One request recovered from a fetched batch.
#[derive(Debug, Clone, Copy)]
pub struct ParsedRequest {
    pub header: ReqFrameHeader,
    pub is_read: bool,
    /// Write payload location in the request ring; `None` for reads.
    pub payload: Option<SplitRange>,
}

/// Parse `total` bytes of frames starting at `head` in the ring mirror.
///
/// The mirror holds ring data only (base offset 0) at the same offsets as
/// the remote ring, so ranges computed here address both identically.
pub fn parse_batch(
    mirror: &DmaRegion,
    cap: u32,
    head: u32,
    total: u32,
) -> Result<Vec<ParsedRequest>, RingError> {
    let mut out = Vec::new();
    let mut parsed = 0u32;
    let mut off = head;

    while parsed != total {
        if total - parsed < READ_FRAME_BYTES {
            return Err(RingError::MalformedFrame { offset: off });
        }

        let mut len_bytes = [0u8; FRAME_LEN_BYTES as usize];
        ring_read(mirror, 0, cap, off, &mut len_bytes);
        let frame_len = u32::from_le_bytes(len_bytes);
        if frame_len < READ_FRAME_BYTES || frame_len > total - parsed {
            return Err(RingError::MalformedFrame { offset: off });
        }

        let mut header_bytes = [0u8; REQ_FRAME_HEADER_BYTES as usize];
        ring_read(
            mirror,
            0,
            cap,
            ring_advance(off, FRAME_LEN_BYTES, cap),
            &mut header_bytes,
        );
        let header = ReqFrameHeader::read_from_bytes(&header_bytes)
            .map_err(|_| RingError::MalformedFrame { offset: off })?;

        let is_read = frame_len == READ_FRAME_BYTES;
        let payload = if is_read {
            None
        } else {
            if frame_len - READ_FRAME_BYTES != header.bytes.get() {
                return Err(RingError::MalformedFrame { offset: off });
            }
            Some(SplitRange::spanning(
                ring_advance(off, READ_FRAME_BYTES, cap),
                header.bytes.get(),
                cap,
            ))
        };

        out.push(ParsedRequest {
            header,
            is_read,
            payload,
        });
        parsed += frame_len;
        off = ring_advance(off, frame_len, cap);
    }

    Ok(out)
}

/// Byte range of the request ring to fetch given the polled tail.
///
/// Returns `None` when the ring is empty. A wrapped range is fetched by two
/// RDMA reads.
pub fn fetch_span(head: u32, tail: u32, cap: u32) -> Option<SplitRange> {
    if head == tail {
        return None;
    }
    Some(SplitRange::spanning(
        head,
        ring_distance(tail, head, cap),
        cap,
    ))
}

/// Host-side request producer over the shared DMA area.
///
/// Frames accumulate locally between [`publish`](Self::publish) calls, so a
/// burst of requests becomes a single producer publish that the backend
/// parses as one batch.
pub struct RequestProducer<'a> {
    area: &'a DmaRegion,
    cap: u32,
    tail: u32,
}

impl<'a> RequestProducer<'a> {
    pub fn new(area: &'a DmaRegion) -> Self {
        Self::resume(area, 0)
    }

    /// Rebuild a producer view at a previously saved tail.
    pub fn resume(area: &'a DmaRegion, tail: u32) -> Self {
        Self {
            area,
            cap: REQUEST_RING_BYTES,
            tail,
        }
    }

    /// Consumed head as last written back by the backend.
    fn head(&self) -> u32 {
        self.area.atomic_u32(layout::REQ_HEAD).load(Ordering::Acquire)
    }

    /// Bytes available for new frames.
    ///
    /// One byte of slack distinguishes a full ring from an empty one.
    pub fn free_bytes(&self) -> u32 {
        self.cap - 1 - ring_distance(self.tail, self.head(), self.cap)
    }

    fn push_frame(&mut self, header: &ReqFrameHeader, payload: &[u8]) -> Result<(), RingError> {
        let frame_len = READ_FRAME_BYTES + payload.len() as u32;
        if frame_len > self.cap - 1 {
            return Err(RingError::OversizedRequest {
                bytes: payload.len() as u32,
            });
        }
        let free = self.free_bytes();
        if frame_len > free {
            return Err(RingError::Full {
                need: frame_len,
                free,
            });
        }

        let base = layout::REQ_DATA;
        ring_write(self.area, base, self.cap, self.tail, &frame_len.to_le_bytes());
        ring_write(
            self.area,
            base,
            self.cap,
            ring_advance(self.tail, FRAME_LEN_BYTES, self.cap),
            header.as_bytes(),
        );
        if !payload.is_empty() {
            ring_write(
                self.area,
                base,
                self.cap,
                ring_advance(self.tail, READ_FRAME_BYTES, self.cap),
                payload,
            );
        }
        self.tail = ring_advance(self.tail, frame_len, self.cap);
        Ok(())
    }

    /// Append a read request frame.
    pub fn push_read(
        &mut self,
        request_id: u64,
        file_id: u32,
        offset: u64,
        bytes: u32,
    ) -> Result<(), RingError> {
        let header = ReqFrameHeader {
            request_id: U64::new(request_id),
            file_id: U32::new(file_id),
            offset: U64::new(offset),
            bytes: U32::new(bytes),
            flags: U32::new(0),
        };
        self.push_frame(&header, &[])
    }

    /// Append a write request frame carrying `payload`.
    pub fn push_write(
        &mut self,
        request_id: u64,
        file_id: u32,
        offset: u64,
        payload: &[u8],
    ) -> Result<(), RingError> {
        let header = ReqFrameHeader {
            request_id: U64::new(request_id),
            file_id: U32::new(file_id),
            offset: U64::new(offset),
            bytes: U32::new(payload.len() as u32),
            flags: U32::new(0),
        };
        self.push_frame(&header, payload)
    }

    /// Publish the tail to the backend: the tail word first, then its check
    /// copy. A remote read that lands between the two stores sees them
    /// disagree and re-polls.
    pub fn publish(&self) {
        self.area
            .atomic_u32(layout::REQ_TAIL)
            .store(self.tail, Ordering::Release);
        self.area
            .atomic_u32(layout::REQ_TAIL_CHECK)
            .store(self.tail, Ordering::Release);
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DMA_AREA_BYTES;

    fn mirror_from_area(area: &DmaRegion) -> DmaRegion {
        let cap = REQUEST_RING_BYTES as usize;
        let mirror = DmaRegion::alloc(cap);
        let mut buf = vec![0u8; cap];
        area.read_at(layout::REQ_DATA, &mut buf);
        mirror.write_at(0, &buf);
        mirror
    }

    #[test]
    fn test_produce_parse_round_trip() {
        let area = DmaRegion::alloc(DMA_AREA_BYTES);
        let mut producer = RequestProducer::new(&area);

        producer.push_write(1, 7, 0, &[0xAB; 1024]).unwrap();
        producer.push_read(2, 7, 0, 1024).unwrap();
        producer.push_write(3, 9, 4096, &[0xCD; 2048]).unwrap();
        producer.push_read(4, 9, 4096, 512).unwrap();
        producer.publish();

        let tail = area.atomic_u32(layout::REQ_TAIL).load(Ordering::Acquire);
        let check = area
            .atomic_u32(layout::REQ_TAIL_CHECK)
            .load(Ordering::Acquire);
        assert_eq!(tail, check);

        let mirror = mirror_from_area(&area);
        let span = fetch_span(0, tail, REQUEST_RING_BYTES).unwrap();
        let batch = parse_batch(&mirror, REQUEST_RING_BYTES, 0, span.total()).unwrap();

        assert_eq!(batch.len(), 4);
        assert_eq!(batch[0].header.request_id.get(), 1);
        assert!(!batch[0].is_read);
        assert_eq!(batch[0].payload.unwrap().total(), 1024);
        assert_eq!(batch[1].header.request_id.get(), 2);
        assert!(batch[1].is_read);
        assert_eq!(batch[1].header.bytes.get(), 1024);
        assert_eq!(batch[2].header.offset.get(), 4096);
        assert_eq!(batch[3].header.bytes.get(), 512);
    }

    #[test]
    fn test_frame_spanning_wrap_parses_identically() {
        let cap = REQUEST_RING_BYTES;
        let area = DmaRegion::alloc(DMA_AREA_BYTES);
        let mut producer = RequestProducer::new(&area);

        // Walk the tail close to the boundary so the next frame wraps.
        let filler = vec![0u8; 4000];
        let mut pushed = 0u32;
        while cap - producer.tail() > 8192 {
            producer.push_write(100 + pushed as u64, 1, 0, &filler).unwrap();
            pushed += 1;
        }
        // Pretend the backend consumed everything so far.
        area.atomic_u32(layout::REQ_HEAD)
            .store(producer.tail(), Ordering::Release);
        let head = producer.tail();

        let payload: Vec<u8> = (0..16384u32).map(|i| i as u8).collect();
        producer.push_write(777, 3, 128, &payload).unwrap();
        producer.publish();

        let mirror = mirror_from_area(&area);
        let tail = producer.tail();
        let span = fetch_span(head, tail, cap).unwrap();
        assert!(span.is_split());

        let batch = parse_batch(&mirror, cap, head, span.total()).unwrap();
        assert_eq!(batch.len(), 1);
        let req = &batch[0];
        assert_eq!(req.header.request_id.get(), 777);
        assert_eq!(req.header.bytes.get(), 16384);

        // The payload range round-trips through the wrap.
        let range = req.payload.unwrap();
        let mut got = vec![0u8; range.total() as usize];
        ring_read(&mirror, 0, cap, range.first_off, &mut got);
        assert_eq!(got, payload);
    }

    #[test]
    fn test_producer_full() {
        let area = DmaRegion::alloc(DMA_AREA_BYTES);
        let mut producer = RequestProducer::new(&area);

        let big = vec![0u8; (REQUEST_RING_BYTES / 2) as usize];
        producer.push_write(1, 1, 0, &big).unwrap();
        let err = producer.push_write(2, 1, 0, &big).unwrap_err();
        assert!(matches!(err, RingError::Full { .. }));

        let huge = vec![0u8; REQUEST_RING_BYTES as usize];
        assert!(matches!(
            RequestProducer::new(&area).push_write(3, 1, 0, &huge),
            Err(RingError::OversizedRequest { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let mirror = DmaRegion::alloc(REQUEST_RING_BYTES as usize);
        // A zero length field can never be a frame.
        assert!(parse_batch(&mirror, REQUEST_RING_BYTES, 0, 64).is_err());
    }

    #[test]
    fn test_fetch_span_empty() {
        assert!(fetch_span(42, 42, REQUEST_RING_BYTES).is_none());
    }
}
