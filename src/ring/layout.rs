//! Layout of the shared DMA area.
//!
//! The host allocates one DMA area per buffer session and registers it for
//! remote access; the backend addresses everything in it by offset from the
//! base address it learns in the buffer handshake.
//!
//! The first page holds the published metadata words. Each published cursor
//! that the peer polls by RDMA read is stored twice, on two separate cache
//! lines; a reader that sees the two copies disagree caught the writer
//! mid-update and re-polls (torn-read detection). Cursors written by RDMA
//! from the peer are single words.

use crate::constants::{
    CACHE_LINE_BYTES, REQUEST_RING_BYTES, RESPONSE_RING_BYTES, RING_DATA_OFFSET,
};

/// Request ring tail, published by the host producer.
pub const REQ_TAIL: usize = 0;
/// Second copy of the request tail for torn-read detection.
pub const REQ_TAIL_CHECK: usize = CACHE_LINE_BYTES;
/// Request ring head, written remotely by the backend as it claims bytes.
pub const REQ_HEAD: usize = 2 * CACHE_LINE_BYTES;
/// Response ring head, published by the host consumer.
pub const RESP_HEAD: usize = 3 * CACHE_LINE_BYTES;
/// Second copy of the response head for torn-read detection.
pub const RESP_HEAD_CHECK: usize = 4 * CACHE_LINE_BYTES;
/// Response ring transmit tail, written remotely by the backend.
pub const RESP_TAIL: usize = 5 * CACHE_LINE_BYTES;

/// Bytes of metadata the backend fetches when polling the request ring:
/// the tail word and its check copy.
pub const REQ_META_SPAN: usize = 2 * CACHE_LINE_BYTES;

/// Bytes of metadata the backend fetches when polling the response ring:
/// the head word and its check copy.
pub const RESP_META_SPAN: usize = 2 * CACHE_LINE_BYTES;

/// Offset of the request ring data region.
pub const REQ_DATA: usize = RING_DATA_OFFSET;

/// Offset of the response ring data region.
pub const RESP_DATA: usize = RING_DATA_OFFSET + REQUEST_RING_BYTES as usize;

const _: () = assert!(RESP_TAIL + CACHE_LINE_BYTES <= RING_DATA_OFFSET);
const _: () = assert!(RESP_DATA + RESPONSE_RING_BYTES as usize <= crate::constants::DMA_AREA_BYTES);
