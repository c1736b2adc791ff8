//! Global constants for dpufs
//!
//! This module centralizes the sizing of the wire protocol, the shared ring
//! buffers, and the backend queues so host and backend always agree.

/// Cache line size assumed for the published ring metadata words.
pub const CACHE_LINE_BYTES: usize = 64;

/// Size of every control message buffer (header + largest typed payload).
pub const CTRL_MSG_SIZE: usize = 256;

/// Maximum length of a file or directory name on the control wire.
///
/// Names are carried inline in fixed-size fields so control messages keep a
/// fixed size per message id.
pub const MAX_NAME_LEN: usize = 224;

/// Capacity of the request ring data region in bytes. Power of two.
pub const REQUEST_RING_BYTES: u32 = 1 << 20;

/// Size of the response ring data region in bytes. Power of two.
pub const RESPONSE_RING_BYTES: u32 = 1 << 20;

/// Usable capacity of the response ring.
///
/// Response slots are multiples of the 20-byte response unit; truncating the
/// region to a unit multiple keeps every slot header contiguous (only
/// payloads ever wrap).
pub const RESPONSE_RING_USED: u32 =
    RESPONSE_RING_BYTES - (RESPONSE_RING_BYTES % crate::wire::data::RESPONSE_UNIT_BYTES);

/// Offset of the ring data regions inside the shared DMA area.
///
/// The first page holds the published metadata words; see
/// [`crate::ring::layout`].
pub const RING_DATA_OFFSET: usize = 4096;

/// Total size of the shared DMA area a host allocates per buffer session.
pub const DMA_AREA_BYTES: usize =
    RING_DATA_OFFSET + REQUEST_RING_BYTES as usize + RESPONSE_RING_BYTES as usize;

/// Maximum number of in-flight data-plane requests per buffer session.
///
/// Enforced on the host side; the backend's per-session context ring is
/// sized to it.
pub const MAX_OUTSTANDING_IO: usize = 1024;

/// Receives the host pre-posts on the buffer channel for completion
/// notifications (write-with-immediate mode).
pub const MAX_COMPLETION_BUFFERING: usize = 16;

/// Control-plane progress is sampled once every `DATA_PLANE_WEIGHT`
/// iterations of the backend event loop.
pub const DATA_PLANE_WEIGHT: u32 = 16;

/// Send/recv queue depth for control connections.
pub const CTRL_QUEUE_DEPTH: u32 = 16;

/// Send/recv queue depth for buffer connections.
///
/// Sized to keep every WR of a full data-plane round (metadata poll, split
/// fetch, head write-back, response writes) outstanding without a doorbell
/// stall.
pub const BUFF_QUEUE_DEPTH: u32 = 256;

/// Address/route resolution timeout handed to the connection manager.
pub const RESOLVE_TIMEOUT_MS: i32 = 2000;

/// Backlog for the backend CM listener.
pub const LISTEN_BACKLOG: i32 = 64;

/// Number of packed cache items read per chunk when preloading the metadata
/// cache from a file.
pub const CACHE_PRELOAD_CHUNK_ITEMS: usize = 1000;

/// Entries per cuckoo cache bucket.
pub const CACHE_BUCKET_SIZE: usize = 8;

const _: () = assert!(REQUEST_RING_BYTES.is_power_of_two());
const _: () = assert!(RESPONSE_RING_BYTES.is_power_of_two());
const _: () = assert!(RING_DATA_OFFSET % CACHE_LINE_BYTES == 0);
