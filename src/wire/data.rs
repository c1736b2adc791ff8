//! Data-plane frame formats for the request and response rings.
//!
//! Request ring frames (host → backend):
//!
//! ```text
//! u32 length            frame length in bytes, including this field
//! ReqFrameHeader        request id, file id, offset, byte count, flags
//! [payload]             present iff the request is a write
//! ```
//!
//! Response ring frames (backend → host) are symmetric with an
//! [`AckFrameHeader`] and carry payload iff the request was a read. Every
//! response is padded to a multiple of [`RESPONSE_UNIT_BYTES`]; a batch of
//! responses is preceded by one unit-sized slot whose first u32 holds the
//! batch's total size.

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Header of a request ring frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ReqFrameHeader {
    pub request_id: U64,
    pub file_id: U32,
    pub offset: U64,
    pub bytes: U32,
    pub flags: U32,
}

/// Header of a response ring frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct AckFrameHeader {
    pub request_id: U64,
    pub result: U32,
    pub bytes_serviced: U32,
}

/// Size of the u32 length prefix on every frame.
pub const FRAME_LEN_BYTES: u32 = std::mem::size_of::<U32>() as u32;

pub const REQ_FRAME_HEADER_BYTES: u32 = std::mem::size_of::<ReqFrameHeader>() as u32;
pub const ACK_FRAME_HEADER_BYTES: u32 = std::mem::size_of::<AckFrameHeader>() as u32;

/// A read request is exactly a length prefix plus a header.
pub const READ_FRAME_BYTES: u32 = FRAME_LEN_BYTES + REQ_FRAME_HEADER_BYTES;

/// Response slot granularity: length prefix plus ack header. Response sizes
/// are rounded up to a multiple of this so the completion scanner can walk
/// slot boundaries without re-parsing payloads.
pub const RESPONSE_UNIT_BYTES: u32 = FRAME_LEN_BYTES + ACK_FRAME_HEADER_BYTES;

/// Byte offset of `result` inside an [`AckFrameHeader`].
///
/// The completion scanner and the file service address this field directly
/// in the staged response ring; it must stay 4-byte aligned relative to the
/// unit-aligned slot start.
pub const ACK_RESULT_OFFSET: u32 = 8;

/// Byte offset of `bytes_serviced` inside an [`AckFrameHeader`].
pub const ACK_BYTES_SERVICED_OFFSET: u32 = 12;

/// Size of the response slot reserved for a request.
///
/// Writes ack with a bare header; reads additionally carry `bytes` of
/// payload, rounded up to the slot unit.
pub fn response_slot_bytes(is_read: bool, bytes: u32) -> u32 {
    if !is_read {
        return RESPONSE_UNIT_BYTES;
    }
    let raw = RESPONSE_UNIT_BYTES + bytes;
    match raw % RESPONSE_UNIT_BYTES {
        0 => raw,
        rem => raw + (RESPONSE_UNIT_BYTES - rem),
    }
}

const _: () = assert!(REQ_FRAME_HEADER_BYTES == 28);
const _: () = assert!(ACK_FRAME_HEADER_BYTES == 16);
const _: () = assert!(RESPONSE_UNIT_BYTES == 20);
// Unit-aligned slots keep the result word 4-byte aligned for atomic access.
const _: () = assert!(RESPONSE_UNIT_BYTES % 4 == 0);
const _: () = assert!((FRAME_LEN_BYTES + ACK_RESULT_OFFSET) % 4 == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_frame_size() {
        assert_eq!(READ_FRAME_BYTES, 32);
    }

    #[test]
    fn test_response_slot_rounding() {
        // Writes always take one unit.
        assert_eq!(response_slot_bytes(false, 4096), RESPONSE_UNIT_BYTES);

        // Reads round payload up to the unit.
        assert_eq!(response_slot_bytes(true, 0), RESPONSE_UNIT_BYTES);
        assert_eq!(response_slot_bytes(true, 20), 2 * RESPONSE_UNIT_BYTES);
        assert_eq!(response_slot_bytes(true, 21), RESPONSE_UNIT_BYTES + 40);
        assert_eq!(response_slot_bytes(true, 4096), {
            let raw = RESPONSE_UNIT_BYTES + 4096;
            raw + (RESPONSE_UNIT_BYTES - raw % RESPONSE_UNIT_BYTES)
        });
    }

    #[test]
    fn test_header_field_offsets() {
        let ack = AckFrameHeader {
            request_id: U64::new(0x1111_2222_3333_4444),
            result: U32::new(0xAABB_CCDD),
            bytes_serviced: U32::new(0x5566_7788),
        };
        let bytes = zerocopy::IntoBytes::as_bytes(&ack);
        assert_eq!(
            &bytes[ACK_RESULT_OFFSET as usize..ACK_RESULT_OFFSET as usize + 4],
            &0xAABB_CCDDu32.to_le_bytes()
        );
        assert_eq!(
            &bytes[ACK_BYTES_SERVICED_OFFSET as usize..],
            &0x5566_7788u32.to_le_bytes()
        );
    }
}
