//! Wire protocol definitions for host/backend communication.
//!
//! Everything that crosses the wire is little-endian and fixed-size:
//! control messages are a [`MsgHeader`] followed by one typed payload
//! (no length prefix; the size is implied by the message id), and the
//! data-plane rings carry length-prefixed frames defined in [`data`].

pub mod control;
pub mod data;

use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Operation status codes carried in acks and response frames.
///
/// The first field of every ack payload is one of these; the completion
/// scanners key off [`status::IO_PENDING`] to detect unfinished operations.
pub mod status {
    pub const SUCCESS: u32 = 0;
    /// Operation submitted to the file service but not yet complete.
    pub const IO_PENDING: u32 = 1;
    pub const NOT_FOUND: u32 = 2;
    pub const ALREADY_EXISTS: u32 = 3;
    pub const DIR_NOT_EMPTY: u32 = 4;
    pub const INVALID_ARGUMENT: u32 = 5;
    pub const OUT_OF_SPACE: u32 = 6;
    pub const IO_FAILURE: u32 = 7;
}

/// Typed control message ids.
///
/// Requests originate on the host; acks originate on the backend. The
/// buffer-channel trio at the end binds a ring transport session to a
/// control session.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgId {
    /// Not a valid message (zeroed buffer)
    Invalid = 0,
    RequestClientId = 1,
    RespondClientId = 2,
    Terminate = 3,
    ReqCreateDir = 4,
    AckCreateDir = 5,
    ReqRemoveDir = 6,
    AckRemoveDir = 7,
    ReqCreateFile = 8,
    AckCreateFile = 9,
    ReqDeleteFile = 10,
    AckDeleteFile = 11,
    ReqChangeFileSize = 12,
    AckChangeFileSize = 13,
    ReqGetFileSize = 14,
    AckGetFileSize = 15,
    ReqGetFileInfo = 16,
    AckGetFileInfo = 17,
    ReqGetFileAttr = 18,
    AckGetFileAttr = 19,
    ReqGetFreeSpace = 20,
    AckGetFreeSpace = 21,
    ReqMoveFile = 22,
    AckMoveFile = 23,
    RequestBufferId = 24,
    RespondBufferId = 25,
    ReleaseBuffer = 26,
}

impl From<u16> for MsgId {
    fn from(v: u16) -> Self {
        match v {
            1 => MsgId::RequestClientId,
            2 => MsgId::RespondClientId,
            3 => MsgId::Terminate,
            4 => MsgId::ReqCreateDir,
            5 => MsgId::AckCreateDir,
            6 => MsgId::ReqRemoveDir,
            7 => MsgId::AckRemoveDir,
            8 => MsgId::ReqCreateFile,
            9 => MsgId::AckCreateFile,
            10 => MsgId::ReqDeleteFile,
            11 => MsgId::AckDeleteFile,
            12 => MsgId::ReqChangeFileSize,
            13 => MsgId::AckChangeFileSize,
            14 => MsgId::ReqGetFileSize,
            15 => MsgId::AckGetFileSize,
            16 => MsgId::ReqGetFileInfo,
            17 => MsgId::AckGetFileInfo,
            18 => MsgId::ReqGetFileAttr,
            19 => MsgId::AckGetFileAttr,
            20 => MsgId::ReqGetFreeSpace,
            21 => MsgId::AckGetFreeSpace,
            22 => MsgId::ReqMoveFile,
            23 => MsgId::AckMoveFile,
            24 => MsgId::RequestBufferId,
            25 => MsgId::RespondBufferId,
            26 => MsgId::ReleaseBuffer,
            _ => MsgId::Invalid,
        }
    }
}

/// Header preceding every control message payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct MsgHeader {
    pub msg_id: U16,
}

pub const MSG_HEADER_BYTES: usize = std::mem::size_of::<MsgHeader>();

/// Errors raised while encoding or decoding protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unrecognized message id {0}")]
    UnknownMsgId(u16),

    #[error("message truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("name longer than {max} bytes")]
    NameTooLong { max: usize },

    #[error("name is not valid UTF-8")]
    BadName,

    #[error("mismatched client id: expected {expected}, got {got}")]
    MismatchedClientId { expected: u32, got: u32 },

    #[error("unexpected message id {got:?}, expected {expected:?}")]
    UnexpectedMessage { expected: MsgId, got: MsgId },
}

/// Encode a control message into `buf`, returning the encoded length.
pub fn encode_msg<P>(buf: &mut [u8], id: MsgId, payload: &P) -> Result<usize, ProtocolError>
where
    P: IntoBytes + Immutable,
{
    let need = MSG_HEADER_BYTES + std::mem::size_of::<P>();
    if buf.len() < need {
        return Err(ProtocolError::BufferTooSmall {
            need,
            have: buf.len(),
        });
    }

    let header = MsgHeader {
        msg_id: U16::new(id as u16),
    };
    buf[..MSG_HEADER_BYTES].copy_from_slice(header.as_bytes());
    buf[MSG_HEADER_BYTES..need].copy_from_slice(payload.as_bytes());

    Ok(need)
}

/// Encode a payload-less control message into `buf`.
pub fn encode_bare(buf: &mut [u8], id: MsgId) -> Result<usize, ProtocolError> {
    if buf.len() < MSG_HEADER_BYTES {
        return Err(ProtocolError::BufferTooSmall {
            need: MSG_HEADER_BYTES,
            have: buf.len(),
        });
    }
    let header = MsgHeader {
        msg_id: U16::new(id as u16),
    };
    buf[..MSG_HEADER_BYTES].copy_from_slice(header.as_bytes());
    Ok(MSG_HEADER_BYTES)
}

/// Read the message id out of a control message buffer.
pub fn peek_msg_id(buf: &[u8]) -> Result<MsgId, ProtocolError> {
    let (header, _) =
        MsgHeader::read_from_prefix(buf).map_err(|_| ProtocolError::Truncated {
            need: MSG_HEADER_BYTES,
            have: buf.len(),
        })?;
    Ok(MsgId::from(header.msg_id.get()))
}

/// Decode the typed payload following the message header.
pub fn decode_payload<P>(buf: &[u8]) -> Result<P, ProtocolError>
where
    P: FromBytes,
{
    let body = buf.get(MSG_HEADER_BYTES..).ok_or(ProtocolError::Truncated {
        need: MSG_HEADER_BYTES,
        have: buf.len(),
    })?;
    let (payload, _) = P::read_from_prefix(body).map_err(|_| ProtocolError::Truncated {
        need: MSG_HEADER_BYTES + std::mem::size_of::<P>(),
        have: buf.len(),
    })?;
    Ok(payload)
}

/// Decode a payload after checking the buffer carries the expected id.
pub fn decode_expected<P>(buf: &[u8], expected: MsgId) -> Result<P, ProtocolError>
where
    P: FromBytes,
{
    let got = peek_msg_id(buf)?;
    if got != expected {
        return Err(ProtocolError::UnexpectedMessage { expected, got });
    }
    decode_payload(buf)
}

#[cfg(test)]
mod tests {
    use super::control::CtrlRespondClientId;
    use super::*;
    use crate::constants::CTRL_MSG_SIZE;
    use zerocopy::byteorder::little_endian::U32;

    #[test]
    fn test_msg_id_round_trip() {
        for raw in 0..32u16 {
            let id = MsgId::from(raw);
            if id != MsgId::Invalid {
                assert_eq!(id as u16, raw);
            }
        }
        assert_eq!(MsgId::from(999), MsgId::Invalid);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut buf = [0u8; CTRL_MSG_SIZE];
        let payload = CtrlRespondClientId {
            client_id: U32::new(7),
        };
        let len = encode_msg(&mut buf, MsgId::RespondClientId, &payload).unwrap();
        assert_eq!(len, MSG_HEADER_BYTES + std::mem::size_of::<CtrlRespondClientId>());

        assert_eq!(peek_msg_id(&buf).unwrap(), MsgId::RespondClientId);
        let decoded: CtrlRespondClientId =
            decode_expected(&buf, MsgId::RespondClientId).unwrap();
        assert_eq!(decoded.client_id.get(), 7);
    }

    #[test]
    fn test_decode_wrong_id() {
        let mut buf = [0u8; CTRL_MSG_SIZE];
        let payload = CtrlRespondClientId {
            client_id: U32::new(1),
        };
        encode_msg(&mut buf, MsgId::RespondClientId, &payload).unwrap();

        let err = decode_expected::<CtrlRespondClientId>(&buf, MsgId::AckCreateDir).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedMessage { .. }));
    }

    #[test]
    fn test_encode_too_small() {
        let mut buf = [0u8; 2];
        let payload = CtrlRespondClientId {
            client_id: U32::new(1),
        };
        let err = encode_msg(&mut buf, MsgId::RespondClientId, &payload).unwrap_err();
        assert!(matches!(err, ProtocolError::BufferTooSmall { .. }));
    }
}
