//! Typed control message payloads.
//!
//! One struct per request/ack in the control table. Requests that only need
//! a status code back share [`AckResult`]; acks carrying data get their own
//! type. Names travel in fixed NUL-padded fields so every message has a
//! fixed size.

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::ProtocolError;
use crate::constants::{CTRL_MSG_SIZE, MAX_NAME_LEN};

/// Fixed-size NUL-padded name field.
pub type NameBytes = [u8; MAX_NAME_LEN];

/// Pack a name into a fixed wire field.
pub fn pack_name(name: &str) -> Result<NameBytes, ProtocolError> {
    let bytes = name.as_bytes();
    if bytes.len() > MAX_NAME_LEN {
        return Err(ProtocolError::NameTooLong { max: MAX_NAME_LEN });
    }
    let mut field = [0u8; MAX_NAME_LEN];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

/// Read a name back out of a fixed wire field.
pub fn unpack_name(field: &NameBytes) -> Result<&str, ProtocolError> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
    std::str::from_utf8(&field[..end]).map_err(|_| ProtocolError::BadName)
}

/// Ack carrying only a status code.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct AckResult {
    pub result: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct CtrlRespondClientId {
    pub client_id: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct CtrlTerminate {
    pub client_id: U32,
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ReqCreateDir {
    pub dir_id: U32,
    pub parent_id: U32,
    pub name: NameBytes,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ReqRemoveDir {
    pub dir_id: U32,
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ReqCreateFile {
    pub file_id: U32,
    pub dir_id: U32,
    pub attributes: U32,
    pub name: NameBytes,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ReqDeleteFile {
    pub file_id: U32,
    pub dir_id: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ReqChangeFileSize {
    pub file_id: U32,
    pub new_size: U64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ReqGetFileSize {
    pub file_id: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct AckGetFileSize {
    pub result: U32,
    pub file_size: U64,
}

/// File properties reported by `GetFileInfo`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct FileProperties {
    pub attributes: U32,
    pub file_size: U64,
    pub creation_time: U64,
    pub last_access_time: U64,
    pub last_write_time: U64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ReqGetFileInfo {
    pub file_id: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct AckGetFileInfo {
    pub result: U32,
    pub properties: FileProperties,
}

/// Attribute query addressed by file id, like the rest of the control
/// table. There is no path-addressed variant on this wire.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ReqGetFileAttr {
    pub file_id: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct AckGetFileAttr {
    pub result: U32,
    pub attributes: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ReqGetFreeSpace {
    pub reserved: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct AckGetFreeSpace {
    pub result: U32,
    pub free_bytes: U64,
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ReqMoveFile {
    pub file_id: U32,
    pub new_name: NameBytes,
}

/// Buffer-channel handshake: bind this ring transport session to a client
/// and hand the backend the DMA area it will address remotely.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct BuffRequestId {
    pub client_id: U32,
    pub base_addr: U64,
    pub access_token: U32,
    pub capacity: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct BuffRespondId {
    pub buffer_id: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct BuffRelease {
    pub client_id: U32,
    pub buffer_id: U32,
}

// Every payload must fit a control message buffer alongside the header.
const _: () = assert!(std::mem::size_of::<ReqCreateFile>() + 2 <= CTRL_MSG_SIZE);
const _: () = assert!(std::mem::size_of::<ReqCreateDir>() + 2 <= CTRL_MSG_SIZE);
const _: () = assert!(std::mem::size_of::<ReqMoveFile>() + 2 <= CTRL_MSG_SIZE);
const _: () = assert!(std::mem::size_of::<AckGetFileInfo>() + 2 <= CTRL_MSG_SIZE);
const _: () = assert!(std::mem::size_of::<BuffRequestId>() + 2 <= CTRL_MSG_SIZE);

impl std::fmt::Debug for ReqCreateDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqCreateDir")
            .field("dir_id", &self.dir_id.get())
            .field("parent_id", &self.parent_id.get())
            .field("name", &unpack_name(&self.name).unwrap_or("<invalid>"))
            .finish()
    }
}

impl std::fmt::Debug for ReqCreateFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqCreateFile")
            .field("file_id", &self.file_id.get())
            .field("dir_id", &self.dir_id.get())
            .field("attributes", &self.attributes.get())
            .field("name", &unpack_name(&self.name).unwrap_or("<invalid>"))
            .finish()
    }
}

impl std::fmt::Debug for ReqMoveFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqMoveFile")
            .field("file_id", &self.file_id.get())
            .field("new_name", &unpack_name(&self.new_name).unwrap_or("<invalid>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_name() {
        let field = pack_name("/data/results.bin").unwrap();
        assert_eq!(unpack_name(&field).unwrap(), "/data/results.bin");

        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(pack_name(&long).is_err());

        // Exactly max length, no NUL terminator
        let exact = "y".repeat(MAX_NAME_LEN);
        let field = pack_name(&exact).unwrap();
        assert_eq!(unpack_name(&field).unwrap(), exact);
    }

    #[test]
    fn test_payload_sizes_are_stable() {
        assert_eq!(std::mem::size_of::<AckResult>(), 4);
        assert_eq!(std::mem::size_of::<CtrlRespondClientId>(), 4);
        assert_eq!(std::mem::size_of::<ReqChangeFileSize>(), 12);
        assert_eq!(std::mem::size_of::<AckGetFileSize>(), 12);
        assert_eq!(std::mem::size_of::<FileProperties>(), 36);
        assert_eq!(std::mem::size_of::<AckGetFileInfo>(), 40);
        assert_eq!(std::mem::size_of::<BuffRequestId>(), 20);
        assert_eq!(std::mem::size_of::<ReqCreateFile>(), 12 + MAX_NAME_LEN);
    }
}
