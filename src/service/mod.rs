//! The file service seam.
//!
//! The transport pipeline never executes storage operations itself: it
//! submits them here and polls for completion by reading status fields.
//! A control operation completes through a shared [`ControlCompletion`]
//! cell; a data operation completes when the service writes the staged ack
//! (and, for reads, the payload) through its [`ResponseSlot`].
//!
//! Both handshakes follow the same discipline: payload first, then the
//! status word published with release ordering, so the event loop's
//! acquire-ordered scanners never observe a completed status with stale
//! payload.

pub mod memfs;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::ring::response::ReservedSlot;
use crate::ring::{DmaRegion, SplitRange};
use crate::wire::control::{
    FileProperties, ReqChangeFileSize, ReqCreateDir, ReqCreateFile, ReqDeleteFile,
    ReqGetFileAttr, ReqGetFileInfo, ReqGetFileSize, ReqGetFreeSpace, ReqMoveFile, ReqRemoveDir,
};
use crate::wire::data::{ACK_BYTES_SERVICED_OFFSET, ACK_RESULT_OFFSET, FRAME_LEN_BYTES};
use crate::wire::status;

/// A typed control-plane operation.
#[derive(Debug)]
pub enum ControlOp {
    CreateDir(ReqCreateDir),
    RemoveDir(ReqRemoveDir),
    CreateFile(ReqCreateFile),
    DeleteFile(ReqDeleteFile),
    ChangeFileSize(ReqChangeFileSize),
    GetFileSize(ReqGetFileSize),
    GetFileInfo(ReqGetFileInfo),
    GetFileAttr(ReqGetFileAttr),
    GetFreeSpace(ReqGetFreeSpace),
    MoveFile(ReqMoveFile),
}

/// Data carried by a completed control operation's ack.
#[derive(Debug, Clone, Copy, Default)]
pub enum ControlAckData {
    #[default]
    None,
    FileSize(u64),
    FileInfo(FileProperties),
    FileAttr(u32),
    FreeSpace(u64),
}

/// Completion cell for one pending control operation.
///
/// The dispatcher keeps one per session (at most one outstanding control
/// operation per session); the service fills it in, possibly from another
/// thread.
pub struct ControlCompletion {
    result: AtomicU32,
    data: Mutex<ControlAckData>,
}

impl ControlCompletion {
    pub fn new() -> Self {
        Self {
            result: AtomicU32::new(status::IO_PENDING),
            data: Mutex::new(ControlAckData::None),
        }
    }

    /// Store the ack payload, then publish the status.
    pub fn complete(&self, result: u32, data: ControlAckData) {
        *self.data.lock().unwrap() = data;
        self.result.store(result, Ordering::Release);
    }

    /// `None` while the operation is pending.
    pub fn poll(&self) -> Option<(u32, ControlAckData)> {
        let result = self.result.load(Ordering::Acquire);
        if result == status::IO_PENDING {
            return None;
        }
        Some((result, *self.data.lock().unwrap()))
    }
}

impl Default for ControlCompletion {
    fn default() -> Self {
        Self::new()
    }
}

/// The fixed fields of one data-plane request, copied out of the wire
/// frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataRequest {
    pub request_id: u64,
    pub file_id: u32,
    pub offset: u64,
    pub bytes: u32,
    pub is_read: bool,
}

/// Read-only view of a write request's payload in the request ring mirror.
#[derive(Debug, Clone)]
pub struct PayloadRef {
    first: *const u8,
    first_len: u32,
    second: *const u8,
    second_len: u32,
    /// Keeps the mirror alive while the service holds the view.
    _mirror: Arc<DmaRegion>,
}

// SAFETY: points into the mirror buffer held alive by `_mirror`; the range
// is not rewritten until every response of the batch is transmitted.
unsafe impl Send for PayloadRef {}

impl PayloadRef {
    pub fn new(mirror: &Arc<DmaRegion>, range: SplitRange) -> Self {
        Self {
            first: mirror.ptr_at(range.first_off as usize),
            first_len: range.first_len,
            second: if range.is_split() {
                mirror.ptr_at(0)
            } else {
                std::ptr::null()
            },
            second_len: range.second_len,
            _mirror: mirror.clone(),
        }
    }

    pub fn len(&self) -> u32 {
        self.first_len + self.second_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the payload out. `dst` must hold [`len`](Self::len) bytes.
    pub fn copy_to(&self, dst: &mut [u8]) {
        assert!(dst.len() >= self.len() as usize);
        // SAFETY: segment pointers/lengths come from a bounds-checked
        // SplitRange over the mirror.
        unsafe {
            std::ptr::copy_nonoverlapping(self.first, dst.as_mut_ptr(), self.first_len as usize);
            if !self.second.is_null() {
                std::ptr::copy_nonoverlapping(
                    self.second,
                    dst.as_mut_ptr().add(self.first_len as usize),
                    self.second_len as usize,
                );
            }
        }
    }
}

/// Handle to one staged response slot: the ack header plus, for reads, the
/// payload destination.
#[derive(Debug)]
pub struct ResponseSlot {
    ack: *mut u8,
    data_first: *mut u8,
    data_first_len: u32,
    data_second: *mut u8,
    data_second_len: u32,
    /// Keeps the staging buffer alive while the service holds the slot.
    _staging: Arc<DmaRegion>,
}

// SAFETY: points into the staging buffer held alive by `_staging`; the
// slot is not reused until its response is transmitted, and the status
// word is only written once, last.
unsafe impl Send for ResponseSlot {}

impl ResponseSlot {
    pub fn new(staging: &Arc<DmaRegion>, slot: &ReservedSlot) -> Self {
        let payload = slot.payload;
        Self {
            ack: staging.ptr_at((slot.slot_off + FRAME_LEN_BYTES) as usize),
            data_first: staging.ptr_at(payload.first_off as usize),
            data_first_len: payload.first_len,
            data_second: if payload.is_split() {
                staging.ptr_at(0)
            } else {
                std::ptr::null_mut()
            },
            data_second_len: payload.second_len,
            _staging: staging.clone(),
        }
    }

    /// Capacity of the payload destination.
    pub fn payload_capacity(&self) -> u32 {
        self.data_first_len + self.data_second_len
    }

    /// Stage read payload bytes into the response ring.
    pub fn copy_payload_in(&self, src: &[u8]) {
        assert!(src.len() as u32 <= self.payload_capacity());
        let first = (src.len() as u32).min(self.data_first_len) as usize;
        // SAFETY: segment pointers/lengths come from the reserved slot.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.data_first, first);
            if src.len() > first {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(first),
                    self.data_second,
                    src.len() - first,
                );
            }
        }
    }

    /// Publish the outcome: bytes serviced first, then the status word with
    /// release ordering. The completion scanner keys on the status.
    pub fn complete(&self, result: u32, bytes_serviced: u32) {
        debug_assert_ne!(result, status::IO_PENDING);
        // SAFETY: the ack header is 4-byte aligned (slots sit on 20-byte
        // units) and in bounds.
        unsafe {
            let bytes_ptr = self.ack.add(ACK_BYTES_SERVICED_OFFSET as usize) as *mut u32;
            bytes_ptr.write(bytes_serviced.to_le());
            let result_atomic = AtomicU32::from_ptr(self.ack.add(ACK_RESULT_OFFSET as usize) as *mut u32);
            result_atomic.store(u32::to_le(result), Ordering::Release);
        }
    }
}

/// One data-plane operation handed to the file service.
#[derive(Debug)]
pub struct DataOp {
    pub request: DataRequest,
    /// Write source; `None` for reads.
    pub source: Option<PayloadRef>,
    pub slot: ResponseSlot,
}

/// The storage engine behind the backend.
///
/// Implementations may complete submissions inline on the calling thread or
/// hand them to their own threads; either way results surface only through
/// the completion cells and response slots.
pub trait FileService: Send + Sync {
    /// Submit one control-plane operation.
    fn submit_control(&self, op: ControlOp, completion: Arc<ControlCompletion>);

    /// Submit a parsed data-plane batch in ring order.
    fn submit_data_batch(&self, ops: Vec<DataOp>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_completion_handshake() {
        let cell = ControlCompletion::new();
        assert!(cell.poll().is_none());

        cell.complete(status::SUCCESS, ControlAckData::FileSize(4096));
        match cell.poll() {
            Some((result, ControlAckData::FileSize(size))) => {
                assert_eq!(result, status::SUCCESS);
                assert_eq!(size, 4096);
            }
            other => panic!("unexpected {:?}", other.map(|(r, _)| r)),
        }
    }

    #[test]
    fn test_payload_ref_split_copy() {
        let mirror = Arc::new(DmaRegion::alloc(4096));
        // A payload that wraps: 4 bytes at the end, 2 at the start.
        mirror.write_at(4092, b"abcd");
        mirror.write_at(0, b"ef");

        let range = SplitRange::wrapped(4092, 4, 2);
        let payload = PayloadRef::new(&mirror, range);
        assert_eq!(payload.len(), 6);

        let mut out = [0u8; 6];
        payload.copy_to(&mut out);
        assert_eq!(&out, b"abcdef");
    }
}
