//! In-memory file service.
//!
//! A self-contained storage engine used by the integration tests and by
//! deployments that do not carry a block backend: a directory tree and
//! id-addressed files with zero-filled holes, all resident in memory.
//! Submissions complete inline on the calling thread.
//!
//! The metadata cache fronts the file map on the data path: every data
//! operation resolves `file id -> current size` through the cache before
//! touching the tree, and control-plane mutations keep the cache in step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};
use zerocopy::byteorder::little_endian::{U32, U64};

use super::{
    ControlAckData, ControlCompletion, ControlOp, DataOp, FileService,
};
use crate::cache::CacheTable;
use crate::wire::control::{unpack_name, FileProperties};
use crate::wire::status;

/// Root directory id; always present.
pub const ROOT_DIR_ID: u32 = 0;

/// Default storage quota reported through `GetFreeSpace`.
pub const DEFAULT_QUOTA_BYTES: u64 = 1 << 40;

struct DirNode {
    name: String,
    parent: u32,
    subdirs: u32,
    files: u32,
}

struct FileNode {
    name: String,
    dir_id: u32,
    attributes: u32,
    data: Vec<u8>,
    created_at: u64,
    accessed_at: u64,
    written_at: u64,
}

struct FsState {
    dirs: HashMap<u32, DirNode>,
    files: HashMap<u32, FileNode>,
    used_bytes: u64,
}

/// In-memory implementation of [`FileService`].
pub struct MemFileService {
    state: Mutex<FsState>,
    cache: Arc<CacheTable>,
    quota_bytes: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl MemFileService {
    pub fn new(cache: Arc<CacheTable>) -> Self {
        Self::with_quota(cache, DEFAULT_QUOTA_BYTES)
    }

    pub fn with_quota(cache: Arc<CacheTable>, quota_bytes: u64) -> Self {
        let mut dirs = HashMap::new();
        dirs.insert(
            ROOT_DIR_ID,
            DirNode {
                name: "/".to_string(),
                parent: ROOT_DIR_ID,
                subdirs: 0,
                files: 0,
            },
        );
        Self {
            state: Mutex::new(FsState {
                dirs,
                files: HashMap::new(),
                used_bytes: 0,
            }),
            cache,
            quota_bytes,
        }
    }

    fn execute_control(&self, op: &ControlOp) -> (u32, ControlAckData) {
        let mut fs = self.state.lock().unwrap();
        match op {
            ControlOp::CreateDir(req) => {
                let dir_id = req.dir_id.get();
                let parent_id = req.parent_id.get();
                let name = match unpack_name(&req.name) {
                    Ok(n) => n.to_string(),
                    Err(_) => return (status::INVALID_ARGUMENT, ControlAckData::None),
                };
                if fs.dirs.contains_key(&dir_id) {
                    return (status::ALREADY_EXISTS, ControlAckData::None);
                }
                if !fs.dirs.contains_key(&parent_id) {
                    return (status::NOT_FOUND, ControlAckData::None);
                }
                fs.dirs.insert(
                    dir_id,
                    DirNode {
                        name,
                        parent: parent_id,
                        subdirs: 0,
                        files: 0,
                    },
                );
                if let Some(parent) = fs.dirs.get_mut(&parent_id) {
                    parent.subdirs += 1;
                }
                (status::SUCCESS, ControlAckData::None)
            }

            ControlOp::RemoveDir(req) => {
                let dir_id = req.dir_id.get();
                if dir_id == ROOT_DIR_ID {
                    return (status::INVALID_ARGUMENT, ControlAckData::None);
                }
                let parent = match fs.dirs.get(&dir_id) {
                    None => return (status::NOT_FOUND, ControlAckData::None),
                    Some(dir) if dir.subdirs != 0 || dir.files != 0 => {
                        return (status::DIR_NOT_EMPTY, ControlAckData::None)
                    }
                    Some(dir) => dir.parent,
                };
                fs.dirs.remove(&dir_id);
                if let Some(p) = fs.dirs.get_mut(&parent) {
                    p.subdirs -= 1;
                }
                (status::SUCCESS, ControlAckData::None)
            }

            ControlOp::CreateFile(req) => {
                let file_id = req.file_id.get();
                let dir_id = req.dir_id.get();
                let name = match unpack_name(&req.name) {
                    Ok(n) => n.to_string(),
                    Err(_) => return (status::INVALID_ARGUMENT, ControlAckData::None),
                };
                if fs.files.contains_key(&file_id) {
                    return (status::ALREADY_EXISTS, ControlAckData::None);
                }
                if !fs.dirs.contains_key(&dir_id) {
                    return (status::NOT_FOUND, ControlAckData::None);
                }
                let now = now_secs();
                fs.files.insert(
                    file_id,
                    FileNode {
                        name,
                        dir_id,
                        attributes: req.attributes.get(),
                        data: Vec::new(),
                        created_at: now,
                        accessed_at: now,
                        written_at: now,
                    },
                );
                if let Some(dir) = fs.dirs.get_mut(&dir_id) {
                    dir.files += 1;
                }
                if self.cache.insert(file_id as u64, 0).is_err() {
                    // The file map stays authoritative; the data path falls
                    // back to it on a cache miss.
                    warn!(file_id, "metadata cache full, file not cached");
                }
                (status::SUCCESS, ControlAckData::None)
            }

            ControlOp::DeleteFile(req) => {
                let file_id = req.file_id.get();
                let dir_id = req.dir_id.get();
                match fs.files.get(&file_id) {
                    None => return (status::NOT_FOUND, ControlAckData::None),
                    Some(file) if file.dir_id != dir_id => {
                        return (status::NOT_FOUND, ControlAckData::None)
                    }
                    Some(_) => {}
                }
                let file = fs.files.remove(&file_id).expect("checked above");
                fs.used_bytes -= file.data.len() as u64;
                if let Some(dir) = fs.dirs.get_mut(&file.dir_id) {
                    dir.files -= 1;
                }
                self.cache.delete(file_id as u64);
                (status::SUCCESS, ControlAckData::None)
            }

            ControlOp::ChangeFileSize(req) => {
                let file_id = req.file_id.get();
                let new_size = req.new_size.get();
                let old_size = match fs.files.get(&file_id) {
                    None => return (status::NOT_FOUND, ControlAckData::None),
                    Some(file) => file.data.len() as u64,
                };
                if new_size > old_size
                    && fs.used_bytes + (new_size - old_size) > self.quota_bytes
                {
                    return (status::OUT_OF_SPACE, ControlAckData::None);
                }
                let file = fs.files.get_mut(&file_id).expect("checked above");
                file.data.resize(new_size as usize, 0);
                file.written_at = now_secs();
                fs.used_bytes = fs.used_bytes - old_size + new_size;
                let _ = self.cache.insert(file_id as u64, new_size);
                (status::SUCCESS, ControlAckData::None)
            }

            ControlOp::GetFileSize(req) => match fs.files.get(&req.file_id.get()) {
                None => (status::NOT_FOUND, ControlAckData::None),
                Some(file) => (
                    status::SUCCESS,
                    ControlAckData::FileSize(file.data.len() as u64),
                ),
            },

            ControlOp::GetFileInfo(req) => match fs.files.get(&req.file_id.get()) {
                None => (status::NOT_FOUND, ControlAckData::None),
                Some(file) => (
                    status::SUCCESS,
                    ControlAckData::FileInfo(FileProperties {
                        attributes: U32::new(file.attributes),
                        file_size: U64::new(file.data.len() as u64),
                        creation_time: U64::new(file.created_at),
                        last_access_time: U64::new(file.accessed_at),
                        last_write_time: U64::new(file.written_at),
                    }),
                ),
            },

            ControlOp::GetFileAttr(req) => match fs.files.get(&req.file_id.get()) {
                None => (status::NOT_FOUND, ControlAckData::None),
                Some(file) => (status::SUCCESS, ControlAckData::FileAttr(file.attributes)),
            },

            ControlOp::GetFreeSpace(_) => (
                status::SUCCESS,
                ControlAckData::FreeSpace(self.quota_bytes.saturating_sub(fs.used_bytes)),
            ),

            ControlOp::MoveFile(req) => {
                let file_id = req.file_id.get();
                let name = match unpack_name(&req.new_name) {
                    Ok(n) => n.to_string(),
                    Err(_) => return (status::INVALID_ARGUMENT, ControlAckData::None),
                };
                match fs.files.get_mut(&file_id) {
                    None => (status::NOT_FOUND, ControlAckData::None),
                    Some(file) => {
                        file.name = name;
                        file.written_at = now_secs();
                        (status::SUCCESS, ControlAckData::None)
                    }
                }
            }
        }
    }

    fn execute_data(&self, op: &DataOp) {
        let request = op.request;
        let file_id = request.file_id;

        // Hot path: the cuckoo cache resolves existence and current size
        // without touching the tree; fall back to the map on a miss.
        let cached_size = self.cache.lookup(file_id as u64);

        let mut fs = self.state.lock().unwrap();
        let exists = cached_size.is_some() || fs.files.contains_key(&file_id);
        if !exists {
            op.slot.complete(status::NOT_FOUND, 0);
            return;
        }

        if request.is_read {
            let file = match fs.files.get_mut(&file_id) {
                None => {
                    op.slot.complete(status::NOT_FOUND, 0);
                    return;
                }
                Some(f) => f,
            };
            let size = file.data.len() as u64;
            let available = size.saturating_sub(request.offset);
            let n = (request.bytes as u64).min(available) as u32;
            if n != 0 {
                let start = request.offset as usize;
                op.slot
                    .copy_payload_in(&file.data[start..start + n as usize]);
            }
            file.accessed_at = now_secs();
            debug!(request.request_id, file_id, n, "read serviced");
            op.slot.complete(status::SUCCESS, n);
        } else {
            let source = match &op.source {
                None => {
                    op.slot.complete(status::INVALID_ARGUMENT, 0);
                    return;
                }
                Some(s) => s,
            };
            let end = request.offset + request.bytes as u64;
            let old_size = match fs.files.get(&file_id) {
                None => {
                    op.slot.complete(status::NOT_FOUND, 0);
                    return;
                }
                Some(f) => f.data.len() as u64,
            };
            if end > old_size && fs.used_bytes + (end - old_size) > self.quota_bytes {
                op.slot.complete(status::OUT_OF_SPACE, 0);
                return;
            }

            let file = fs.files.get_mut(&file_id).expect("checked above");
            if end > old_size {
                file.data.resize(end as usize, 0);
            }
            let dst = &mut file.data
                [request.offset as usize..(request.offset + request.bytes as u64) as usize];
            source.copy_to(dst);
            file.written_at = now_secs();
            let new_size = file.data.len() as u64;
            if end > old_size {
                fs.used_bytes += end - old_size;
                let _ = self.cache.insert(file_id as u64, new_size);
            }
            debug!(request.request_id, file_id, request.bytes, "write serviced");
            op.slot.complete(status::SUCCESS, request.bytes);
        }
    }
}

impl FileService for MemFileService {
    fn submit_control(&self, op: ControlOp, completion: Arc<ControlCompletion>) {
        let (result, data) = self.execute_control(&op);
        debug!(?op, result, "control operation serviced");
        completion.complete(result, data);
    }

    fn submit_data_batch(&self, ops: Vec<DataOp>) {
        for op in &ops {
            self.execute_data(op);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::control::{
        pack_name, ReqChangeFileSize, ReqCreateFile, ReqDeleteFile, ReqGetFileInfo,
    };

    fn service() -> MemFileService {
        let cache = Arc::new(CacheTable::new(8).unwrap());
        MemFileService::new(cache)
    }

    fn create_file(svc: &MemFileService, file_id: u32, name: &str) -> u32 {
        let completion = Arc::new(ControlCompletion::new());
        svc.submit_control(
            ControlOp::CreateFile(ReqCreateFile {
                file_id: U32::new(file_id),
                dir_id: U32::new(ROOT_DIR_ID),
                attributes: U32::new(0),
                name: pack_name(name).unwrap(),
            }),
            completion.clone(),
        );
        completion.poll().expect("inline completion").0
    }

    #[test]
    fn test_create_then_info_then_delete() {
        let svc = service();
        assert_eq!(create_file(&svc, 7, "results.bin"), status::SUCCESS);
        assert_eq!(create_file(&svc, 7, "results.bin"), status::ALREADY_EXISTS);

        let completion = Arc::new(ControlCompletion::new());
        svc.submit_control(
            ControlOp::GetFileInfo(ReqGetFileInfo { file_id: U32::new(7) }),
            completion.clone(),
        );
        match completion.poll() {
            Some((result, ControlAckData::FileInfo(props))) => {
                assert_eq!(result, status::SUCCESS);
                assert_eq!(props.file_size.get(), 0);
            }
            other => panic!("unexpected {:?}", other.map(|(r, _)| r)),
        }

        let completion = Arc::new(ControlCompletion::new());
        svc.submit_control(
            ControlOp::DeleteFile(ReqDeleteFile {
                file_id: U32::new(7),
                dir_id: U32::new(ROOT_DIR_ID),
            }),
            completion.clone(),
        );
        assert_eq!(completion.poll().unwrap().0, status::SUCCESS);

        let completion = Arc::new(ControlCompletion::new());
        svc.submit_control(
            ControlOp::GetFileInfo(ReqGetFileInfo { file_id: U32::new(7) }),
            completion.clone(),
        );
        assert_eq!(completion.poll().unwrap().0, status::NOT_FOUND);
    }

    #[test]
    fn test_cache_tracks_file_lifecycle() {
        let cache = Arc::new(CacheTable::new(8).unwrap());
        let svc = MemFileService::new(cache.clone());

        assert_eq!(create_file(&svc, 42, "cached.dat"), status::SUCCESS);
        assert_eq!(cache.lookup(42), Some(0));

        let completion = Arc::new(ControlCompletion::new());
        svc.submit_control(
            ControlOp::ChangeFileSize(ReqChangeFileSize {
                file_id: U32::new(42),
                new_size: U64::new(8192),
            }),
            completion.clone(),
        );
        assert_eq!(completion.poll().unwrap().0, status::SUCCESS);
        assert_eq!(cache.lookup(42), Some(8192));

        let completion = Arc::new(ControlCompletion::new());
        svc.submit_control(
            ControlOp::DeleteFile(ReqDeleteFile {
                file_id: U32::new(42),
                dir_id: U32::new(ROOT_DIR_ID),
            }),
            completion,
        );
        assert_eq!(cache.lookup(42), None);
    }
}
