//! The backend bridge: the host side of the control channel.
//!
//! Connects with the control private-data byte, learns its client id in
//! the first exchange, then runs every control operation as a blocking
//! request/ack round trip. One operation at a time per bridge; the
//! backend enforces the same on its side.

use std::sync::Arc;

use tracing::{debug, info};
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::HostError;
use crate::constants::CTRL_MSG_SIZE;
use crate::rdma::{Endpoint, Fabric, LocalMr, QpConfig, WrOpcode, CTRL_CONN_PRIV_DATA};
use crate::ring::DmaRegion;
use crate::wire::control::{
    pack_name, AckGetFileAttr, AckGetFileInfo, AckGetFileSize, AckGetFreeSpace, AckResult,
    CtrlRespondClientId, CtrlTerminate, FileProperties, ReqChangeFileSize, ReqCreateDir,
    ReqCreateFile, ReqDeleteFile, ReqGetFileAttr, ReqGetFileInfo, ReqGetFileSize,
    ReqGetFreeSpace, ReqMoveFile, ReqRemoveDir,
};
use crate::wire::{decode_expected, encode_bare, encode_msg, MsgId};

const SEND_OFF: usize = 0;
const RECV_OFF: usize = CTRL_MSG_SIZE;

/// Control channel connection to the backend.
pub struct BackendBridge<F: Fabric> {
    ep: F::Endpoint,
    msg_buf: Arc<DmaRegion>,
    msg_mr: LocalMr,
    client_id: u32,
}

impl<F: Fabric> BackendBridge<F> {
    /// Connect the control channel and obtain a client id.
    pub fn connect(fabric: &F, addr: &str) -> Result<Self, HostError> {
        let ep = fabric.connect(addr, CTRL_CONN_PRIV_DATA, QpConfig::control())?;
        let msg_buf = Arc::new(DmaRegion::alloc(4096));
        let msg_mr = ep.register(&msg_buf)?;

        let mut bridge = Self {
            ep,
            msg_buf,
            msg_mr,
            client_id: u32::MAX,
        };

        let mut buf = [0u8; CTRL_MSG_SIZE];
        let len = encode_bare(&mut buf, MsgId::RequestClientId)?;
        let ack: CtrlRespondClientId =
            bridge.roundtrip(&buf[..len], MsgId::RespondClientId)?;
        bridge.client_id = ack.client_id.get();
        info!(client_id = bridge.client_id, "connected to backend");
        Ok(bridge)
    }

    /// The id the backend assigned to this client.
    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    fn recv_mr(&self) -> LocalMr {
        self.msg_mr.window(RECV_OFF as u32, CTRL_MSG_SIZE as u32)
    }

    /// One blocking request/ack exchange.
    fn roundtrip<A: FromBytes>(&mut self, msg: &[u8], ack_id: MsgId) -> Result<A, HostError> {
        self.ep.post_recv(self.recv_mr(), 1)?;

        self.msg_buf.write_at(SEND_OFF, msg);
        self.ep
            .post_send(self.msg_mr.window(SEND_OFF as u32, msg.len() as u32), 2)?;

        // Send completion, then the backend's ack.
        loop {
            let c = self.ep.wait()?;
            if c.opcode == WrOpcode::Recv {
                break;
            }
        }

        let mut ack = [0u8; CTRL_MSG_SIZE];
        self.msg_buf.read_at(RECV_OFF, &mut ack);
        Ok(decode_expected(&ack, ack_id)?)
    }

    fn request<Req, A>(&mut self, id: MsgId, req: &Req, ack_id: MsgId) -> Result<A, HostError>
    where
        Req: IntoBytes + Immutable,
        A: FromBytes,
    {
        let mut buf = [0u8; CTRL_MSG_SIZE];
        let len = encode_msg(&mut buf, id, req)?;
        debug!(?id, "control request");
        self.roundtrip(&buf[..len], ack_id)
    }

    /// Create a directory under `parent_id`.
    pub fn create_directory(
        &mut self,
        name: &str,
        dir_id: u32,
        parent_id: u32,
    ) -> Result<(), HostError> {
        let req = ReqCreateDir {
            dir_id: U32::new(dir_id),
            parent_id: U32::new(parent_id),
            name: pack_name(name)?,
        };
        let ack: AckResult = self.request(MsgId::ReqCreateDir, &req, MsgId::AckCreateDir)?;
        HostError::check(ack.result.get())
    }

    /// Remove an empty directory.
    pub fn remove_directory(&mut self, dir_id: u32) -> Result<(), HostError> {
        let req = ReqRemoveDir {
            dir_id: U32::new(dir_id),
        };
        let ack: AckResult = self.request(MsgId::ReqRemoveDir, &req, MsgId::AckRemoveDir)?;
        HostError::check(ack.result.get())
    }

    /// Create a file in `dir_id`.
    pub fn create_file(
        &mut self,
        name: &str,
        attributes: u32,
        file_id: u32,
        dir_id: u32,
    ) -> Result<(), HostError> {
        let req = ReqCreateFile {
            file_id: U32::new(file_id),
            dir_id: U32::new(dir_id),
            attributes: U32::new(attributes),
            name: pack_name(name)?,
        };
        let ack: AckResult = self.request(MsgId::ReqCreateFile, &req, MsgId::AckCreateFile)?;
        HostError::check(ack.result.get())
    }

    /// Delete a file.
    pub fn delete_file(&mut self, file_id: u32, dir_id: u32) -> Result<(), HostError> {
        let req = ReqDeleteFile {
            file_id: U32::new(file_id),
            dir_id: U32::new(dir_id),
        };
        let ack: AckResult = self.request(MsgId::ReqDeleteFile, &req, MsgId::AckDeleteFile)?;
        HostError::check(ack.result.get())
    }

    /// Truncate or extend a file.
    pub fn change_file_size(&mut self, file_id: u32, new_size: u64) -> Result<(), HostError> {
        let req = ReqChangeFileSize {
            file_id: U32::new(file_id),
            new_size: U64::new(new_size),
        };
        let ack: AckResult =
            self.request(MsgId::ReqChangeFileSize, &req, MsgId::AckChangeFileSize)?;
        HostError::check(ack.result.get())
    }

    /// Current size of a file.
    pub fn get_file_size(&mut self, file_id: u32) -> Result<u64, HostError> {
        let req = ReqGetFileSize {
            file_id: U32::new(file_id),
        };
        let ack: AckGetFileSize =
            self.request(MsgId::ReqGetFileSize, &req, MsgId::AckGetFileSize)?;
        HostError::check(ack.result.get())?;
        Ok(ack.file_size.get())
    }

    /// Properties of a file.
    pub fn get_file_info(&mut self, file_id: u32) -> Result<FileProperties, HostError> {
        let req = ReqGetFileInfo {
            file_id: U32::new(file_id),
        };
        let ack: AckGetFileInfo =
            self.request(MsgId::ReqGetFileInfo, &req, MsgId::AckGetFileInfo)?;
        HostError::check(ack.result.get())?;
        Ok(ack.properties)
    }

    /// Attributes of a file.
    pub fn get_file_attributes(&mut self, file_id: u32) -> Result<u32, HostError> {
        let req = ReqGetFileAttr {
            file_id: U32::new(file_id),
        };
        let ack: AckGetFileAttr =
            self.request(MsgId::ReqGetFileAttr, &req, MsgId::AckGetFileAttr)?;
        HostError::check(ack.result.get())?;
        Ok(ack.attributes.get())
    }

    /// Free bytes on the backend store.
    pub fn get_free_space(&mut self) -> Result<u64, HostError> {
        let req = ReqGetFreeSpace { reserved: U32::new(0) };
        let ack: AckGetFreeSpace =
            self.request(MsgId::ReqGetFreeSpace, &req, MsgId::AckGetFreeSpace)?;
        HostError::check(ack.result.get())?;
        Ok(ack.free_bytes.get())
    }

    /// Rename a file.
    pub fn move_file(&mut self, file_id: u32, new_name: &str) -> Result<(), HostError> {
        let req = ReqMoveFile {
            file_id: U32::new(file_id),
            new_name: pack_name(new_name)?,
        };
        let ack: AckResult = self.request(MsgId::ReqMoveFile, &req, MsgId::AckMoveFile)?;
        HostError::check(ack.result.get())
    }

    /// Tell the backend to release this client's slot, then drop the
    /// connection. The terminate message carries no ack.
    pub fn disconnect(mut self) -> Result<(), HostError> {
        let mut buf = [0u8; CTRL_MSG_SIZE];
        let len = encode_msg(
            &mut buf,
            MsgId::Terminate,
            &CtrlTerminate {
                client_id: U32::new(self.client_id),
            },
        )?;
        self.msg_buf.write_at(SEND_OFF, &buf[..len]);
        self.ep
            .post_send(self.msg_mr.window(SEND_OFF as u32, len as u32), 2)?;
        let _ = self.ep.wait()?;
        info!(client_id = self.client_id, "disconnected from backend");
        self.ep.disconnect();
        Ok(())
    }
}
