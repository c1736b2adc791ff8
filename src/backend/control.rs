//! Control message handling.
//!
//! Each connected control session is polled for one completion per
//! control-plane tick. A received request posts a fresh receive first,
//! then goes to the file service with the session's single pending slot
//! armed; the completion scanner sends the ack once the service publishes
//! a status. The client-id request is answered synchronously.

use std::sync::Arc;

use tracing::{debug, error, warn};
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::FromZeros;

use super::session::{ConnState, ControlSession, PendingControl, RECV_BUF_OFF};
use super::{wr, Backend};
use crate::constants::CTRL_MSG_SIZE;
use crate::rdma::{Endpoint, Fabric, RdmaError, WrOpcode};
use crate::service::{ControlAckData, ControlCompletion, ControlOp};
use crate::wire::control::{
    AckGetFileAttr, AckGetFileSize, AckGetFileInfo, AckGetFreeSpace, AckResult,
    CtrlRespondClientId, CtrlTerminate, FileProperties,
};
use crate::wire::{decode_payload, encode_msg, peek_msg_id, MsgId, ProtocolError};

/// Serialize an ack for a completed control operation.
fn encode_ack(
    buf: &mut [u8],
    ack_id: MsgId,
    result: u32,
    data: ControlAckData,
) -> Result<usize, ProtocolError> {
    match ack_id {
        MsgId::AckGetFileSize => {
            let file_size = match data {
                ControlAckData::FileSize(s) => s,
                _ => 0,
            };
            encode_msg(
                buf,
                ack_id,
                &AckGetFileSize {
                    result: U32::new(result),
                    file_size: U64::new(file_size),
                },
            )
        }
        MsgId::AckGetFileInfo => {
            let properties = match data {
                ControlAckData::FileInfo(p) => p,
                _ => FileProperties::new_zeroed(),
            };
            encode_msg(
                buf,
                ack_id,
                &AckGetFileInfo {
                    result: U32::new(result),
                    properties,
                },
            )
        }
        MsgId::AckGetFileAttr => {
            let attributes = match data {
                ControlAckData::FileAttr(a) => a,
                _ => 0,
            };
            encode_msg(
                buf,
                ack_id,
                &AckGetFileAttr {
                    result: U32::new(result),
                    attributes: U32::new(attributes),
                },
            )
        }
        MsgId::AckGetFreeSpace => {
            let free_bytes = match data {
                ControlAckData::FreeSpace(b) => b,
                _ => 0,
            };
            encode_msg(
                buf,
                ack_id,
                &AckGetFreeSpace {
                    result: U32::new(result),
                    free_bytes: U64::new(free_bytes),
                },
            )
        }
        _ => encode_msg(
            buf,
            ack_id,
            &AckResult {
                result: U32::new(result),
            },
        ),
    }
}

enum CtrlAction {
    None,
    Teardown,
}

impl<F: Fabric> Backend<F> {
    /// Poll every connected control session's completion queue once.
    pub(super) fn process_ctrl_cq(&mut self) {
        for idx in 0..self.ctrl_sessions.len() {
            if self.ctrl_sessions[idx].state != ConnState::Connected {
                continue;
            }

            let polled = match &self.ctrl_sessions[idx].ep {
                None => continue,
                Some(ep) => ep.poll(),
            };

            match polled {
                Ok(None) => {}
                Ok(Some(c)) => match c.opcode {
                    WrOpcode::Recv => self.handle_ctrl_msg(idx),
                    WrOpcode::Send | WrOpcode::RdmaRead | WrOpcode::RdmaWrite => {}
                    other => {
                        error!(slot = idx, ?other, "unexpected control completion");
                    }
                },
                Err(e) => {
                    error!(slot = idx, "control channel failed: {e}");
                    self.ctrl_sessions[idx].teardown();
                }
            }
        }
    }

    /// Decode and dispatch one received control message.
    fn handle_ctrl_msg(&mut self, idx: usize) {
        let service = self.service.clone();
        let session = &mut self.ctrl_sessions[idx];

        let mut msg = [0u8; CTRL_MSG_SIZE];
        session.msg_buf.read_at(RECV_BUF_OFF, &mut msg);

        let action = match dispatch_ctrl_msg(session, service.as_ref(), &msg) {
            Ok(action) => action,
            Err(e) => {
                // Unrecognized or malformed messages are dropped without an
                // ack; the session stays up.
                warn!(slot = session.id, "control message dropped: {e}");
                CtrlAction::None
            }
        };

        if matches!(action, CtrlAction::Teardown) {
            session.teardown();
        }
    }

    /// Post acks for control operations the file service has finished.
    pub(super) fn scan_control_completions(&mut self) {
        for session in &mut self.ctrl_sessions {
            if session.state != ConnState::Connected {
                continue;
            }
            let Some(pending) = &session.pending else {
                continue;
            };
            let Some((result, data)) = pending.completion.poll() else {
                continue;
            };
            let ack_id = pending.ack_id;
            session.pending = None;

            let mut buf = [0u8; CTRL_MSG_SIZE];
            let len = match encode_ack(&mut buf, ack_id, result, data) {
                Ok(len) => len,
                Err(e) => {
                    error!(slot = session.id, "ack encoding failed: {e}");
                    session.teardown();
                    continue;
                }
            };
            session
                .msg_buf
                .write_at(super::session::SEND_BUF_OFF, &buf[..len]);

            let posted = match &session.ep {
                None => Err(RdmaError::Closed),
                Some(ep) => ep.post_send(session.send_mr(len), wr::CTRL_SEND),
            };
            if let Err(e) = posted {
                error!(slot = session.id, "ack send failed: {e}");
                session.teardown();
            } else {
                debug!(slot = session.id, ?ack_id, result, "control ack sent");
            }
        }
    }
}

/// Handle one decoded control message on a session.
fn dispatch_ctrl_msg<E: Endpoint>(
    session: &mut ControlSession<E>,
    service: &dyn crate::service::FileService,
    msg: &[u8],
) -> Result<CtrlAction, ProtocolError> {
    let msg_id = peek_msg_id(msg)?;

    // Every path that stays connected needs the next request receivable
    // before any further work.
    let repost_recv = |session: &ControlSession<E>| -> Result<(), ProtocolError> {
        if let Some(ep) = &session.ep {
            if let Err(e) = ep.post_recv(session.recv_mr(), wr::CTRL_RECV) {
                error!(slot = session.id, "post_recv failed: {e}");
            }
        }
        Ok(())
    };

    // Arm the session's single pending slot and hand the operation to the
    // file service.
    let submit = |session: &mut ControlSession<E>,
                  op: ControlOp,
                  ack_id: MsgId|
     -> Result<CtrlAction, ProtocolError> {
        if session.pending.is_some() {
            // One outstanding control operation per session; a second is a
            // protocol violation by the host.
            warn!(slot = session.id, "control request while one is pending, dropped");
            return Ok(CtrlAction::None);
        }
        let completion = Arc::new(ControlCompletion::new());
        session.pending = Some(PendingControl {
            ack_id,
            completion: completion.clone(),
        });
        debug!(slot = session.id, ?op, "control operation submitted");
        service.submit_control(op, completion);
        Ok(CtrlAction::None)
    };

    match msg_id {
        MsgId::RequestClientId => {
            repost_recv(session)?;
            let mut buf = [0u8; CTRL_MSG_SIZE];
            let len = encode_msg(
                &mut buf,
                MsgId::RespondClientId,
                &CtrlRespondClientId {
                    client_id: U32::new(session.id),
                },
            )?;
            session
                .msg_buf
                .write_at(super::session::SEND_BUF_OFF, &buf[..len]);
            if let Some(ep) = &session.ep {
                if let Err(e) = ep.post_send(session.send_mr(len), wr::CTRL_SEND) {
                    error!(slot = session.id, "client id send failed: {e}");
                    return Ok(CtrlAction::Teardown);
                }
            }
            Ok(CtrlAction::None)
        }

        MsgId::Terminate => {
            let req: CtrlTerminate = decode_payload(msg)?;
            if req.client_id.get() != session.id {
                return Err(ProtocolError::MismatchedClientId {
                    expected: session.id,
                    got: req.client_id.get(),
                });
            }
            Ok(CtrlAction::Teardown)
        }

        MsgId::ReqCreateDir => {
            repost_recv(session)?;
            let req = decode_payload(msg)?;
            submit(session, ControlOp::CreateDir(req), MsgId::AckCreateDir)
        }
        MsgId::ReqRemoveDir => {
            repost_recv(session)?;
            let req = decode_payload(msg)?;
            submit(session, ControlOp::RemoveDir(req), MsgId::AckRemoveDir)
        }
        MsgId::ReqCreateFile => {
            repost_recv(session)?;
            let req = decode_payload(msg)?;
            submit(session, ControlOp::CreateFile(req), MsgId::AckCreateFile)
        }
        MsgId::ReqDeleteFile => {
            repost_recv(session)?;
            let req = decode_payload(msg)?;
            submit(session, ControlOp::DeleteFile(req), MsgId::AckDeleteFile)
        }
        MsgId::ReqChangeFileSize => {
            repost_recv(session)?;
            let req = decode_payload(msg)?;
            submit(
                session,
                ControlOp::ChangeFileSize(req),
                MsgId::AckChangeFileSize,
            )
        }
        MsgId::ReqGetFileSize => {
            repost_recv(session)?;
            let req = decode_payload(msg)?;
            submit(session, ControlOp::GetFileSize(req), MsgId::AckGetFileSize)
        }
        MsgId::ReqGetFileInfo => {
            repost_recv(session)?;
            let req = decode_payload(msg)?;
            submit(session, ControlOp::GetFileInfo(req), MsgId::AckGetFileInfo)
        }
        MsgId::ReqGetFileAttr => {
            repost_recv(session)?;
            let req = decode_payload(msg)?;
            submit(session, ControlOp::GetFileAttr(req), MsgId::AckGetFileAttr)
        }
        MsgId::ReqGetFreeSpace => {
            repost_recv(session)?;
            let req = decode_payload(msg)?;
            submit(session, ControlOp::GetFreeSpace(req), MsgId::AckGetFreeSpace)
        }
        MsgId::ReqMoveFile => {
            repost_recv(session)?;
            let req = decode_payload(msg)?;
            submit(session, ControlOp::MoveFile(req), MsgId::AckMoveFile)
        }

        other => Err(ProtocolError::UnknownMsgId(other as u16)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_ack_variants() {
        let mut buf = [0u8; CTRL_MSG_SIZE];

        let len = encode_ack(
            &mut buf,
            MsgId::AckGetFileSize,
            crate::wire::status::SUCCESS,
            ControlAckData::FileSize(12345),
        )
        .unwrap();
        assert_eq!(len, 2 + std::mem::size_of::<AckGetFileSize>());
        let ack: AckGetFileSize =
            crate::wire::decode_expected(&buf, MsgId::AckGetFileSize).unwrap();
        assert_eq!(ack.file_size.get(), 12345);

        // A failed query still encodes a full ack with zeroed data.
        let len = encode_ack(
            &mut buf,
            MsgId::AckGetFileInfo,
            crate::wire::status::NOT_FOUND,
            ControlAckData::None,
        )
        .unwrap();
        assert_eq!(len, 2 + std::mem::size_of::<AckGetFileInfo>());
        let ack: AckGetFileInfo =
            crate::wire::decode_expected(&buf, MsgId::AckGetFileInfo).unwrap();
        assert_eq!(ack.result.get(), crate::wire::status::NOT_FOUND);
        assert_eq!(ack.properties.file_size.get(), 0);

        let len = encode_ack(
            &mut buf,
            MsgId::AckCreateFile,
            crate::wire::status::ALREADY_EXISTS,
            ControlAckData::None,
        )
        .unwrap();
        assert_eq!(len, 2 + std::mem::size_of::<AckResult>());
    }
}
