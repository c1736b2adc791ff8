//! The DMA buffer: the host side of the ring transport channel.
//!
//! Owns the shared DMA area (published metadata page plus both ring data
//! regions), registers it for remote access, and binds itself to a client
//! id during the buffer handshake. Requests are framed into the request
//! ring and published as batches; responses stream back through the
//! response ring in request order.

use std::sync::Arc;

use tracing::{debug, info};
use zerocopy::byteorder::little_endian::{U32, U64};

use super::HostError;
use crate::constants::{
    CTRL_MSG_SIZE, DMA_AREA_BYTES, MAX_COMPLETION_BUFFERING, MAX_OUTSTANDING_IO,
};
use crate::rdma::{Endpoint, Fabric, LocalMr, QpConfig, WrOpcode, BUFF_CONN_PRIV_DATA};
use crate::ring::request::RequestProducer;
use crate::ring::response::{ResponseConsumer, ResponseView};
use crate::ring::DmaRegion;
use crate::wire::control::{BuffRelease, BuffRequestId, BuffRespondId};
use crate::wire::{decode_expected, encode_msg, MsgId};

const SEND_OFF: usize = 0;
const RECV_OFF: usize = CTRL_MSG_SIZE;

/// Ring transport channel bound to a client session.
///
/// At most [`MAX_OUTSTANDING_IO`] requests may be in flight. Callers must
/// also keep the total response bytes of in-flight reads under the
/// response ring capacity; the backend treats an overflowing reservation
/// as a sizing bug and aborts.
pub struct DmaBuffer<F: Fabric> {
    ep: F::Endpoint,
    msg_buf: Arc<DmaRegion>,
    msg_mr: LocalMr,
    area: Arc<DmaRegion>,
    client_id: u32,
    buffer_id: u32,
    next_request_id: u64,
    outstanding: usize,
    req_tail: u32,
    resp_head: u32,
}

impl<F: Fabric> DmaBuffer<F> {
    /// Allocate the DMA area, connect the buffer channel, and run the
    /// handshake binding it to `client_id`.
    pub fn allocate(fabric: &F, addr: &str, client_id: u32) -> Result<Self, HostError> {
        let ep = fabric.connect(addr, BUFF_CONN_PRIV_DATA, QpConfig::buffer())?;
        let msg_buf = Arc::new(DmaRegion::alloc(4096));
        let msg_mr = ep.register(&msg_buf)?;

        let area = Arc::new(DmaRegion::alloc(DMA_AREA_BYTES));
        let area_mr = ep.register(&area)?;

        ep.post_recv(msg_mr.window(RECV_OFF as u32, CTRL_MSG_SIZE as u32), 1)?;

        let mut buf = [0u8; CTRL_MSG_SIZE];
        let len = encode_msg(
            &mut buf,
            MsgId::RequestBufferId,
            &BuffRequestId {
                client_id: U32::new(client_id),
                base_addr: U64::new(area_mr.addr),
                access_token: U32::new(area_mr.rkey),
                capacity: U32::new(DMA_AREA_BYTES as u32),
            },
        )?;
        msg_buf.write_at(SEND_OFF, &buf[..len]);
        ep.post_send(msg_mr.window(SEND_OFF as u32, len as u32), 2)?;

        loop {
            let c = ep.wait()?;
            if c.opcode == WrOpcode::Recv {
                break;
            }
        }
        let mut ack = [0u8; CTRL_MSG_SIZE];
        msg_buf.read_at(RECV_OFF, &mut ack);
        let resp: BuffRespondId = decode_expected(&ack, MsgId::RespondBufferId)?;
        let buffer_id = resp.buffer_id.get();
        info!(client_id, buffer_id, "buffer session bound");

        // Pre-post receives for completion notifications.
        for _ in 0..MAX_COMPLETION_BUFFERING {
            ep.post_recv(msg_mr.window(RECV_OFF as u32, CTRL_MSG_SIZE as u32), 1)?;
        }

        Ok(Self {
            ep,
            msg_buf,
            msg_mr,
            area,
            client_id,
            buffer_id,
            next_request_id: 1,
            outstanding: 0,
            req_tail: 0,
            resp_head: 0,
        })
    }

    pub fn buffer_id(&self) -> u32 {
        self.buffer_id
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn take_request_id(&mut self) -> Result<u64, HostError> {
        if self.outstanding == MAX_OUTSTANDING_IO {
            return Err(HostError::TooManyOutstanding);
        }
        let id = self.next_request_id;
        self.next_request_id += 1;
        self.outstanding += 1;
        Ok(id)
    }

    /// Frame a write request without publishing it. Returns the request
    /// id the response will carry.
    pub fn enqueue_write(
        &mut self,
        file_id: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, HostError> {
        let id = self.take_request_id()?;
        let mut producer = RequestProducer::resume(&self.area, self.req_tail);
        if let Err(e) = producer.push_write(id, file_id, offset, data) {
            self.outstanding -= 1;
            return Err(e.into());
        }
        self.req_tail = producer.tail();
        debug!(request_id = id, file_id, offset, bytes = data.len(), "write enqueued");
        Ok(id)
    }

    /// Frame a read request without publishing it.
    pub fn enqueue_read(
        &mut self,
        file_id: u32,
        offset: u64,
        bytes: u32,
    ) -> Result<u64, HostError> {
        let id = self.take_request_id()?;
        let mut producer = RequestProducer::resume(&self.area, self.req_tail);
        if let Err(e) = producer.push_read(id, file_id, offset, bytes) {
            self.outstanding -= 1;
            return Err(e.into());
        }
        self.req_tail = producer.tail();
        debug!(request_id = id, file_id, offset, bytes, "read enqueued");
        Ok(id)
    }

    /// Publish every frame enqueued so far; the backend picks them up as
    /// one batch.
    pub fn publish(&self) {
        RequestProducer::resume(&self.area, self.req_tail).publish();
    }

    /// Write `data` at `offset` of `file_id` and publish immediately.
    pub fn write_file(
        &mut self,
        file_id: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, HostError> {
        let id = self.enqueue_write(file_id, offset, data)?;
        self.publish();
        Ok(id)
    }

    /// Read `bytes` at `offset` of `file_id` and publish immediately.
    pub fn read_file(&mut self, file_id: u32, offset: u64, bytes: u32) -> Result<u64, HostError> {
        let id = self.enqueue_read(file_id, offset, bytes)?;
        self.publish();
        Ok(id)
    }

    /// Drain every response currently visible, invoking `f` per response
    /// in request order. Returns the number consumed.
    pub fn poll_responses(&mut self, f: impl FnMut(ResponseView<'_>)) -> u32 {
        let mut consumer = ResponseConsumer::resume(&self.area, self.resp_head);
        let consumed = consumer.poll(f);
        self.resp_head = consumer.head();
        self.outstanding = self.outstanding.saturating_sub(consumed as usize);
        consumed
    }

    /// Block until the backend signals responses, then drain them.
    ///
    /// Requires the backend to run with interrupt-style completion
    /// notification; with plain polling, use [`poll_responses`] in a loop.
    ///
    /// [`poll_responses`]: Self::poll_responses
    pub fn wait_responses(&mut self, f: impl FnMut(ResponseView<'_>)) -> Result<u32, HostError> {
        loop {
            let c = self.ep.wait()?;
            if c.opcode == WrOpcode::RecvWithImm {
                // Replenish the notification receive.
                self.ep
                    .post_recv(self.msg_mr.window(RECV_OFF as u32, CTRL_MSG_SIZE as u32), 1)?;
                return Ok(self.poll_responses(f));
            }
        }
    }

    /// Release the buffer session on the backend and drop the connection.
    pub fn release(self) -> Result<(), HostError> {
        let mut buf = [0u8; CTRL_MSG_SIZE];
        let len = encode_msg(
            &mut buf,
            MsgId::ReleaseBuffer,
            &BuffRelease {
                client_id: U32::new(self.client_id),
                buffer_id: U32::new(self.buffer_id),
            },
        )?;
        self.msg_buf.write_at(SEND_OFF, &buf[..len]);
        self.ep
            .post_send(self.msg_mr.window(SEND_OFF as u32, len as u32), 2)?;
        let _ = self.ep.wait()?;
        info!(buffer_id = self.buffer_id, "buffer session released");
        self.ep.disconnect();
        Ok(())
    }
}
