//! The data-plane pipeline.
//!
//! Per connected buffer session, a completion-driven state machine:
//!
//! 1. poll the host's request-ring tail by RDMA read (re-poll on torn or
//!    unchanged metadata),
//! 2. fetch `[head, tail)` into the local mirror with one or two reads
//!    (split on wrap) and immediately write the claimed head back,
//! 3. parse the batch, reserve response slots in parse order, submit the
//!    whole batch to the file service,
//! 4. scan staged responses for completed results (the committed prefix),
//! 5. once the batch is fully complete, poll the host's response head and
//!    push `[transmit, complete)` with one or two RDMA writes plus the
//!    transmit-tail metadata write.
//!
//! A failed work request tears down that session only. A response-ring
//! overflow is a sizing bug and stops the backend.

use tracing::{debug, error, trace, warn};

use super::session::{BufferSession, ConnState, RingState};
use super::{wr, Backend, BackendError};
use crate::constants::{DMA_AREA_BYTES, MAX_OUTSTANDING_IO, REQUEST_RING_BYTES, RESPONSE_RING_USED};
use crate::config::NotificationMethod;
use crate::rdma::{Completion, Endpoint, Fabric, RdmaError, RemoteMr, WrOpcode};
use crate::ring::request::{fetch_span, parse_batch};
use crate::ring::response::{
    host_can_accept, scan_completions, transmit_span, BatchBuilder, ScanOutcome,
};
use crate::ring::{layout, ring_advance, ring_distance};
use crate::service::{DataOp, DataRequest, PayloadRef, ResponseSlot};
use crate::wire::{decode_payload, encode_msg, peek_msg_id, MsgId};
use crate::wire::control::{BuffRelease, BuffRequestId, BuffRespondId};
use zerocopy::byteorder::little_endian::U32;

/// Offsets inside the per-session metadata landing region.
mod meta {
    /// Request tail word fetched from the host.
    pub const REQ_TAIL: usize = 0;
    /// Its check copy (second cache line of the fetch).
    pub const REQ_TAIL_CHECK: usize = 64;
    /// Response head word fetched from the host.
    pub const RESP_HEAD: usize = 128;
    /// Its check copy.
    pub const RESP_HEAD_CHECK: usize = 192;
    /// Scratch word holding the claimed request head for write-back.
    pub const REQ_HEAD_SCRATCH: usize = 256;
    /// Scratch word holding the transmit tail for write-back.
    pub const RESP_TAIL_SCRATCH: usize = 320;
    /// Bytes fetched by each metadata poll (value + check copy).
    pub const SPAN: u32 = 128;
}

fn meta_word(rings: &RingState, offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    rings.meta.read_at(offset, &mut bytes);
    u32::from_le_bytes(bytes)
}

/// Post the request-ring metadata poll.
fn post_request_meta_poll<E: Endpoint>(ep: &E, rings: &RingState) -> Result<(), RdmaError> {
    ep.post_read(
        rings.meta_mr.window(meta::REQ_TAIL as u32, meta::SPAN),
        rings.remote.at_offset(layout::REQ_TAIL as u64),
        wr::READ_REQUEST_META,
    )
}

/// Post the response-ring metadata poll.
fn post_response_meta_poll<E: Endpoint>(ep: &E, rings: &RingState) -> Result<(), RdmaError> {
    ep.post_read(
        rings.meta_mr.window(meta::RESP_HEAD as u32, meta::SPAN),
        rings.remote.at_offset(layout::RESP_HEAD as u64),
        wr::READ_RESPONSE_META,
    )
}

impl<F: Fabric> Backend<F> {
    /// Poll every connected buffer session's completion queue once.
    pub(super) fn process_buff_cq(&mut self) -> Result<(), BackendError> {
        for idx in 0..self.buff_sessions.len() {
            if self.buff_sessions[idx].state != ConnState::Connected {
                continue;
            }

            let polled = match &self.buff_sessions[idx].ep {
                None => continue,
                Some(ep) => ep.poll(),
            };

            match polled {
                Ok(None) => {}
                Ok(Some(c)) => self.on_buff_completion(idx, c)?,
                Err(e) => {
                    error!(slot = idx, "buffer channel failed: {e}");
                    self.buff_sessions[idx].teardown();
                }
            }
        }
        Ok(())
    }

    fn on_buff_completion(&mut self, idx: usize, c: Completion) -> Result<(), BackendError> {
        match c.opcode {
            WrOpcode::Recv => {
                self.handle_buff_msg(idx);
                Ok(())
            }

            WrOpcode::RdmaRead => match c.wr_id {
                wr::READ_REQUEST_META => {
                    self.with_rings(idx, |ep, rings| on_request_meta(ep, rings));
                    Ok(())
                }
                wr::READ_REQUEST_DATA | wr::READ_REQUEST_DATA_SPLIT => {
                    self.on_request_data(idx)
                }
                wr::READ_RESPONSE_META => {
                    let notify_imm = use_imm_notification(self.notification);
                    self.with_rings(idx, |ep, rings| on_response_meta(ep, rings, notify_imm));
                    Ok(())
                }
                other => {
                    error!(slot = idx, wr_id = other, "unknown read completion");
                    Ok(())
                }
            },

            WrOpcode::RdmaWrite => match c.wr_id {
                wr::WRITE_REQUEST_META => {
                    // The claimed head is published; start the next poll
                    // cycle.
                    self.with_rings(idx, |ep, rings| post_request_meta_poll(ep, rings));
                    Ok(())
                }
                wr::WRITE_RESPONSE_DATA | wr::WRITE_RESPONSE_DATA_SPLIT => {
                    if let Some(rings) = self.buff_sessions[idx].rings.as_mut() {
                        // Transmit progress is tracked by the split state;
                        // the response scanners do the rest.
                        let _ = rings.resp_split.on_completion();
                    }
                    Ok(())
                }
                wr::WRITE_RESPONSE_META => Ok(()),
                other => {
                    error!(slot = idx, wr_id = other, "unknown write completion");
                    Ok(())
                }
            },

            WrOpcode::Send => Ok(()),

            other => {
                error!(slot = idx, ?other, "unknown buffer completion");
                Ok(())
            }
        }
    }

    /// Run `f` against a session's endpoint and rings; tear the session
    /// down if it fails.
    fn with_rings(
        &mut self,
        idx: usize,
        f: impl FnOnce(&F::Endpoint, &mut RingState) -> Result<(), RdmaError>,
    ) {
        let session = &mut self.buff_sessions[idx];
        let outcome = match (&session.ep, session.rings.as_mut()) {
            (Some(ep), Some(rings)) => f(ep, rings),
            _ => return,
        };
        if let Err(e) = outcome {
            error!(slot = idx, "data plane failed: {e}");
            session.teardown();
        }
    }

    /// Handle a typed message on the buffer channel.
    fn handle_buff_msg(&mut self, idx: usize) {
        let session = &mut self.buff_sessions[idx];
        let mut msg = [0u8; crate::constants::CTRL_MSG_SIZE];
        session.msg_buf.read_at(super::session::RECV_BUF_OFF, &mut msg);

        match handle_buff_msg_inner(session, &msg) {
            Ok(BuffAction::None) => {}
            Ok(BuffAction::Teardown) => session.teardown(),
            Err(e) => {
                warn!(slot = idx, "buffer message dropped: {e}");
            }
        }
    }

    fn on_request_data(&mut self, idx: usize) -> Result<(), BackendError> {
        let done = match self.buff_sessions[idx].rings.as_mut() {
            None => return Ok(()),
            Some(rings) => rings.fetch_split.on_completion(),
        };
        if !done {
            return Ok(());
        }
        self.execute_requests(idx)
    }

    /// Parse the fetched batch, reserve responses, submit to the file
    /// service.
    fn execute_requests(&mut self, idx: usize) -> Result<(), BackendError> {
        let service = self.service.clone();
        let session = &mut self.buff_sessions[idx];
        let Some(rings) = session.rings.as_mut() else {
            return Ok(());
        };

        let cap = REQUEST_RING_BYTES;
        let fetched = rings.fetch_bytes;
        // The head was advanced when the fetch was claimed; parsing starts
        // `fetched` bytes behind it.
        let parse_head = ring_distance(rings.req_head, fetched, cap);
        let batch = match parse_batch(&rings.req_mirror, cap, parse_head, fetched) {
            Ok(batch) => batch,
            Err(e) => {
                error!(slot = idx, "request batch parse failed: {e}");
                session.teardown();
                return Ok(());
            }
        };

        trace!(slot = idx, requests = batch.len(), bytes = fetched, "batch parsed");

        let mut builder = BatchBuilder::begin(&rings.resp_staging, &mut rings.resp_tails)
            .map_err(BackendError::ResponseOverflow)?;

        let mut ops = Vec::with_capacity(batch.len());
        for parsed in &batch {
            let reserved = builder
                .reserve(
                    parsed.header.request_id.get(),
                    parsed.is_read,
                    parsed.header.bytes.get(),
                )
                .map_err(BackendError::ResponseOverflow)?;

            let request = DataRequest {
                request_id: parsed.header.request_id.get(),
                file_id: parsed.header.file_id.get(),
                offset: parsed.header.offset.get(),
                bytes: parsed.header.bytes.get(),
                is_read: parsed.is_read,
            };
            rings.contexts[rings.next_context] = request;
            rings.next_context = (rings.next_context + 1) % MAX_OUTSTANDING_IO;

            let source = parsed
                .payload
                .map(|range| PayloadRef::new(&rings.req_mirror, range));
            ops.push(DataOp {
                request,
                source,
                slot: ResponseSlot::new(&rings.resp_staging, &reserved),
            });
        }
        let (total, count) = builder.finish();
        debug!(slot = idx, count, total, "batch submitted");

        service.submit_data_batch(ops);
        Ok(())
    }

    /// Advance completion tails over finished responses; kick off the
    /// response transmit when a batch is entirely done.
    pub(super) fn scan_io_completions(&mut self) {
        for idx in 0..self.buff_sessions.len() {
            if self.buff_sessions[idx].state != ConnState::Connected {
                continue;
            }
            self.with_rings(idx, |ep, rings| {
                match scan_completions(&rings.resp_staging, &rings.resp_tails) {
                    ScanOutcome::Idle => Ok(()),
                    ScanOutcome::Progress {
                        new_complete,
                        batch_done,
                    } => {
                        rings.resp_tails.complete = new_complete;
                        if batch_done {
                            // Check how far the host has consumed before
                            // writing the batch back.
                            post_response_meta_poll(ep, rings)
                        } else {
                            Ok(())
                        }
                    }
                }
            });
        }
    }
}

enum BuffAction {
    None,
    Teardown,
}

fn handle_buff_msg_inner<E: Endpoint>(
    session: &mut BufferSession<E>,
    msg: &[u8],
) -> Result<BuffAction, crate::wire::ProtocolError> {
    use crate::wire::ProtocolError;

    match peek_msg_id(msg)? {
        MsgId::RequestBufferId => {
            let req: BuffRequestId = decode_payload(msg)?;

            if let Some(ep) = &session.ep {
                if let Err(e) = ep.post_recv(session.recv_mr(), wr::BUFF_RECV) {
                    error!(slot = session.id, "post_recv failed: {e}");
                }
            }

            if req.capacity.get() as usize != DMA_AREA_BYTES {
                error!(
                    slot = session.id,
                    capacity = req.capacity.get(),
                    "buffer handshake with mismatched DMA area size"
                );
                return Ok(BuffAction::Teardown);
            }

            session.client_id = Some(req.client_id.get());
            let remote = RemoteMr {
                addr: req.base_addr.get(),
                rkey: req.access_token.get(),
            };

            let Some(ep) = &session.ep else {
                return Ok(BuffAction::Teardown);
            };
            let rings = match RingState::new(ep, remote) {
                Ok(rings) => rings,
                Err(e) => {
                    error!(slot = session.id, "ring registration failed: {e}");
                    return Ok(BuffAction::Teardown);
                }
            };

            // Reply with the buffer id, then start polling requests.
            let mut buf = [0u8; crate::constants::CTRL_MSG_SIZE];
            let len = encode_msg(
                &mut buf,
                MsgId::RespondBufferId,
                &BuffRespondId {
                    buffer_id: U32::new(session.id),
                },
            )?;
            session
                .msg_buf
                .write_at(super::session::SEND_BUF_OFF, &buf[..len]);

            let started = ep
                .post_send(session.send_mr(len), wr::BUFF_SEND)
                .and_then(|()| post_request_meta_poll(ep, &rings));
            match started {
                Ok(()) => {
                    debug!(
                        slot = session.id,
                        client = req.client_id.get(),
                        base = format_args!("{:#x}", req.base_addr.get()),
                        "buffer session bound, polling requests"
                    );
                    session.rings = Some(rings);
                    Ok(BuffAction::None)
                }
                Err(e) => {
                    error!(slot = session.id, "buffer handshake failed: {e}");
                    Ok(BuffAction::Teardown)
                }
            }
        }

        MsgId::ReleaseBuffer => {
            let req: BuffRelease = decode_payload(msg)?;
            if req.buffer_id.get() != session.id
                || Some(req.client_id.get()) != session.client_id
            {
                return Err(ProtocolError::MismatchedClientId {
                    expected: session.client_id.unwrap_or(u32::MAX),
                    got: req.client_id.get(),
                });
            }
            Ok(BuffAction::Teardown)
        }

        other => Err(ProtocolError::UnknownMsgId(other as u16)),
    }
}

/// Whether the transmit-tail update should carry an immediate value
/// (interrupt-style completion notification).
fn use_imm_notification(method: NotificationMethod) -> bool {
    matches!(method, NotificationMethod::Interrupt)
}

/// Request-metadata poll completion: decide between re-poll and fetch.
fn on_request_meta<E: Endpoint>(ep: &E, rings: &mut RingState) -> Result<(), RdmaError> {
    let tail = meta_word(rings, meta::REQ_TAIL);
    let check = meta_word(rings, meta::REQ_TAIL_CHECK);

    if tail != check || tail == rings.req_head {
        // Torn metadata or nothing new: poll again.
        return post_request_meta_poll(ep, rings);
    }

    let cap = REQUEST_RING_BYTES;
    let span = match fetch_span(rings.req_head, tail, cap) {
        None => return post_request_meta_poll(ep, rings),
        Some(span) => span,
    };

    rings.fetch_bytes = span.total();
    rings.fetch_split.arm(&span);
    trace!(
        head = rings.req_head,
        tail,
        bytes = span.total(),
        split = span.is_split(),
        "fetching requests"
    );

    // Mirror the remote ring: same offsets locally and remotely.
    if span.is_split() {
        ep.post_read(
            rings.req_mirror_mr.window(0, span.second_len),
            rings.remote.at_offset(layout::REQ_DATA as u64),
            wr::READ_REQUEST_DATA_SPLIT,
        )?;
    }
    ep.post_read(
        rings.req_mirror_mr.window(span.first_off, span.first_len),
        rings
            .remote
            .at_offset((layout::REQ_DATA as u64) + span.first_off as u64),
        wr::READ_REQUEST_DATA,
    )?;

    // Claim the bytes: publish the advanced head immediately, relying on
    // the queue pair executing it after the reads above.
    rings.req_head = tail;
    rings
        .meta
        .write_at(meta::REQ_HEAD_SCRATCH, &tail.to_le_bytes());
    ep.post_write(
        rings.meta_mr.window(meta::REQ_HEAD_SCRATCH as u32, 4),
        rings.remote.at_offset(layout::REQ_HEAD as u64),
        wr::WRITE_REQUEST_META,
        None,
    )
}

/// Response-metadata poll completion: transmit if the host has room.
fn on_response_meta<E: Endpoint>(
    ep: &E,
    rings: &mut RingState,
    notify_imm: bool,
) -> Result<(), RdmaError> {
    let tails = rings.resp_tails;
    if tails.transmit == tails.complete {
        return Ok(());
    }

    let head = meta_word(rings, meta::RESP_HEAD);
    let check = meta_word(rings, meta::RESP_HEAD_CHECK);
    if head != check {
        return post_response_meta_poll(ep, rings);
    }

    let total = ring_distance(tails.complete, tails.transmit, RESPONSE_RING_USED);
    if !host_can_accept(head, tails.transmit, total) {
        // The host is behind; poll its head again.
        return post_response_meta_poll(ep, rings);
    }

    let span = match transmit_span(&tails) {
        None => return Ok(()),
        Some(span) => span,
    };
    rings.resp_split.arm(&span);
    trace!(
        transmit = tails.transmit,
        bytes = total,
        split = span.is_split(),
        "transmitting responses"
    );

    if span.is_split() {
        ep.post_write(
            rings.resp_staging_mr.window(0, span.second_len),
            rings.remote.at_offset(layout::RESP_DATA as u64),
            wr::WRITE_RESPONSE_DATA_SPLIT,
            None,
        )?;
    }
    ep.post_write(
        rings.resp_staging_mr.window(span.first_off, span.first_len),
        rings
            .remote
            .at_offset((layout::RESP_DATA as u64) + span.first_off as u64),
        wr::WRITE_RESPONSE_DATA,
        None,
    )?;

    // Publish the new transmit tail after the data writes; in-order
    // delivery makes the host see data before metadata.
    let new_transmit = ring_advance(tails.transmit, total, RESPONSE_RING_USED);
    rings.resp_tails.transmit = new_transmit;
    rings
        .meta
        .write_at(meta::RESP_TAIL_SCRATCH, &new_transmit.to_le_bytes());
    ep.post_write(
        rings.meta_mr.window(meta::RESP_TAIL_SCRATCH as u32, 4),
        rings.remote.at_offset(layout::RESP_TAIL as u64),
        wr::WRITE_RESPONSE_META,
        if notify_imm { Some(new_transmit) } else { None },
    )
}
