//! Per-client session state.
//!
//! The backend keeps two fixed slot arrays: control sessions (typed
//! messages) and buffer sessions (ring transport). A slot cycles
//! Available -> Occupied (handshake in progress) -> Connected -> Available.
//! Buffers are allocated once per slot and re-registered per connection.

use std::sync::Arc;

use tracing::info;

use crate::constants::{
    CTRL_MSG_SIZE, MAX_OUTSTANDING_IO, REQUEST_RING_BYTES, RESPONSE_RING_BYTES,
};
use crate::rdma::{Endpoint, LocalMr, RemoteMr};
use crate::ring::response::ResponseTails;
use crate::ring::{DmaRegion, SplitState};
use crate::service::{ControlCompletion, DataRequest};
use crate::wire::MsgId;

/// Lifecycle of a session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    Available,
    /// Connection accepted, handshake not yet complete.
    Occupied,
    Connected,
}

/// Offset of the receive staging area inside a session's message buffer.
pub const RECV_BUF_OFF: usize = 0;
/// Offset of the send staging area inside a session's message buffer.
pub const SEND_BUF_OFF: usize = CTRL_MSG_SIZE;

const MSG_REGION_BYTES: usize = 4096;

/// The single outstanding control operation of a session.
pub struct PendingControl {
    pub ack_id: MsgId,
    pub completion: Arc<ControlCompletion>,
}

/// A control channel session slot.
pub struct ControlSession<E: Endpoint> {
    pub id: u32,
    pub state: ConnState,
    pub ep: Option<E>,
    pub msg_buf: Arc<DmaRegion>,
    pub msg_mr: Option<LocalMr>,
    pub pending: Option<PendingControl>,
}

impl<E: Endpoint> ControlSession<E> {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            state: ConnState::Available,
            ep: None,
            msg_buf: Arc::new(DmaRegion::alloc(MSG_REGION_BYTES)),
            msg_mr: None,
            pending: None,
        }
    }

    pub fn recv_mr(&self) -> LocalMr {
        self.msg_mr
            .expect("session has a registered message buffer")
            .window(RECV_BUF_OFF as u32, CTRL_MSG_SIZE as u32)
    }

    pub fn send_mr(&self, len: usize) -> LocalMr {
        self.msg_mr
            .expect("session has a registered message buffer")
            .window(SEND_BUF_OFF as u32, len as u32)
    }

    /// Release the connection and return the slot to Available.
    pub fn teardown(&mut self) {
        if let Some(ep) = self.ep.take() {
            ep.disconnect();
        }
        self.msg_mr = None;
        self.pending = None;
        self.state = ConnState::Available;
        info!(slot = self.id, "control session released");
    }
}

/// Ring transport state of a bound buffer session.
pub struct RingState {
    /// Host DMA area.
    pub remote: RemoteMr,
    /// Local mirror of the request ring. Shared with in-flight data
    /// operations, which hold payload views into it.
    pub req_mirror: Arc<DmaRegion>,
    pub req_mirror_mr: LocalMr,
    /// Local staging of the response ring. Shared with in-flight data
    /// operations, which hold response slots into it.
    pub resp_staging: Arc<DmaRegion>,
    pub resp_staging_mr: LocalMr,
    /// Landing area for metadata reads plus cursor scratch words.
    pub meta: Arc<DmaRegion>,
    pub meta_mr: LocalMr,
    /// Consumer cursor over the request ring.
    pub req_head: u32,
    /// Size of the in-flight request fetch.
    pub fetch_bytes: u32,
    pub fetch_split: SplitState,
    pub resp_tails: ResponseTails,
    pub resp_split: SplitState,
    /// Fixed ring of request contexts; slots recycle as responses are
    /// transmitted.
    pub contexts: Vec<DataRequest>,
    pub next_context: usize,
}

impl RingState {
    pub fn new<E: Endpoint>(ep: &E, remote: RemoteMr) -> Result<Self, crate::rdma::RdmaError> {
        let req_mirror = Arc::new(DmaRegion::alloc(REQUEST_RING_BYTES as usize));
        let resp_staging = Arc::new(DmaRegion::alloc(RESPONSE_RING_BYTES as usize));
        let meta = Arc::new(DmaRegion::alloc(4096));
        let req_mirror_mr = ep.register(&req_mirror)?;
        let resp_staging_mr = ep.register(&resp_staging)?;
        let meta_mr = ep.register(&meta)?;
        Ok(Self {
            remote,
            req_mirror,
            req_mirror_mr,
            resp_staging,
            resp_staging_mr,
            meta,
            meta_mr,
            req_head: 0,
            fetch_bytes: 0,
            fetch_split: SplitState::NotSplit,
            resp_tails: ResponseTails::new(),
            resp_split: SplitState::NotSplit,
            contexts: vec![DataRequest::default(); MAX_OUTSTANDING_IO],
            next_context: 0,
        })
    }
}

/// A buffer channel session slot.
pub struct BufferSession<E: Endpoint> {
    pub id: u32,
    pub state: ConnState,
    pub ep: Option<E>,
    pub msg_buf: Arc<DmaRegion>,
    pub msg_mr: Option<LocalMr>,
    /// Control session this transport is bound to.
    pub client_id: Option<u32>,
    pub rings: Option<RingState>,
}

impl<E: Endpoint> BufferSession<E> {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            state: ConnState::Available,
            ep: None,
            msg_buf: Arc::new(DmaRegion::alloc(MSG_REGION_BYTES)),
            msg_mr: None,
            client_id: None,
            rings: None,
        }
    }

    pub fn recv_mr(&self) -> LocalMr {
        self.msg_mr
            .expect("session has a registered message buffer")
            .window(RECV_BUF_OFF as u32, CTRL_MSG_SIZE as u32)
    }

    pub fn send_mr(&self, len: usize) -> LocalMr {
        self.msg_mr
            .expect("session has a registered message buffer")
            .window(SEND_BUF_OFF as u32, len as u32)
    }

    /// Release the connection, its rings, and return the slot to
    /// Available. In-flight operations are abandoned.
    pub fn teardown(&mut self) {
        if let Some(ep) = self.ep.take() {
            ep.disconnect();
        }
        self.msg_mr = None;
        self.rings = None;
        self.client_id = None;
        self.state = ConnState::Available;
        info!(slot = self.id, "buffer session released");
    }
}
