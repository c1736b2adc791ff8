//! RDMA transport primitives behind a small seam.
//!
//! The backend and the host library speak to the fabric through the
//! [`Fabric`]/[`Listener`]/[`Endpoint`] traits: register memory, post
//! send/recv and one-sided read/write work requests, poll completions, and
//! poll connection-manager events. Two implementations exist:
//!
//! - [`verbs`] (feature `rdma`): reliable-connected queue pairs over
//!   libibverbs/librdmacm, one protection domain and completion queue per
//!   connection, all work requests signaled,
//! - [`loopback`]: an in-process fabric whose one-sided operations are
//!   memcpys against registered regions, used by the integration tests.
//!
//! Both deliver completions in post order per connection and surface every
//! failure as an [`RdmaError`]; nothing at this layer retries.

pub mod loopback;
#[cfg(feature = "rdma")]
pub mod verbs;

use std::sync::Arc;

use crate::ring::DmaRegion;

/// Errors surfaced by the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum RdmaError {
    #[error("{op} failed: {msg}")]
    Op { op: &'static str, msg: String },

    #[error("work request {wr_id} completed with status {status}")]
    Completion { wr_id: u64, status: i32 },

    #[error("connection closed")]
    Closed,

    #[error("connection rejected by peer")]
    Rejected,

    #[error("invalid address {0}")]
    Address(String),

    #[error("remote access out of bounds (rkey {rkey}, addr {addr:#x}, len {len})")]
    RemoteAccess { rkey: u32, addr: u64, len: u32 },
}

impl RdmaError {
    pub(crate) fn op(op: &'static str, msg: impl Into<String>) -> Self {
        RdmaError::Op {
            op,
            msg: msg.into(),
        }
    }
}

/// Completed work request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrOpcode {
    Send,
    Recv,
    RdmaRead,
    RdmaWrite,
    /// Recv consumed by a peer write-with-immediate.
    RecvWithImm,
}

/// One work completion.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub wr_id: u64,
    pub opcode: WrOpcode,
    pub byte_len: u32,
    pub imm: Option<u32>,
}

/// Descriptor of locally registered memory (or a window into it).
///
/// `lkey` authorizes local work requests; `rkey` is what the peer needs to
/// address this memory remotely.
#[derive(Debug, Clone, Copy)]
pub struct LocalMr {
    pub addr: u64,
    pub len: u32,
    pub lkey: u32,
    pub rkey: u32,
}

impl LocalMr {
    /// A window into the registered range.
    pub fn window(&self, offset: u32, len: u32) -> LocalMr {
        debug_assert!(offset + len <= self.len);
        LocalMr {
            addr: self.addr + offset as u64,
            len,
            lkey: self.lkey,
            rkey: self.rkey,
        }
    }
}

/// Descriptor of remote memory addressable by one-sided operations.
#[derive(Debug, Clone, Copy)]
pub struct RemoteMr {
    pub addr: u64,
    pub rkey: u32,
}

impl RemoteMr {
    pub fn at_offset(&self, offset: u64) -> RemoteMr {
        RemoteMr {
            addr: self.addr + offset,
            rkey: self.rkey,
        }
    }
}

/// Queue-pair sizing for a connection.
#[derive(Debug, Clone, Copy)]
pub struct QpConfig {
    pub send_depth: u32,
    pub recv_depth: u32,
    pub max_sge: u32,
}

impl QpConfig {
    pub fn control() -> Self {
        Self {
            send_depth: crate::constants::CTRL_QUEUE_DEPTH,
            recv_depth: crate::constants::CTRL_QUEUE_DEPTH,
            max_sge: 1,
        }
    }

    pub fn buffer() -> Self {
        Self {
            send_depth: crate::constants::BUFF_QUEUE_DEPTH,
            recv_depth: crate::constants::BUFF_QUEUE_DEPTH,
            max_sge: 1,
        }
    }
}

/// One connected transport endpoint (a queue pair plus its completion
/// queue).
pub trait Endpoint {
    /// Stable identity used to map CM events back to sessions.
    fn id(&self) -> u64;

    /// Register a memory region for local and remote access with
    /// `{LocalWrite, RemoteRead, RemoteWrite}`, returning its descriptor.
    /// The registration pins the region for the endpoint's lifetime.
    fn register(&self, region: &Arc<DmaRegion>) -> Result<LocalMr, RdmaError>;

    fn post_recv(&self, buf: LocalMr, wr_id: u64) -> Result<(), RdmaError>;

    fn post_send(&self, buf: LocalMr, wr_id: u64) -> Result<(), RdmaError>;

    fn post_read(&self, local: LocalMr, remote: RemoteMr, wr_id: u64) -> Result<(), RdmaError>;

    fn post_write(
        &self,
        local: LocalMr,
        remote: RemoteMr,
        wr_id: u64,
        imm: Option<u32>,
    ) -> Result<(), RdmaError>;

    /// Non-blocking completion poll.
    fn poll(&self) -> Result<Option<Completion>, RdmaError>;

    /// Block until one completion arrives. Used only by host handshakes.
    fn wait(&self) -> Result<Completion, RdmaError>;

    /// Initiate connection teardown.
    fn disconnect(&self);
}

/// A connection request awaiting accept/reject.
///
/// Accepting is two-phase so the passive side can post its first receive
/// between queue-pair creation and the handshake completion; the peer may
/// send the moment the accept lands.
pub trait PendingConn {
    type Endpoint: Endpoint;

    /// The single byte of connection private data.
    fn private_data(&self) -> u8;

    /// Build the queue pair and its completion queue for this connection.
    fn create_endpoint(&self, qp: QpConfig) -> Result<Self::Endpoint, RdmaError>;

    /// Complete the handshake. The endpoint from [`create_endpoint`]
    /// becomes live; the peer's connect call unblocks.
    ///
    /// [`create_endpoint`]: PendingConn::create_endpoint
    fn accept(self) -> Result<(), RdmaError>;

    fn reject(self);
}

/// Connection-manager events delivered to the backend listener.
pub enum CmEvent<P> {
    /// A peer asked to connect; accept or reject the pending connection.
    ConnectRequest(P),
    /// The connection for endpoint `id` is established.
    Established { id: u64 },
    /// The peer for endpoint `id` disconnected.
    Disconnected { id: u64 },
    /// Address resolution failed, the peer is unreachable, or the device
    /// went away.
    Error { id: u64, what: &'static str },
}

/// Passive side of the fabric: accepts connections, reports CM events.
pub trait Listener {
    type Endpoint: Endpoint;
    type Pending: PendingConn<Endpoint = Self::Endpoint>;

    /// Non-blocking CM event poll.
    fn poll_event(&self) -> Result<Option<CmEvent<Self::Pending>>, RdmaError>;
}

/// A transport provider.
pub trait Fabric {
    type Endpoint: Endpoint + Send;
    type Pending: PendingConn<Endpoint = Self::Endpoint>;
    type Listener: Listener<Endpoint = Self::Endpoint, Pending = Self::Pending>;

    /// Bind and listen at `addr` (`ip:port`).
    fn listen(&self, addr: &str) -> Result<Self::Listener, RdmaError>;

    /// Connect to `addr`, carrying one byte of private data identifying the
    /// channel kind. Blocks until established or failed.
    fn connect(
        &self,
        addr: &str,
        private_data: u8,
        qp: QpConfig,
    ) -> Result<Self::Endpoint, RdmaError>;
}

/// Private-data byte identifying a control channel.
pub const CTRL_CONN_PRIV_DATA: u8 = 0xC5;

/// Private-data byte identifying a buffer (ring transport) channel.
pub const BUFF_CONN_PRIV_DATA: u8 = 0xB5;
