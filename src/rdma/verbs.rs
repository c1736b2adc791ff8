//! Verbs fabric over libibverbs/librdmacm.
//!
//! Reliable-connected queue pairs negotiated through the RDMA connection
//! manager. The listener's event channel is non-blocking so the backend
//! event loop can poll it; the host side uses a blocking channel during
//! its connect dance. Every work request is posted signaled; nothing here
//! retries.

use std::ffi::CStr;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rdma_sys::*;
use tracing::{error, trace};

use super::{
    CmEvent, Completion, Endpoint, Fabric, Listener, LocalMr, PendingConn, QpConfig, RdmaError,
    RemoteMr, WrOpcode,
};
use crate::constants::{LISTEN_BACKLOG, RESOLVE_TIMEOUT_MS};
use crate::ring::DmaRegion;

fn errno_msg(op: &'static str) -> RdmaError {
    RdmaError::op(op, std::io::Error::last_os_error().to_string())
}

fn parse_addr(addr: &str) -> Result<(libc::sockaddr_in, SocketAddr), RdmaError> {
    let sockaddr: SocketAddr = addr
        .parse()
        .map_err(|_| RdmaError::Address(addr.to_string()))?;
    let SocketAddr::V4(v4) = sockaddr else {
        return Err(RdmaError::Address(addr.to_string()));
    };
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
    sin.sin_port = v4.port().to_be();
    Ok((sin, sockaddr))
}

/// Set a CM event channel non-blocking so it can be polled.
fn set_nonblocking(channel: *mut rdma_event_channel) -> Result<(), RdmaError> {
    // SAFETY: the channel fd is owned by the channel for its lifetime.
    unsafe {
        let fd = (*channel).fd;
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags == -1 {
            return Err(errno_msg("fcntl F_GETFL"));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(errno_msg("fcntl F_SETFL O_NONBLOCK"));
        }
    }
    Ok(())
}

/// The libibverbs transport provider.
#[derive(Default)]
pub struct VerbsFabric;

impl VerbsFabric {
    pub fn new() -> Self {
        Self
    }
}

/// Queue pair plus its completion queue and registrations for one
/// connection.
struct EpInner {
    cm_id: *mut rdma_cm_id,
    pd: *mut ibv_pd,
    comp_channel: *mut ibv_comp_channel,
    cq: *mut ibv_cq,
    qp: *mut ibv_qp,
    mrs: Mutex<Vec<*mut ibv_mr>>,
    /// Registered regions pinned for the endpoint's lifetime.
    pinned: Mutex<Vec<Arc<DmaRegion>>>,
    /// The event channel the cm id was created on, when this endpoint owns
    /// one (host-side connects). Null for accepted connections, whose ids
    /// live on the listener's channel.
    channel: *mut rdma_event_channel,
    /// Set once `rdma_disconnect` has been issued.
    disconnected: AtomicBool,
}

// SAFETY: the verbs objects are only driven from one thread at a time; the
// registration list is behind a mutex.
unsafe impl Send for EpInner {}
unsafe impl Sync for EpInner {}

impl Drop for EpInner {
    fn drop(&mut self) {
        // SAFETY: teardown mirrors construction order in reverse; every
        // pointer was checked non-null at creation. The cm id is destroyed
        // here for both host-created and accepted connections, after a
        // disconnect if none was issued; the owned event channel goes last,
        // once no id is left on it.
        unsafe {
            if !self.disconnected.swap(true, Ordering::AcqRel) {
                rdma_disconnect(self.cm_id);
            }
            for mr in self.mrs.lock().unwrap().drain(..) {
                ibv_dereg_mr(mr);
            }
            if !self.qp.is_null() {
                rdma_destroy_qp(self.cm_id);
            }
            if !self.cq.is_null() {
                ibv_destroy_cq(self.cq);
            }
            if !self.comp_channel.is_null() {
                ibv_destroy_comp_channel(self.comp_channel);
            }
            if !self.pd.is_null() {
                ibv_dealloc_pd(self.pd);
            }
            if !self.cm_id.is_null() {
                rdma_destroy_id(self.cm_id);
            }
            if !self.channel.is_null() {
                rdma_destroy_event_channel(self.channel);
            }
        }
    }
}

/// A connected verbs endpoint.
pub struct VerbsEndpoint {
    inner: Arc<EpInner>,
}

/// Build pd/cq/qp on a cm id, per-connection.
///
/// `channel` hands ownership of the id's event channel to the endpoint
/// (host-side connects); accepted connections pass null.
fn build_qp(
    cm_id: *mut rdma_cm_id,
    qp_config: QpConfig,
    channel: *mut rdma_event_channel,
) -> Result<VerbsEndpoint, RdmaError> {
    // SAFETY: cm_id is a live id with a bound verbs context.
    unsafe {
        let verbs = (*cm_id).verbs;
        let pd = ibv_alloc_pd(verbs);
        if pd.is_null() {
            return Err(errno_msg("ibv_alloc_pd"));
        }

        let comp_channel = ibv_create_comp_channel(verbs);
        if comp_channel.is_null() {
            ibv_dealloc_pd(pd);
            return Err(errno_msg("ibv_create_comp_channel"));
        }

        let cq_depth = (qp_config.send_depth + qp_config.recv_depth) as i32 * 2;
        let cq = ibv_create_cq(verbs, cq_depth, std::ptr::null_mut(), comp_channel, 0);
        if cq.is_null() {
            ibv_destroy_comp_channel(comp_channel);
            ibv_dealloc_pd(pd);
            return Err(errno_msg("ibv_create_cq"));
        }

        if ibv_req_notify_cq(cq, 0) != 0 {
            ibv_destroy_cq(cq);
            ibv_destroy_comp_channel(comp_channel);
            ibv_dealloc_pd(pd);
            return Err(errno_msg("ibv_req_notify_cq"));
        }

        let mut attr: ibv_qp_init_attr = std::mem::zeroed();
        attr.cap.max_send_wr = qp_config.send_depth;
        attr.cap.max_recv_wr = qp_config.recv_depth;
        attr.cap.max_send_sge = qp_config.max_sge;
        attr.cap.max_recv_sge = qp_config.max_sge;
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        attr.send_cq = cq;
        attr.recv_cq = cq;

        if rdma_create_qp(cm_id, pd, &mut attr) != 0 {
            ibv_destroy_cq(cq);
            ibv_destroy_comp_channel(comp_channel);
            ibv_dealloc_pd(pd);
            return Err(errno_msg("rdma_create_qp"));
        }

        Ok(VerbsEndpoint {
            inner: Arc::new(EpInner {
                cm_id,
                pd,
                comp_channel,
                cq,
                qp: (*cm_id).qp,
                mrs: Mutex::new(Vec::new()),
                pinned: Mutex::new(Vec::new()),
                channel,
                disconnected: AtomicBool::new(false),
            }),
        })
    }
}

impl Endpoint for VerbsEndpoint {
    fn id(&self) -> u64 {
        self.inner.cm_id as u64
    }

    fn register(&self, region: &Arc<DmaRegion>) -> Result<LocalMr, RdmaError> {
        let access = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ.0
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0;
        // SAFETY: the region is pinned below until the mr is deregistered
        // on endpoint drop.
        let mr = unsafe {
            ibv_reg_mr(
                self.inner.pd,
                region.ptr_at(0) as *mut libc::c_void,
                region.len(),
                access as i32,
            )
        };
        if mr.is_null() {
            return Err(errno_msg("ibv_reg_mr"));
        }
        self.inner.mrs.lock().unwrap().push(mr);
        self.inner.pinned.lock().unwrap().push(region.clone());
        // SAFETY: mr checked non-null above.
        let (lkey, rkey) = unsafe { ((*mr).lkey, (*mr).rkey) };
        Ok(LocalMr {
            addr: region.base_addr(),
            len: region.len() as u32,
            lkey,
            rkey,
        })
    }

    fn post_recv(&self, buf: LocalMr, wr_id: u64) -> Result<(), RdmaError> {
        let mut sge = ibv_sge {
            addr: buf.addr,
            length: buf.len,
            lkey: buf.lkey,
        };
        // SAFETY: sge and wr outlive the post call; the verbs provider
        // copies them.
        unsafe {
            let mut wr: ibv_recv_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            let mut bad: *mut ibv_recv_wr = std::ptr::null_mut();
            if ibv_post_recv(self.inner.qp, &mut wr, &mut bad) != 0 {
                return Err(errno_msg("ibv_post_recv"));
            }
        }
        Ok(())
    }

    fn post_send(&self, buf: LocalMr, wr_id: u64) -> Result<(), RdmaError> {
        let mut sge = ibv_sge {
            addr: buf.addr,
            length: buf.len,
            lkey: buf.lkey,
        };
        // SAFETY: see post_recv.
        unsafe {
            let mut wr: ibv_send_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            let mut bad: *mut ibv_send_wr = std::ptr::null_mut();
            if ibv_post_send(self.inner.qp, &mut wr, &mut bad) != 0 {
                return Err(errno_msg("ibv_post_send"));
            }
        }
        Ok(())
    }

    fn post_read(&self, local: LocalMr, remote: RemoteMr, wr_id: u64) -> Result<(), RdmaError> {
        let mut sge = ibv_sge {
            addr: local.addr,
            length: local.len,
            lkey: local.lkey,
        };
        // SAFETY: see post_recv.
        unsafe {
            let mut wr: ibv_send_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            wr.wr.rdma.remote_addr = remote.addr;
            wr.wr.rdma.rkey = remote.rkey;
            let mut bad: *mut ibv_send_wr = std::ptr::null_mut();
            if ibv_post_send(self.inner.qp, &mut wr, &mut bad) != 0 {
                return Err(errno_msg("ibv_post_send(read)"));
            }
        }
        Ok(())
    }

    fn post_write(
        &self,
        local: LocalMr,
        remote: RemoteMr,
        wr_id: u64,
        imm: Option<u32>,
    ) -> Result<(), RdmaError> {
        let mut sge = ibv_sge {
            addr: local.addr,
            length: local.len,
            lkey: local.lkey,
        };
        // SAFETY: see post_recv.
        unsafe {
            let mut wr: ibv_send_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            wr.wr.rdma.remote_addr = remote.addr;
            wr.wr.rdma.rkey = remote.rkey;
            match imm {
                Some(value) => {
                    wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM;
                    wr.imm_data_invalidated_rkey_union.imm_data = value.to_be();
                }
                None => {
                    wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
                }
            }
            let mut bad: *mut ibv_send_wr = std::ptr::null_mut();
            if ibv_post_send(self.inner.qp, &mut wr, &mut bad) != 0 {
                return Err(errno_msg("ibv_post_send(write)"));
            }
        }
        Ok(())
    }

    fn poll(&self) -> Result<Option<Completion>, RdmaError> {
        let mut wc = MaybeUninit::<ibv_wc>::zeroed();
        // SAFETY: wc is a valid out-parameter for one entry.
        let n = unsafe { ibv_poll_cq(self.inner.cq, 1, wc.as_mut_ptr()) };
        if n < 0 {
            return Err(errno_msg("ibv_poll_cq"));
        }
        if n == 0 {
            return Ok(None);
        }
        // SAFETY: one entry was written.
        let wc = unsafe { wc.assume_init() };

        if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
            return Err(RdmaError::Completion {
                wr_id: wc.wr_id,
                status: wc.status as i32,
            });
        }

        let with_imm = wc.wc_flags & ibv_wc_flags::IBV_WC_WITH_IMM.0 != 0;
        let opcode = match wc.opcode {
            ibv_wc_opcode::IBV_WC_RECV if with_imm => WrOpcode::RecvWithImm,
            ibv_wc_opcode::IBV_WC_RECV => WrOpcode::Recv,
            ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => WrOpcode::RecvWithImm,
            ibv_wc_opcode::IBV_WC_SEND => WrOpcode::Send,
            ibv_wc_opcode::IBV_WC_RDMA_READ => WrOpcode::RdmaRead,
            ibv_wc_opcode::IBV_WC_RDMA_WRITE => WrOpcode::RdmaWrite,
            other => {
                error!(?other, "unknown work completion opcode");
                return Err(RdmaError::Completion {
                    wr_id: wc.wr_id,
                    status: -1,
                });
            }
        };

        let imm = if with_imm {
            // SAFETY: the union holds immediate data when the flag is set.
            Some(u32::from_be(unsafe {
                wc.imm_data_invalidated_rkey_union.imm_data
            }))
        } else {
            None
        };

        Ok(Some(Completion {
            wr_id: wc.wr_id,
            opcode,
            byte_len: wc.byte_len,
            imm,
        }))
    }

    fn wait(&self) -> Result<Completion, RdmaError> {
        loop {
            if let Some(c) = self.poll()? {
                return Ok(c);
            }
            std::thread::yield_now();
        }
    }

    fn disconnect(&self) {
        if self.inner.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        // SAFETY: cm_id is live until drop.
        unsafe {
            rdma_disconnect(self.inner.cm_id);
        }
    }
}

/// A connect request parked on the listener's event channel.
pub struct VerbsPending {
    cm_id: *mut rdma_cm_id,
    private_data: u8,
    qp_config: std::cell::Cell<Option<QpConfig>>,
    /// Whether an endpoint took ownership of the child id.
    handed_off: std::cell::Cell<bool>,
}

// SAFETY: the pending id is owned until accept/reject.
unsafe impl Send for VerbsPending {}

impl Drop for VerbsPending {
    fn drop(&mut self) {
        if self.handed_off.get() {
            return;
        }
        // Rejected or abandoned before an endpoint was built: this is the
        // last reference to the child id.
        // SAFETY: the id is live and unowned.
        unsafe {
            rdma_destroy_id(self.cm_id);
        }
    }
}

impl PendingConn for VerbsPending {
    type Endpoint = VerbsEndpoint;

    fn private_data(&self) -> u8 {
        self.private_data
    }

    fn create_endpoint(&self, qp: QpConfig) -> Result<VerbsEndpoint, RdmaError> {
        // The child id stays on the listener's event channel; once built,
        // the endpoint destroys the id itself on drop.
        let ep = build_qp(self.cm_id, qp, std::ptr::null_mut())?;
        self.qp_config.set(Some(qp));
        self.handed_off.set(true);
        Ok(ep)
    }

    fn accept(self) -> Result<(), RdmaError> {
        let qp = self.qp_config.get().ok_or_else(|| {
            RdmaError::op("rdma_accept", "accept before create_endpoint")
        })?;
        // SAFETY: cm_id is the pending child id.
        unsafe {
            let mut param: rdma_conn_param = std::mem::zeroed();
            param.responder_resources = qp.recv_depth.min(u8::MAX as u32) as u8;
            param.initiator_depth = qp.send_depth.min(u8::MAX as u32) as u8;
            if rdma_accept(self.cm_id, &mut param) != 0 {
                return Err(errno_msg("rdma_accept"));
            }
        }
        Ok(())
    }

    fn reject(self) {
        // SAFETY: cm_id is the pending child id. Drop destroys it.
        unsafe {
            rdma_reject(self.cm_id, std::ptr::null(), 0);
        }
    }
}

/// The backend's CM listener.
pub struct VerbsListener {
    channel: *mut rdma_event_channel,
    listen_id: *mut rdma_cm_id,
}

// SAFETY: polled from the single backend thread.
unsafe impl Send for VerbsListener {}

impl Drop for VerbsListener {
    fn drop(&mut self) {
        // SAFETY: created in listen().
        unsafe {
            if !self.listen_id.is_null() {
                rdma_destroy_id(self.listen_id);
            }
            if !self.channel.is_null() {
                rdma_destroy_event_channel(self.channel);
            }
        }
    }
}

impl Listener for VerbsListener {
    type Endpoint = VerbsEndpoint;
    type Pending = VerbsPending;

    fn poll_event(&self) -> Result<Option<CmEvent<VerbsPending>>, RdmaError> {
        let mut event: *mut rdma_cm_event = std::ptr::null_mut();
        // SAFETY: the channel is non-blocking; EAGAIN means no event.
        let rc = unsafe { rdma_get_cm_event(self.channel, &mut event) };
        if rc != 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(None);
            }
            return Err(RdmaError::op("rdma_get_cm_event", errno.to_string()));
        }

        // SAFETY: event is valid until acked; everything needed is copied
        // out before the ack.
        unsafe {
            let ev = (*event).event;
            let id = (*event).id;
            trace!(
                event = ?CStr::from_ptr(rdma_event_str(ev)),
                "connection manager event"
            );

            let mapped = match ev {
                rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST => {
                    let priv_data = (*event).param.conn.private_data as *const u8;
                    let private_data = if priv_data.is_null() { 0 } else { *priv_data };
                    rdma_ack_cm_event(event);
                    return Ok(Some(CmEvent::ConnectRequest(VerbsPending {
                        cm_id: id,
                        private_data,
                        qp_config: std::cell::Cell::new(None),
                        handed_off: std::cell::Cell::new(false),
                    })));
                }
                rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => {
                    Some(CmEvent::Established { id: id as u64 })
                }
                rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => {
                    Some(CmEvent::Disconnected { id: id as u64 })
                }
                rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED => {
                    if rdma_resolve_route(id, RESOLVE_TIMEOUT_MS) != 0 {
                        error!("rdma_resolve_route failed");
                    }
                    None
                }
                rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED => None,
                rdma_cm_event_type::RDMA_CM_EVENT_ADDR_ERROR => {
                    Some(CmEvent::Error { id: id as u64, what: "address error" })
                }
                rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_ERROR => {
                    Some(CmEvent::Error { id: id as u64, what: "route error" })
                }
                rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR => {
                    Some(CmEvent::Error { id: id as u64, what: "connect error" })
                }
                rdma_cm_event_type::RDMA_CM_EVENT_UNREACHABLE => {
                    Some(CmEvent::Error { id: id as u64, what: "unreachable" })
                }
                rdma_cm_event_type::RDMA_CM_EVENT_REJECTED => {
                    Some(CmEvent::Error { id: id as u64, what: "rejected" })
                }
                rdma_cm_event_type::RDMA_CM_EVENT_DEVICE_REMOVAL => {
                    Some(CmEvent::Error { id: id as u64, what: "device removal" })
                }
                _ => Some(CmEvent::Error { id: id as u64, what: "unrecognized event" }),
            };
            rdma_ack_cm_event(event);
            Ok(mapped)
        }
    }
}

impl Fabric for VerbsFabric {
    type Endpoint = VerbsEndpoint;
    type Pending = VerbsPending;
    type Listener = VerbsListener;

    fn listen(&self, addr: &str) -> Result<VerbsListener, RdmaError> {
        let (mut sin, _) = parse_addr(addr)?;

        // SAFETY: standard librdmacm bring-up; every failure path tears
        // down what was created.
        unsafe {
            let channel = rdma_create_event_channel();
            if channel.is_null() {
                return Err(errno_msg("rdma_create_event_channel"));
            }
            if let Err(e) = set_nonblocking(channel) {
                rdma_destroy_event_channel(channel);
                return Err(e);
            }

            let mut listen_id: *mut rdma_cm_id = std::ptr::null_mut();
            if rdma_create_id(
                channel,
                &mut listen_id,
                std::ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            ) != 0
            {
                rdma_destroy_event_channel(channel);
                return Err(errno_msg("rdma_create_id"));
            }

            if rdma_bind_addr(listen_id, &mut sin as *mut _ as *mut libc::sockaddr) != 0 {
                rdma_destroy_id(listen_id);
                rdma_destroy_event_channel(channel);
                return Err(errno_msg("rdma_bind_addr"));
            }

            if rdma_listen(listen_id, LISTEN_BACKLOG) != 0 {
                rdma_destroy_id(listen_id);
                rdma_destroy_event_channel(channel);
                return Err(errno_msg("rdma_listen"));
            }

            Ok(VerbsListener { channel, listen_id })
        }
    }

    fn connect(
        &self,
        addr: &str,
        private_data: u8,
        qp: QpConfig,
    ) -> Result<VerbsEndpoint, RdmaError> {
        let (mut sin, _) = parse_addr(addr)?;

        // SAFETY: the active-side CM dance; the blocking event channel
        // serializes the steps.
        unsafe {
            let channel = rdma_create_event_channel();
            if channel.is_null() {
                return Err(errno_msg("rdma_create_event_channel"));
            }

            let mut cm_id: *mut rdma_cm_id = std::ptr::null_mut();
            if rdma_create_id(
                channel,
                &mut cm_id,
                std::ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            ) != 0
            {
                rdma_destroy_event_channel(channel);
                return Err(errno_msg("rdma_create_id"));
            }

            let fail = |msg: RdmaError| {
                rdma_destroy_id(cm_id);
                rdma_destroy_event_channel(channel);
                msg
            };

            if rdma_resolve_addr(
                cm_id,
                std::ptr::null_mut(),
                &mut sin as *mut _ as *mut libc::sockaddr,
                RESOLVE_TIMEOUT_MS,
            ) != 0
            {
                return Err(fail(errno_msg("rdma_resolve_addr")));
            }
            wait_cm_event(channel, rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED)
                .map_err(|e| fail(e))?;

            if rdma_resolve_route(cm_id, RESOLVE_TIMEOUT_MS) != 0 {
                return Err(fail(errno_msg("rdma_resolve_route")));
            }
            wait_cm_event(channel, rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED)
                .map_err(|e| fail(e))?;

            // The endpoint owns both the cm id and its event channel from
            // here on; failed steps below clean up through its drop.
            let ep = build_qp(cm_id, qp, channel).map_err(|e| fail(e))?;

            let mut param: rdma_conn_param = std::mem::zeroed();
            let data = [private_data];
            param.private_data = data.as_ptr() as *const libc::c_void;
            param.private_data_len = 1;
            param.responder_resources = qp.recv_depth.min(u8::MAX as u32) as u8;
            param.initiator_depth = qp.send_depth.min(u8::MAX as u32) as u8;
            param.retry_count = 7;
            param.rnr_retry_count = 7;

            if rdma_connect(cm_id, &mut param) != 0 {
                return Err(errno_msg("rdma_connect"));
            }
            wait_cm_event(channel, rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED)?;

            Ok(ep)
        }
    }
}

/// Block on a CM channel until the expected event (or a failure event)
/// arrives.
unsafe fn wait_cm_event(
    channel: *mut rdma_event_channel,
    expected: u32,
) -> Result<(), RdmaError> {
    let mut event: *mut rdma_cm_event = std::ptr::null_mut();
    if rdma_get_cm_event(channel, &mut event) != 0 {
        return Err(errno_msg("rdma_get_cm_event"));
    }
    let got = (*event).event;
    rdma_ack_cm_event(event);
    if got == expected {
        Ok(())
    } else if got == rdma_cm_event_type::RDMA_CM_EVENT_REJECTED {
        Err(RdmaError::Rejected)
    } else {
        Err(RdmaError::op(
            "rdma_get_cm_event",
            format!("unexpected event {got}"),
        ))
    }
}
