//! In-process loopback fabric.
//!
//! Implements the transport seam with plain memory: registered regions go
//! into a fabric-wide table keyed by rkey, one-sided reads and writes are
//! bounds-checked memcpys against them, and sends copy into the peer's
//! posted receive buffer. Completions are queued in post order per
//! endpoint, which preserves the in-order-delivery assumption the ring
//! protocol relies on.
//!
//! This is the test vehicle for the whole dataplane; production deployments
//! use the verbs fabric.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use super::{
    CmEvent, Completion, Endpoint, Fabric, Listener, LocalMr, PendingConn, QpConfig, RdmaError,
    RemoteMr, WrOpcode,
};
use crate::ring::DmaRegion;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct FabricInner {
    next_ep_id: u64,
    next_key: u32,
    /// rkey -> pinned region. Registration keeps the region alive so
    /// one-sided operations can never land in freed memory.
    regions: HashMap<u32, Arc<DmaRegion>>,
    listeners: HashMap<String, Arc<ListenerShared>>,
}

/// In-process stand-in for an RDMA-capable NIC pair.
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    inner: Arc<Mutex<FabricInner>>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }
}

struct EpInner {
    /// Posted receives, each pinning its landing region.
    recvs: VecDeque<(LocalMr, u64, Arc<DmaRegion>)>,
    completions: VecDeque<Completion>,
    open: bool,
}

struct EpState {
    id: u64,
    inner: Mutex<EpInner>,
    cv: Condvar,
}

impl EpState {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Mutex::new(EpInner {
                recvs: VecDeque::new(),
                completions: VecDeque::new(),
                open: true,
            }),
            cv: Condvar::new(),
        })
    }

    fn push_completion(&self, c: Completion) {
        self.inner.lock().unwrap().completions.push_back(c);
        self.cv.notify_all();
    }

    fn close(&self) {
        self.inner.lock().unwrap().open = false;
        self.cv.notify_all();
    }
}

struct ListenerShared {
    events: Mutex<VecDeque<CmEvent<LoopbackPending>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendState {
    Waiting,
    Accepted,
    Rejected,
}

struct PendShared {
    state: Mutex<PendState>,
    cv: Condvar,
}

/// A loopback connection request parked at the listener.
pub struct LoopbackPending {
    fabric: Arc<Mutex<FabricInner>>,
    private_data: u8,
    host_ep: Arc<EpState>,
    backend_ep: Arc<EpState>,
    listener: Arc<ListenerShared>,
    pend: Arc<PendShared>,
}

pub struct LoopbackEndpoint {
    fabric: Arc<Mutex<FabricInner>>,
    me: Arc<EpState>,
    peer: Arc<EpState>,
    /// Where to announce our disconnect: the listener tracking the peer
    /// endpoint, if the peer is the passive side.
    notify: Option<(Arc<ListenerShared>, u64)>,
}

pub struct LoopbackListener {
    shared: Arc<ListenerShared>,
}

// SAFETY: raw addresses are only dereferenced inside bounds-checked copies
// while the owning regions are registered.
unsafe fn copy_bytes(src: u64, dst: u64, len: usize) {
    // The ring protocol tolerates stale or torn reads (it re-polls); the
    // fences keep published cursor updates from being reordered around the
    // bulk copy.
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Resolve and bounds-check a remote range, returning the pinned region.
fn resolve_remote(
    fabric: &Mutex<FabricInner>,
    remote: RemoteMr,
    len: u32,
) -> Result<Arc<DmaRegion>, RdmaError> {
    let inner = fabric.lock().unwrap();
    match inner.regions.get(&remote.rkey) {
        Some(region)
            if remote.addr >= region.base_addr()
                && remote.addr + len as u64 <= region.base_addr() + region.len() as u64 =>
        {
            Ok(region.clone())
        }
        _ => Err(RdmaError::RemoteAccess {
            rkey: remote.rkey,
            addr: remote.addr,
            len,
        }),
    }
}

impl Endpoint for LoopbackEndpoint {
    fn id(&self) -> u64 {
        self.me.id
    }

    fn register(&self, region: &Arc<DmaRegion>) -> Result<LocalMr, RdmaError> {
        let mut inner = self.fabric.lock().unwrap();
        inner.next_key += 1;
        let key = inner.next_key;
        inner.regions.insert(key, region.clone());
        Ok(LocalMr {
            addr: region.base_addr(),
            len: region.len() as u32,
            lkey: key,
            rkey: key,
        })
    }

    fn post_recv(&self, buf: LocalMr, wr_id: u64) -> Result<(), RdmaError> {
        let pinned = resolve_remote(
            &self.fabric,
            RemoteMr {
                addr: buf.addr,
                rkey: buf.lkey,
            },
            buf.len,
        )?;
        let mut inner = self.me.inner.lock().unwrap();
        if !inner.open {
            return Err(RdmaError::Closed);
        }
        inner.recvs.push_back((buf, wr_id, pinned));
        Ok(())
    }

    fn post_send(&self, buf: LocalMr, wr_id: u64) -> Result<(), RdmaError> {
        {
            let mut peer = self.peer.inner.lock().unwrap();
            if !peer.open {
                return Err(RdmaError::Closed);
            }
            let (dst, recv_wr, _pinned) = peer
                .recvs
                .pop_front()
                .ok_or_else(|| RdmaError::op("post_send", "peer has no receive posted"))?;
            let len = buf.len.min(dst.len) as usize;
            // SAFETY: both descriptors come from register() and stay live
            // for the session.
            unsafe { copy_bytes(buf.addr, dst.addr, len) };
            peer.completions.push_back(Completion {
                wr_id: recv_wr,
                opcode: WrOpcode::Recv,
                byte_len: len as u32,
                imm: None,
            });
        }
        self.peer.cv.notify_all();
        self.me.push_completion(Completion {
            wr_id,
            opcode: WrOpcode::Send,
            byte_len: buf.len,
            imm: None,
        });
        Ok(())
    }

    fn post_read(&self, local: LocalMr, remote: RemoteMr, wr_id: u64) -> Result<(), RdmaError> {
        if !self.me.inner.lock().unwrap().open {
            return Err(RdmaError::Closed);
        }
        let _pinned = resolve_remote(&self.fabric, remote, local.len)?;
        // SAFETY: remote range bounds-checked and pinned by its
        // registration.
        unsafe { copy_bytes(remote.addr, local.addr, local.len as usize) };
        self.me.push_completion(Completion {
            wr_id,
            opcode: WrOpcode::RdmaRead,
            byte_len: local.len,
            imm: None,
        });
        Ok(())
    }

    fn post_write(
        &self,
        local: LocalMr,
        remote: RemoteMr,
        wr_id: u64,
        imm: Option<u32>,
    ) -> Result<(), RdmaError> {
        if !self.me.inner.lock().unwrap().open {
            return Err(RdmaError::Closed);
        }
        let _pinned = resolve_remote(&self.fabric, remote, local.len)?;
        // SAFETY: remote range bounds-checked and pinned by its
        // registration.
        unsafe { copy_bytes(local.addr, remote.addr, local.len as usize) };
        self.me.push_completion(Completion {
            wr_id,
            opcode: WrOpcode::RdmaWrite,
            byte_len: local.len,
            imm: None,
        });

        if let Some(value) = imm {
            let mut peer = self.peer.inner.lock().unwrap();
            match peer.recvs.pop_front() {
                Some((_, recv_wr, _pinned)) => {
                    peer.completions.push_back(Completion {
                        wr_id: recv_wr,
                        opcode: WrOpcode::RecvWithImm,
                        byte_len: 0,
                        imm: Some(value),
                    });
                    drop(peer);
                    self.peer.cv.notify_all();
                }
                None => {
                    warn!("write-with-immediate dropped: peer has no receive posted");
                }
            }
        }
        Ok(())
    }

    fn poll(&self) -> Result<Option<Completion>, RdmaError> {
        let mut inner = self.me.inner.lock().unwrap();
        if let Some(c) = inner.completions.pop_front() {
            return Ok(Some(c));
        }
        if !inner.open {
            return Err(RdmaError::Closed);
        }
        Ok(None)
    }

    fn wait(&self) -> Result<Completion, RdmaError> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        let mut inner = self.me.inner.lock().unwrap();
        loop {
            if let Some(c) = inner.completions.pop_front() {
                return Ok(c);
            }
            if !inner.open {
                return Err(RdmaError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RdmaError::op("wait", "timed out waiting for completion"));
            }
            let (guard, _) = self
                .me
                .cv
                .wait_timeout(inner, deadline - now)
                .map_err(|_| RdmaError::op("wait", "poisoned"))?;
            inner = guard;
        }
    }

    fn disconnect(&self) {
        self.me.close();
        self.peer.close();
        if let Some((listener, peer_id)) = &self.notify {
            listener
                .events
                .lock()
                .unwrap()
                .push_back(CmEvent::Disconnected { id: *peer_id });
        }
    }
}

impl PendingConn for LoopbackPending {
    type Endpoint = LoopbackEndpoint;

    fn private_data(&self) -> u8 {
        self.private_data
    }

    fn create_endpoint(&self, _qp: QpConfig) -> Result<LoopbackEndpoint, RdmaError> {
        Ok(LoopbackEndpoint {
            fabric: self.fabric.clone(),
            me: self.backend_ep.clone(),
            peer: self.host_ep.clone(),
            notify: None,
        })
    }

    fn accept(self) -> Result<(), RdmaError> {
        *self.pend.state.lock().unwrap() = PendState::Accepted;
        self.pend.cv.notify_all();
        self.listener
            .events
            .lock()
            .unwrap()
            .push_back(CmEvent::Established {
                id: self.backend_ep.id,
            });
        Ok(())
    }

    fn reject(self) {
        *self.pend.state.lock().unwrap() = PendState::Rejected;
        self.pend.cv.notify_all();
    }
}

impl Listener for LoopbackListener {
    type Endpoint = LoopbackEndpoint;
    type Pending = LoopbackPending;

    fn poll_event(&self) -> Result<Option<CmEvent<LoopbackPending>>, RdmaError> {
        Ok(self.shared.events.lock().unwrap().pop_front())
    }
}

impl Fabric for LoopbackFabric {
    type Endpoint = LoopbackEndpoint;
    type Pending = LoopbackPending;
    type Listener = LoopbackListener;

    fn listen(&self, addr: &str) -> Result<LoopbackListener, RdmaError> {
        let shared = Arc::new(ListenerShared {
            events: Mutex::new(VecDeque::new()),
        });
        let mut inner = self.inner.lock().unwrap();
        if inner.listeners.contains_key(addr) {
            return Err(RdmaError::Address(format!("{addr} already bound")));
        }
        inner.listeners.insert(addr.to_string(), shared.clone());
        Ok(LoopbackListener { shared })
    }

    fn connect(
        &self,
        addr: &str,
        private_data: u8,
        _qp: QpConfig,
    ) -> Result<LoopbackEndpoint, RdmaError> {
        let (listener, host_ep, backend_ep) = {
            let mut inner = self.inner.lock().unwrap();
            let listener = inner
                .listeners
                .get(addr)
                .cloned()
                .ok_or_else(|| RdmaError::Address(format!("{addr} is not listening")))?;
            inner.next_ep_id += 1;
            let host_ep = EpState::new(inner.next_ep_id);
            inner.next_ep_id += 1;
            let backend_ep = EpState::new(inner.next_ep_id);
            (listener, host_ep, backend_ep)
        };

        let pend = Arc::new(PendShared {
            state: Mutex::new(PendState::Waiting),
            cv: Condvar::new(),
        });
        listener
            .events
            .lock()
            .unwrap()
            .push_back(CmEvent::ConnectRequest(LoopbackPending {
                fabric: self.inner.clone(),
                private_data,
                host_ep: host_ep.clone(),
                backend_ep: backend_ep.clone(),
                listener: listener.clone(),
                pend: pend.clone(),
            }));

        // Wait for the passive side to accept or reject.
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        let mut state = pend.state.lock().unwrap();
        loop {
            match *state {
                PendState::Accepted => break,
                PendState::Rejected => return Err(RdmaError::Rejected),
                PendState::Waiting => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RdmaError::op("connect", "timed out"));
            }
            let (guard, _) = pend
                .cv
                .wait_timeout(state, deadline - now)
                .map_err(|_| RdmaError::op("connect", "poisoned"))?;
            state = guard;
        }

        let backend_id = backend_ep.id;
        Ok(LoopbackEndpoint {
            fabric: self.inner.clone(),
            me: host_ep,
            peer: backend_ep,
            notify: Some((listener, backend_id)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fabric_pair(addr: &str) -> (LoopbackFabric, LoopbackListener) {
        let fabric = LoopbackFabric::new();
        let listener = fabric.listen(addr).unwrap();
        (fabric, listener)
    }

    fn accept_one(listener: &LoopbackListener) -> LoopbackEndpoint {
        loop {
            if let Some(CmEvent::ConnectRequest(pending)) = listener.poll_event().unwrap() {
                let ep = pending.create_endpoint(QpConfig::control()).unwrap();
                pending.accept().unwrap();
                return ep;
            }
            std::thread::yield_now();
        }
    }

    #[test]
    fn test_send_recv_round_trip() {
        let (fabric, listener) = fabric_pair("10.0.0.1:4420");

        let accepted = std::thread::spawn({
            let fabric = fabric.clone();
            move || fabric.connect("10.0.0.1:4420", 0x01, QpConfig::control()).unwrap()
        });
        let backend = accept_one(&listener);
        let host = accepted.join().unwrap();

        let host_buf = Arc::new(DmaRegion::alloc(4096));
        let backend_buf = Arc::new(DmaRegion::alloc(4096));
        let host_mr = host.register(&host_buf).unwrap();
        let backend_mr = backend.register(&backend_buf).unwrap();

        backend.post_recv(backend_mr.window(0, 16), 9).unwrap();
        host_buf.write_at(0, b"ping");
        host.post_send(host_mr.window(0, 4), 1).unwrap();

        let send_done = host.wait().unwrap();
        assert_eq!(send_done.opcode, WrOpcode::Send);

        let recv = backend.poll().unwrap().unwrap();
        assert_eq!(recv.opcode, WrOpcode::Recv);
        assert_eq!(recv.wr_id, 9);
        let mut got = [0u8; 4];
        backend_buf.read_at(0, &mut got);
        assert_eq!(&got, b"ping");
    }

    #[test]
    fn test_one_sided_read_write_and_bounds() {
        let (fabric, listener) = fabric_pair("10.0.0.2:4420");
        let accepted = std::thread::spawn({
            let fabric = fabric.clone();
            move || fabric.connect("10.0.0.2:4420", 0x02, QpConfig::buffer()).unwrap()
        });
        let backend = accept_one(&listener);
        let host = accepted.join().unwrap();

        let host_area = Arc::new(DmaRegion::alloc(8192));
        let mirror = Arc::new(DmaRegion::alloc(8192));
        let host_mr = host.register(&host_area).unwrap();
        let mirror_mr = backend.register(&mirror).unwrap();

        host_area.write_at(100, b"remote data");
        let remote = RemoteMr {
            addr: host_mr.addr + 100,
            rkey: host_mr.lkey,
        };
        backend.post_read(mirror_mr.window(0, 11), remote, 5).unwrap();
        let c = backend.poll().unwrap().unwrap();
        assert_eq!(c.opcode, WrOpcode::RdmaRead);
        let mut got = [0u8; 11];
        mirror.read_at(0, &mut got);
        assert_eq!(&got, b"remote data");

        // Write back with modification.
        mirror.write_at(0, b"REMOTE");
        backend.post_write(mirror_mr.window(0, 6), remote, 6, None).unwrap();
        backend.poll().unwrap().unwrap();
        let mut host_got = [0u8; 6];
        host_area.read_at(100, &mut host_got);
        assert_eq!(&host_got, b"REMOTE");

        // Out-of-bounds access is refused.
        let bad = RemoteMr {
            addr: host_mr.addr + 8191,
            rkey: host_mr.lkey,
        };
        assert!(matches!(
            backend.post_read(mirror_mr.window(0, 16), bad, 7),
            Err(RdmaError::RemoteAccess { .. })
        ));
    }

    #[test]
    fn test_reject_and_disconnect() {
        let (fabric, listener) = fabric_pair("10.0.0.3:4420");
        let connecting = std::thread::spawn({
            let fabric = fabric.clone();
            move || fabric.connect("10.0.0.3:4420", 0x03, QpConfig::control())
        });
        loop {
            if let Some(CmEvent::ConnectRequest(pending)) = listener.poll_event().unwrap() {
                pending.reject();
                break;
            }
            std::thread::yield_now();
        }
        assert!(matches!(connecting.join().unwrap(), Err(RdmaError::Rejected)));

        // Disconnect notice reaches the listener.
        let accepted = std::thread::spawn({
            let fabric = fabric.clone();
            move || fabric.connect("10.0.0.3:4420", 0x03, QpConfig::control()).unwrap()
        });
        let backend = accept_one(&listener);
        // Drain the Established event.
        while let Some(event) = listener.poll_event().unwrap() {
            if matches!(event, CmEvent::Established { .. }) {
                break;
            }
        }
        let host = accepted.join().unwrap();
        host.disconnect();

        loop {
            if let Some(CmEvent::Disconnected { id }) = listener.poll_event().unwrap() {
                assert_eq!(id, backend.id());
                break;
            }
            std::thread::yield_now();
        }
        assert!(matches!(backend.poll(), Err(RdmaError::Closed)));
    }
}
