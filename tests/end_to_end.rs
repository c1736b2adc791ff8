//! End-to-end tests: host library against a live backend over the
//! loopback fabric.
//!
//! Each test boots a backend on its own thread with an in-memory file
//! service, connects the control bridge and the DMA buffer like a real
//! application, and drives the full path: control handshake, request
//! ring framing, RDMA fetch, batch execution, response staging, and
//! response consumption.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dpufs::backend::{run_backend, BackendError};
use dpufs::cache::CacheTable;
use dpufs::config::BackendConfig;
use dpufs::host::bridge::BackendBridge;
use dpufs::host::buffer::DmaBuffer;
use dpufs::host::HostError;
use dpufs::rdma::loopback::LoopbackFabric;
use dpufs::rdma::RdmaError;
use dpufs::service::memfs::{MemFileService, ROOT_DIR_ID};
use dpufs::wire::status;

const POLL_TIMEOUT: Duration = Duration::from_secs(5);

struct TestBackend {
    fabric: LoopbackFabric,
    addr: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<(), BackendError>>>,
}

impl TestBackend {
    fn start(addr: &str, max_clients: u32, max_buffs: u32) -> Self {
        let fabric = LoopbackFabric::new();
        let mut config = BackendConfig::default();
        config.network.listen_addr = addr.to_string();
        config.network.max_clients = max_clients;
        config.network.max_buffs = max_buffs;

        let cache = Arc::new(CacheTable::new(8).unwrap());
        let service = Arc::new(MemFileService::new(cache));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = std::thread::spawn({
            let fabric = fabric.clone();
            let stop = stop.clone();
            move || run_backend(&fabric, &config, service, stop)
        });

        Self {
            fabric,
            addr: addr.to_string(),
            stop,
            handle: Some(handle),
        }
    }

    /// Connect the control channel, waiting out backend startup.
    fn bridge(&self) -> BackendBridge<LoopbackFabric> {
        let deadline = Instant::now() + POLL_TIMEOUT;
        loop {
            match BackendBridge::connect(&self.fabric, &self.addr) {
                Ok(bridge) => return bridge,
                Err(HostError::Rdma(RdmaError::Address(_))) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("control connect failed: {e}"),
            }
        }
    }

    fn dma_buffer(&self, client_id: u32) -> DmaBuffer<LoopbackFabric> {
        DmaBuffer::allocate(&self.fabric, &self.addr, client_id).expect("buffer connect")
    }
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Collected response: (request id, status, payload).
type Collected = (u64, u32, Vec<u8>);

/// Poll until `count` responses arrive or the timeout hits.
fn collect_responses(dma: &mut DmaBuffer<LoopbackFabric>, count: usize) -> Vec<Collected> {
    let mut out: Vec<Collected> = Vec::new();
    let deadline = Instant::now() + POLL_TIMEOUT;
    while out.len() < count {
        assert!(
            Instant::now() < deadline,
            "timed out with {} of {count} responses",
            out.len()
        );
        dma.poll_responses(|view| {
            let mut payload = vec![0u8; view.bytes_serviced as usize];
            if view.has_payload() {
                view.copy_payload_to(&mut payload);
            }
            out.push((view.request_id, view.result, payload));
        });
        std::thread::sleep(Duration::from_micros(200));
    }
    out
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn test_handshake_assigns_first_slots() {
    let backend = TestBackend::start("172.16.0.1:4420", 4, 4);

    let bridge = backend.bridge();
    assert_eq!(bridge.client_id(), 0);

    let mut dma = backend.dma_buffer(bridge.client_id());
    assert_eq!(dma.buffer_id(), 0);

    // No requests posted: the backend keeps re-polling, nothing arrives.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(dma.poll_responses(|_| panic!("no response expected")), 0);

    // A second client lands in the next slots.
    let bridge2 = backend.bridge();
    assert_eq!(bridge2.client_id(), 1);
}

#[test]
fn test_control_plane_round_trips() {
    let backend = TestBackend::start("172.16.0.2:4420", 2, 2);
    let mut bridge = backend.bridge();

    bridge.create_directory("data", 1, ROOT_DIR_ID).unwrap();
    bridge.create_file("results.bin", 0o644, 7, 1).unwrap();

    // Create twice: already exists.
    match bridge.create_file("results.bin", 0o644, 7, 1) {
        Err(HostError::Backend { status }) => assert_eq!(status, status::ALREADY_EXISTS),
        other => panic!("expected ALREADY_EXISTS, got {other:?}"),
    }

    assert_eq!(bridge.get_file_size(7).unwrap(), 0);
    bridge.change_file_size(7, 1 << 20).unwrap();
    assert_eq!(bridge.get_file_size(7).unwrap(), 1 << 20);

    let info = bridge.get_file_info(7).unwrap();
    assert_eq!(info.file_size.get(), 1 << 20);
    assert_eq!(info.attributes.get(), 0o644);
    assert_eq!(bridge.get_file_attributes(7).unwrap(), 0o644);

    let free = bridge.get_free_space().unwrap();
    assert!(free < dpufs::service::memfs::DEFAULT_QUOTA_BYTES);

    bridge.move_file(7, "renamed.bin").unwrap();

    // Non-empty directory refuses removal; empty one goes away.
    match bridge.remove_directory(1) {
        Err(HostError::Backend { status }) => assert_eq!(status, status::DIR_NOT_EMPTY),
        other => panic!("expected DIR_NOT_EMPTY, got {other:?}"),
    }
    bridge.delete_file(7, 1).unwrap();
    bridge.remove_directory(1).unwrap();

    match bridge.get_file_info(7) {
        Err(HostError::Backend { status }) => assert_eq!(status, status::NOT_FOUND),
        other => panic!("expected NOT_FOUND, got {other:?}"),
    }
}

#[test]
fn test_single_write_then_read() {
    let backend = TestBackend::start("172.16.0.3:4420", 2, 2);
    let mut bridge = backend.bridge();
    bridge.create_file("blob", 0, 7, ROOT_DIR_ID).unwrap();

    let mut dma = backend.dma_buffer(bridge.client_id());
    let data = pattern(4096, 3);

    let write_id = dma.write_file(7, 0, &data).unwrap();
    let responses = collect_responses(&mut dma, 1);
    assert_eq!(responses[0].0, write_id);
    assert_eq!(responses[0].1, status::SUCCESS);
    assert_eq!(responses[0].2.len(), 0);

    let read_id = dma.read_file(7, 0, 4096).unwrap();
    let responses = collect_responses(&mut dma, 1);
    assert_eq!(responses[0].0, read_id);
    assert_eq!(responses[0].1, status::SUCCESS);
    assert_eq!(responses[0].2, data);
}

#[test]
fn test_read_of_hole_returns_zeros() {
    let backend = TestBackend::start("172.16.0.4:4420", 2, 2);
    let mut bridge = backend.bridge();
    bridge.create_file("holes", 0, 9, ROOT_DIR_ID).unwrap();
    bridge.change_file_size(9, 8192).unwrap();

    let mut dma = backend.dma_buffer(bridge.client_id());
    let read_id = dma.read_file(9, 4096, 4096).unwrap();
    let responses = collect_responses(&mut dma, 1);
    assert_eq!(responses[0].0, read_id);
    assert_eq!(responses[0].1, status::SUCCESS);
    assert_eq!(responses[0].2, vec![0u8; 4096]);

    // Reading past the end services only the bytes that exist.
    let read_id = dma.read_file(9, 8192, 4096).unwrap();
    let responses = collect_responses(&mut dma, 1);
    assert_eq!(responses[0].0, read_id);
    assert_eq!(responses[0].1, status::SUCCESS);
    assert_eq!(responses[0].2.len(), 0);
}

#[test]
fn test_unknown_file_reports_not_found() {
    let backend = TestBackend::start("172.16.0.5:4420", 2, 2);
    let bridge = backend.bridge();
    let mut dma = backend.dma_buffer(bridge.client_id());

    let id = dma.write_file(999, 0, b"nowhere").unwrap();
    let responses = collect_responses(&mut dma, 1);
    assert_eq!(responses[0].0, id);
    assert_eq!(responses[0].1, status::NOT_FOUND);
}

#[test]
fn test_batched_mixed_requests_complete_in_order() {
    let backend = TestBackend::start("172.16.0.6:4420", 2, 2);
    let mut bridge = backend.bridge();
    bridge.create_file("batch", 0, 7, ROOT_DIR_ID).unwrap();

    let mut dma = backend.dma_buffer(bridge.client_id());

    // Seed the region the batched reads will hit.
    let seed = pattern(4096, 11);
    dma.write_file(7, 0, &seed).unwrap();
    collect_responses(&mut dma, 1);

    // One publish carrying four requests.
    let w1 = dma.enqueue_write(7, 0, &pattern(1024, 1)).unwrap();
    let r1 = dma.enqueue_read(7, 0, 1024).unwrap();
    let w2 = dma.enqueue_write(7, 1024, &pattern(2048, 2)).unwrap();
    let r2 = dma.enqueue_read(7, 1536, 512).unwrap();
    dma.publish();

    let responses = collect_responses(&mut dma, 4);
    let ids: Vec<u64> = responses.iter().map(|r| r.0).collect();
    assert_eq!(ids, vec![w1, r1, w2, r2]);
    assert!(responses.iter().all(|r| r.1 == status::SUCCESS));

    // The first read observes the first write of the same batch: requests
    // execute in ring order.
    assert_eq!(responses[1].2, pattern(1024, 1));
    assert_eq!(responses[3].2.len(), 512);
}

#[test]
fn test_ring_wrap_around() {
    let backend = TestBackend::start("172.16.0.7:4420", 2, 2);
    let mut bridge = backend.bridge();
    bridge.create_file("wrap", 0, 7, ROOT_DIR_ID).unwrap();

    let mut dma = backend.dma_buffer(bridge.client_id());

    // March the producer tail around the 1 MiB ring several times with
    // 60000-byte frames; many of them straddle the boundary. Reads bring
    // each chunk back for verification, wrapping the response ring too.
    let chunk = 60_000usize;
    for round in 0..40u32 {
        let data = pattern(chunk, round as u8);
        let offset = (round as u64) * chunk as u64;

        let write_id = dma.write_file(7, offset, &data).unwrap();
        let responses = collect_responses(&mut dma, 1);
        assert_eq!(responses[0].0, write_id);
        assert_eq!(responses[0].1, status::SUCCESS, "write round {round}");

        let read_id = dma.read_file(7, offset, chunk as u32).unwrap();
        let responses = collect_responses(&mut dma, 1);
        assert_eq!(responses[0].0, read_id);
        assert_eq!(responses[0].2, data, "read round {round}");
    }

    assert_eq!(dma.outstanding(), 0);
}

#[test]
fn test_connection_rejected_when_slots_full() {
    let backend = TestBackend::start("172.16.0.8:4420", 1, 1);

    let bridge = backend.bridge();
    assert_eq!(bridge.client_id(), 0);

    // Every control slot is occupied: the next handshake is rejected and
    // the existing session keeps working.
    match BackendBridge::connect(&backend.fabric, &backend.addr) {
        Err(HostError::Rdma(RdmaError::Rejected)) => {}
        other => panic!("expected rejection, got {:?}", other.map(|b| b.client_id())),
    }

    let mut bridge = bridge;
    bridge.create_file("still-alive", 0, 1, ROOT_DIR_ID).unwrap();
}

#[test]
fn test_terminate_releases_slot_for_reuse() {
    let backend = TestBackend::start("172.16.0.9:4420", 1, 1);

    let bridge = backend.bridge();
    assert_eq!(bridge.client_id(), 0);
    let dma = backend.dma_buffer(bridge.client_id());
    assert_eq!(dma.buffer_id(), 0);

    dma.release().unwrap();
    bridge.disconnect().unwrap();

    // The slots cycle back to Available and accept a fresh handshake.
    let deadline = Instant::now() + POLL_TIMEOUT;
    let bridge2 = loop {
        match BackendBridge::connect(&backend.fabric, &backend.addr) {
            Ok(bridge) => break bridge,
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(10))
            }
            Err(e) => panic!("slot never became available: {e}"),
        }
    };
    assert_eq!(bridge2.client_id(), 0);

    let dma2 = backend.dma_buffer(bridge2.client_id());
    assert_eq!(dma2.buffer_id(), 0);
}

#[test]
fn test_write_read_survives_file_resize() {
    let backend = TestBackend::start("172.16.0.10:4420", 2, 2);
    let mut bridge = backend.bridge();
    bridge.create_file("resize", 0, 5, ROOT_DIR_ID).unwrap();

    let mut dma = backend.dma_buffer(bridge.client_id());
    let data = pattern(16384, 42);
    dma.write_file(5, 0, &data).unwrap();
    collect_responses(&mut dma, 1);

    // Shrink below the written region, then verify the read reflects it.
    bridge.change_file_size(5, 1000).unwrap();
    let read_id = dma.read_file(5, 0, 16384).unwrap();
    let responses = collect_responses(&mut dma, 1);
    assert_eq!(responses[0].0, read_id);
    assert_eq!(responses[0].2, &data[..1000]);
}
