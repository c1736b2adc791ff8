//! dpufs - A Disaggregated Storage Dataplane
//!
//! dpufs splits a file system in two: a thin host-resident client library and
//! a remote file backend, typically deployed on a SmartNIC/DPU. Applications
//! submit control operations (directory and file lifecycle, attribute
//! queries) and data operations (offset-addressed reads and writes) through
//! the host library; all bulk data movement happens over one-sided RDMA
//! against a pair of shared ring buffers.
//!
//! # Architecture
//!
//! - **Wire protocol** ([`wire`]): typed control messages, data-plane frame
//!   headers, status codes, and the shared DMA-area layout
//! - **Ring protocol** ([`ring`]): request/response byte rings with
//!   split-wrap semantics and the three-tail response discipline
//! - **Metadata cache** ([`cache`]): two-function cuckoo hash table with
//!   lock-free readers, backing hot-path file lookups
//! - **Transport** ([`rdma`]): verbs-style endpoint/listener seam with a
//!   libibverbs implementation (feature `rdma`) and an in-process loopback
//!   fabric for tests
//! - **Backend** ([`backend`]): connection registry, control message handler,
//!   data-plane pipeline, and the single-threaded weighted event loop
//! - **File service** ([`service`]): the submission/completion seam to the
//!   storage engine, plus an in-memory implementation
//! - **Host library** ([`host`]): backend bridge (control channel) and DMA
//!   buffer (ring transport channel)
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//!
//! use dpufs::backend::run_backend;
//! use dpufs::cache::CacheTable;
//! use dpufs::config::BackendConfig;
//! use dpufs::rdma::loopback::LoopbackFabric;
//! use dpufs::service::memfs::MemFileService;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BackendConfig::default();
//! let cache = Arc::new(CacheTable::new(config.cache.bucket_count_power)?);
//! let service = Arc::new(MemFileService::new(cache.clone()));
//! let stop = Arc::new(AtomicBool::new(false));
//!
//! let fabric = LoopbackFabric::new();
//! run_backend(&fabric, &config, service, stop)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod constants;
pub mod host;
pub mod logging;
pub mod rdma;
pub mod ring;
pub mod server;
pub mod service;
pub mod wire;
