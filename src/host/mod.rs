//! Host-resident client library.
//!
//! Two channels per client: [`bridge::BackendBridge`] carries typed
//! control operations (directory and file lifecycle, attribute queries)
//! and [`buffer::DmaBuffer`] carries the ring transport for offset-
//! addressed reads and writes. Both connect to the same backend; the
//! buffer channel binds itself to the bridge's client id during its
//! handshake.

pub mod bridge;
pub mod buffer;

use crate::rdma::RdmaError;
use crate::ring::RingError;
use crate::wire::ProtocolError;

/// Errors surfaced by the host library.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Rdma(#[from] RdmaError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error("backend returned status {status}")]
    Backend { status: u32 },

    #[error("too many outstanding requests")]
    TooManyOutstanding,
}

impl HostError {
    /// Convert a wire status into a host result.
    pub(crate) fn check(status: u32) -> Result<(), HostError> {
        if status == crate::wire::status::SUCCESS {
            Ok(())
        } else {
            Err(HostError::Backend { status })
        }
    }
}
