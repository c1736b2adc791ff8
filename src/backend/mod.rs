//! The backend service.
//!
//! A single polling thread, pinned to a dedicated core, drives everything:
//! connection-manager events, control-channel messages, the data-plane
//! ring pipeline, and the completion scanners. Control-plane work is
//! sampled once every [`DATA_PLANE_WEIGHT`] iterations; data-plane work
//! runs every iteration.
//!
//! [`DATA_PLANE_WEIGHT`]: crate::constants::DATA_PLANE_WEIGHT

pub mod control;
pub mod dataplane;
pub mod registry;
pub mod session;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::{BackendConfig, NotificationMethod};
use crate::constants::DATA_PLANE_WEIGHT;
use crate::rdma::{Fabric, RdmaError};
use crate::ring::RingError;
use crate::service::FileService;
use crate::wire::ProtocolError;
use session::{BufferSession, ConnState, ControlSession};

/// Work-request identifiers, used to demultiplex completions.
pub(crate) mod wr {
    pub const CTRL_RECV: u64 = 1;
    pub const CTRL_SEND: u64 = 2;
    pub const BUFF_RECV: u64 = 3;
    pub const BUFF_SEND: u64 = 4;
    pub const READ_REQUEST_META: u64 = 10;
    pub const READ_REQUEST_DATA: u64 = 11;
    pub const READ_REQUEST_DATA_SPLIT: u64 = 12;
    pub const WRITE_REQUEST_META: u64 = 13;
    pub const READ_RESPONSE_META: u64 = 14;
    pub const WRITE_RESPONSE_DATA: u64 = 15;
    pub const WRITE_RESPONSE_DATA_SPLIT: u64 = 16;
    pub const WRITE_RESPONSE_META: u64 = 17;
}

/// Errors that stop the whole backend.
///
/// Per-session failures (CQ errors, malformed messages) tear down the
/// offending session and are not represented here.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Rdma(#[from] RdmaError),

    #[error("response ring overflow: {0}")]
    ResponseOverflow(RingError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// The backend: session slots, listener, and the file service hook.
pub struct Backend<F: Fabric> {
    listener: F::Listener,
    ctrl_sessions: Vec<ControlSession<F::Endpoint>>,
    buff_sessions: Vec<BufferSession<F::Endpoint>>,
    service: Arc<dyn FileService>,
    notification: NotificationMethod,
    stop: Arc<AtomicBool>,
}

impl<F: Fabric> Backend<F> {
    pub fn new(
        fabric: &F,
        config: &BackendConfig,
        service: Arc<dyn FileService>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, BackendError> {
        let listener = fabric.listen(&config.network.listen_addr)?;
        info!(addr = %config.network.listen_addr, "backend listening");

        let ctrl_sessions = (0..config.network.max_clients)
            .map(ControlSession::new)
            .collect();
        let buff_sessions = (0..config.network.max_buffs)
            .map(BufferSession::new)
            .collect();

        Ok(Self {
            listener,
            ctrl_sessions,
            buff_sessions,
            service,
            notification: config.network.completion_notification,
            stop,
        })
    }

    /// The polling loop. Returns when the stop flag is raised or a fatal
    /// error occurs; all sessions are torn down on the way out.
    pub fn run(&mut self) -> Result<(), BackendError> {
        let mut dp_counter = 0u32;

        let result = loop {
            if self.stop.load(Ordering::Relaxed) {
                break Ok(());
            }

            if dp_counter == 0 {
                if let Err(e) = self.process_cm_event() {
                    break Err(e);
                }
                self.process_ctrl_cq();
                self.scan_control_completions();
            }

            if let Err(e) = self.process_buff_cq() {
                break Err(e);
            }
            self.scan_io_completions();

            dp_counter += 1;
            if dp_counter == DATA_PLANE_WEIGHT {
                dp_counter = 0;
            }
        };

        for session in &mut self.ctrl_sessions {
            if session.state != ConnState::Available {
                session.teardown();
            }
        }
        for session in &mut self.buff_sessions {
            if session.state != ConnState::Available {
                session.teardown();
            }
        }

        if let Err(e) = &result {
            error!("backend stopped with fatal error: {e}");
        } else {
            info!("backend stopped");
        }
        result
    }
}

/// Run the backend to completion on the current thread.
///
/// Pins the thread to `config.node.core_id` when set, builds the session
/// slots, and polls until `stop` is raised. The file service is expected to
/// be ready before this call.
pub fn run_backend<F: Fabric>(
    fabric: &F,
    config: &BackendConfig,
    service: Arc<dyn FileService>,
    stop: Arc<AtomicBool>,
) -> Result<(), BackendError> {
    if let Some(core) = config.node.core_id {
        let pinned = core_affinity::get_core_ids()
            .unwrap_or_default()
            .into_iter()
            .find(|c| c.id == core)
            .map(core_affinity::set_for_current)
            .unwrap_or(false);
        if pinned {
            info!(core, "polling thread pinned");
        } else {
            warn!(core, "could not pin polling thread");
        }
    }

    Backend::new(fabric, config, service, stop)?.run()
}
