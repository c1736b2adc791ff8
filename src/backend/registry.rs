//! Connection registry: the CM event state machine.
//!
//! One CM event is polled per control-plane tick. A connect request
//! carries one byte of private data naming the channel kind; the first
//! Available slot of that kind is built up (queue pair, registered message
//! buffer, one posted receive) and accepted, or the request is rejected
//! when every slot is taken. Established and disconnect events are mapped
//! back to slots by scanning the session arrays for the endpoint id.

use tracing::{error, info, warn};

use super::session::{BufferSession, ConnState, ControlSession};
use super::{wr, Backend, BackendError};
use crate::rdma::{
    CmEvent, Endpoint, Fabric, Listener, PendingConn, QpConfig, BUFF_CONN_PRIV_DATA,
    CTRL_CONN_PRIV_DATA,
};

impl<F: Fabric> Backend<F> {
    /// Poll and dispatch at most one CM event.
    pub(super) fn process_cm_event(&mut self) -> Result<(), BackendError> {
        let event = match self.listener.poll_event()? {
            None => return Ok(()),
            Some(event) => event,
        };

        match event {
            CmEvent::ConnectRequest(pending) => match pending.private_data() {
                CTRL_CONN_PRIV_DATA => self.accept_ctrl(pending),
                BUFF_CONN_PRIV_DATA => self.accept_buff(pending),
                other => {
                    error!(private_data = other, "unrecognized connection type");
                    pending.reject();
                }
            },
            CmEvent::Established { id } => self.on_established(id),
            CmEvent::Disconnected { id } => self.on_disconnected(id),
            CmEvent::Error { id, what } => {
                // Surfaced per connection; the slot is reclaimed when the
                // disconnect follows.
                error!(id, what, "connection manager error");
            }
        }
        Ok(())
    }

    fn accept_ctrl(&mut self, pending: F::Pending) {
        let session = match self
            .ctrl_sessions
            .iter_mut()
            .find(|s| s.state == ConnState::Available)
        {
            Some(s) => s,
            None => {
                warn!("no available control session, rejecting connection");
                pending.reject();
                return;
            }
        };

        let ep = match pending.create_endpoint(QpConfig::control()) {
            Ok(ep) => ep,
            Err(e) => {
                error!("control queue pair setup failed: {e}");
                return;
            }
        };

        let setup = ep
            .register(&session.msg_buf)
            .and_then(|mr| {
                session.msg_mr = Some(mr);
                ep.post_recv(session.recv_mr(), wr::CTRL_RECV)
            })
            .and_then(|()| pending.accept());
        match setup {
            Ok(()) => {
                session.ep = Some(ep);
                session.state = ConnState::Occupied;
                info!(slot = session.id, "control connection accepted");
            }
            Err(e) => {
                error!("control connection setup failed: {e}");
                session.msg_mr = None;
            }
        }
    }

    fn accept_buff(&mut self, pending: F::Pending) {
        let session = match self
            .buff_sessions
            .iter_mut()
            .find(|s| s.state == ConnState::Available)
        {
            Some(s) => s,
            None => {
                warn!("no available buffer session, rejecting connection");
                pending.reject();
                return;
            }
        };

        let ep = match pending.create_endpoint(QpConfig::buffer()) {
            Ok(ep) => ep,
            Err(e) => {
                error!("buffer queue pair setup failed: {e}");
                return;
            }
        };

        let setup = ep
            .register(&session.msg_buf)
            .and_then(|mr| {
                session.msg_mr = Some(mr);
                ep.post_recv(session.recv_mr(), wr::BUFF_RECV)
            })
            .and_then(|()| pending.accept());
        match setup {
            Ok(()) => {
                session.ep = Some(ep);
                session.state = ConnState::Occupied;
                info!(slot = session.id, "buffer connection accepted");
            }
            Err(e) => {
                error!("buffer connection setup failed: {e}");
                session.msg_mr = None;
            }
        }
    }

    fn on_established(&mut self, id: u64) {
        if let Some(session) = find_ctrl(&mut self.ctrl_sessions, id) {
            session.state = ConnState::Connected;
            info!(slot = session.id, "control connection established");
            return;
        }
        if let Some(session) = find_buff(&mut self.buff_sessions, id) {
            session.state = ConnState::Connected;
            info!(slot = session.id, "buffer connection established");
            return;
        }
        error!(id, "established event for unknown connection");
    }

    fn on_disconnected(&mut self, id: u64) {
        if let Some(session) = find_ctrl(&mut self.ctrl_sessions, id) {
            if session.state != ConnState::Available {
                session.teardown();
            }
            return;
        }
        if let Some(session) = find_buff(&mut self.buff_sessions, id) {
            if session.state != ConnState::Available {
                session.teardown();
            }
            return;
        }
        error!(id, "disconnect event for unknown connection");
    }
}

/// Slot lookup by endpoint id; the arrays are small, a scan is fine.
fn find_ctrl<E: Endpoint>(
    sessions: &mut [ControlSession<E>],
    id: u64,
) -> Option<&mut ControlSession<E>> {
    sessions
        .iter_mut()
        .find(|s| s.ep.as_ref().is_some_and(|ep| ep.id() == id))
}

fn find_buff<E: Endpoint>(
    sessions: &mut [BufferSession<E>],
    id: u64,
) -> Option<&mut BufferSession<E>> {
    sessions
        .iter_mut()
        .find(|s| s.ep.as_ref().is_some_and(|ep| ep.id() == id))
}
