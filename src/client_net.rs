//! Client network
//!
//! A [`MsgNetwork`] for client-server request handling: passive
//! (accepted) connections are indexed by remote address, so server code
//! can address a client by its observed endpoint instead of holding the
//! connection handle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::MsgNetConfig;
use crate::error::{LinkError, Result};
use crate::msg::{Msg, Opcode, Payload};
use crate::msg_net::{send_on_conn, MsgNetwork};
use crate::pool::{ConnMode, ConnRef};

/// Simple network that handles client-server requests.
pub struct ClientNetwork {
    net: MsgNetwork,
    addr2conn: Arc<Mutex<HashMap<SocketAddr, ConnRef>>>,
}

impl ClientNetwork {
    pub fn new(config: MsgNetConfig) -> Result<Self> {
        let net = MsgNetwork::new(config)?;
        let addr2conn: Arc<Mutex<HashMap<SocketAddr, ConnRef>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let index = Arc::clone(&addr2conn);
        net.set_conn_hook(move |conn, connected| {
            if connected {
                // Only accepted connections are addressable by endpoint.
                if conn.mode() == ConnMode::Passive {
                    // Last writer wins on a stale entry at the same address.
                    index.lock().insert(conn.addr(), Arc::clone(conn));
                }
            } else {
                index.lock().remove(&conn.addr());
            }
        });

        Ok(Self { net, addr2conn })
    }

    /// Send a typed message to the client at `addr`; silently dropped when
    /// no such client is connected.
    pub fn send_msg<M: Payload>(&self, msg: M, addr: SocketAddr) {
        self.send_raw(msg.into_msg(), addr);
    }

    /// Send an already-framed message to the client at `addr`.
    pub fn send_raw(&self, msg: Msg, addr: SocketAddr) {
        let shared = Arc::clone(self.net.shared());
        let index = Arc::clone(&self.addr2conn);
        self.net.dispatcher().post(move || {
            let conn = index.lock().get(&addr).cloned();
            match conn {
                Some(conn) => send_on_conn(&shared, &msg, &conn),
                None => {
                    tracing::debug!("no client connected at {}, dropping message", addr);
                }
            }
        });
    }

    /// Whether a client is currently connected at `addr`.
    pub fn has_client(&self, addr: SocketAddr) -> bool {
        self.addr2conn.lock().contains_key(&addr)
    }

    // -------------------------------------------------------------------------
    // Delegation to the underlying MsgNetwork
    // -------------------------------------------------------------------------

    pub fn reg_handler<M, F>(&self, handler: F)
    where
        M: Payload,
        F: Fn(M, ConnRef) + Send + Sync + 'static,
    {
        self.net.reg_handler(handler);
    }

    pub fn set_handler<F>(&self, opcode: Opcode, handler: F)
    where
        F: Fn(Msg, ConnRef) + Send + Sync + 'static,
    {
        self.net.set_handler(opcode, handler);
    }

    pub fn reg_conn_handler<F>(&self, handler: F)
    where
        F: Fn(&ConnRef, bool) + Send + Sync + 'static,
    {
        self.net.reg_conn_handler(handler);
    }

    pub fn reg_error_handler<F>(&self, handler: F)
    where
        F: Fn(&LinkError, bool) + Send + Sync + 'static,
    {
        self.net.reg_error_handler(handler);
    }

    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.net.listen(addr)
    }

    /// Send on a connection handle directly.
    pub fn send_msg_conn<M: Payload>(&self, msg: M, conn: &ConnRef) {
        self.net.send_msg(msg, conn);
    }

    pub fn terminate(&self, conn: &ConnRef) {
        self.net.terminate(conn);
    }

    pub fn stop(&self) {
        self.net.stop();
    }
}
