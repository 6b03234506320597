//! Message network
//!
//! The base transport layer: framed messages over TCP with an
//! opcode→handler table. Handlers run synchronously on the dispatcher
//! thread; sends are posted to the dispatcher from any thread.
//!
//! ## Data Flow
//! ```text
//! socket ──reader──► decoder ──► inbound queue ──dispatcher──► handler
//! user ──send_msg──► dispatcher task ──serialize──► writer ──► socket
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, unbounded};
use parking_lot::Mutex;

use crate::config::MsgNetConfig;
use crate::dispatch::{self, DispatcherHandle, NetShared};
use crate::error::{LinkError, Result};
use crate::msg::{Msg, Opcode, Payload};
use crate::pool::{ConnPool, ConnRef};

/// Network of nodes exchanging framed async messages.
pub struct MsgNetwork {
    shared: Arc<NetShared>,
    pool: Arc<ConnPool>,
    disp: DispatcherHandle,
    disp_thread: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl MsgNetwork {
    /// Create the network: spawns the dispatcher thread immediately.
    pub fn new(config: MsgNetConfig) -> Result<Self> {
        let shared = Arc::new(NetShared::new());
        let (inbound_tx, inbound_rx) = bounded(config.queue_capacity);
        let (event_tx, event_rx) = unbounded();

        let pool = ConnPool::new(config.clone(), inbound_tx, event_tx);
        let (disp, disp_thread) = dispatch::spawn(
            Arc::clone(&shared),
            inbound_rx,
            event_rx,
            config.burst_size,
        )?;

        Ok(Self {
            shared,
            pool,
            disp,
            disp_thread: Mutex::new(Some(disp_thread)),
            stopped: AtomicBool::new(false),
        })
    }

    // -------------------------------------------------------------------------
    // Handler Registration
    // -------------------------------------------------------------------------

    /// Register a typed handler for `M::OPCODE`. The payload is decoded
    /// before invocation; malformed payloads are logged and dropped.
    /// Re-registering an opcode overwrites the previous handler.
    pub fn reg_handler<M, F>(&self, handler: F)
    where
        M: Payload,
        F: Fn(M, ConnRef) + Send + Sync + 'static,
    {
        self.set_handler(M::OPCODE, move |msg: Msg, conn: ConnRef| {
            match M::decode_payload(msg.payload()) {
                Ok(m) => handler(m, conn),
                Err(e) => {
                    tracing::warn!("malformed payload for opcode 0x{:02x}: {}", msg.opcode(), e);
                }
            }
        });
    }

    /// Register a raw handler for an opcode.
    pub fn set_handler<F>(&self, opcode: Opcode, handler: F)
    where
        F: Fn(Msg, ConnRef) + Send + Sync + 'static,
    {
        self.shared.handlers.lock().insert(opcode, Arc::new(handler));
    }

    /// Register the connection state callback: `(conn, connected)`.
    pub fn reg_conn_handler<F>(&self, handler: F)
    where
        F: Fn(&ConnRef, bool) + Send + Sync + 'static,
    {
        *self.shared.conn_handler.lock() = Some(Arc::new(handler));
    }

    /// Register the error callback: `(error, fatal)`. Recoverable faults
    /// (`fatal == false`) leave the dispatcher running.
    pub fn reg_error_handler<F>(&self, handler: F)
    where
        F: Fn(&LinkError, bool) + Send + Sync + 'static,
    {
        *self.shared.error_cb.lock() = Some(Arc::new(handler));
    }

    /// Layer-internal connection hook; runs before the user's handler.
    pub(crate) fn set_conn_hook<F>(&self, hook: F)
    where
        F: Fn(&ConnRef, bool) + Send + Sync + 'static,
    {
        *self.shared.conn_hook.lock() = Some(Arc::new(hook));
    }

    // -------------------------------------------------------------------------
    // Connection Management
    // -------------------------------------------------------------------------

    /// Bind and start accepting. Bind errors return to the caller.
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.pool.listen(addr)
    }

    /// Dial a remote node. The returned handle becomes usable once the
    /// connection callback reports `connected == true`.
    pub fn connect(&self, addr: SocketAddr) -> ConnRef {
        self.pool.connect(addr)
    }

    /// Terminate a connection.
    pub fn terminate(&self, conn: &ConnRef) {
        self.pool.terminate(conn);
    }

    /// Number of live connections in the pool.
    pub fn conn_count(&self) -> usize {
        self.pool.conn_count()
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    /// Send a typed message on a connection. Serialization and the write
    /// hand-off happen on the dispatcher; failures are reported through
    /// the error callback, not to the caller.
    pub fn send_msg<M: Payload>(&self, msg: M, conn: &ConnRef) {
        self.send_raw(msg.into_msg(), conn);
    }

    /// Send an already-framed message on a connection.
    pub fn send_raw(&self, msg: Msg, conn: &ConnRef) {
        let shared = Arc::clone(&self.shared);
        let conn = Arc::clone(conn);
        self.disp.post(move || send_on_conn(&shared, &msg, &conn));
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Stop the network: terminate connections, stop the dispatcher, join
    /// its thread, and drop registered callbacks.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.stop();
        self.disp.stop();
        if let Some(handle) = self.disp_thread.lock().take() {
            let _ = handle.join();
        }
        self.shared.clear_callbacks();
    }

    pub(crate) fn dispatcher(&self) -> &DispatcherHandle {
        &self.disp
    }

    pub(crate) fn shared(&self) -> &Arc<NetShared> {
        &self.shared
    }

    pub(crate) fn pool(&self) -> &Arc<ConnPool> {
        &self.pool
    }
}

impl Drop for MsgNetwork {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Serialize and hand a message to a connection's writer. Runs on the
/// dispatcher; faults go to the error callback as recoverable.
pub(crate) fn send_on_conn(shared: &NetShared, msg: &Msg, conn: &ConnRef) {
    let data = msg.encode();
    tracing::trace!(
        "wrote message opcode 0x{:02x} ({} bytes) to {}",
        msg.opcode(),
        msg.length(),
        conn.addr()
    );
    conn.add_sent(u64::from(msg.length()));
    if let Err(e) = conn.write(data) {
        shared.report(&e, false);
    }
}
