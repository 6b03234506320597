//! Connection pool
//!
//! TCP lifecycle for all three network layers.
//!
//! ## Architecture
//! - Single acceptor thread (non-blocking accept + shutdown flag)
//! - Dial threads for outbound connections
//! - Per-connection reader thread: runs the framing decoder and feeds the
//!   dispatcher's inbound queue
//! - Per-connection writer thread: drains the outbound byte queue
//!
//! The reader yield-spins when the bounded inbound queue is full —
//! back-pressure without dropping. Setup/teardown events flow to the
//! dispatcher over the event channel; teardown is emitted exactly once
//! per connection.

mod conn;

pub use conn::{Conn, ConnMode, ConnRef};

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::config::MsgNetConfig;
use crate::dispatch::ConnEvent;
use crate::error::{LinkError, Result};
use crate::msg::Msg;

use conn::{Decoder, WriteOp};

/// Shared connection pool for one network instance.
pub(crate) struct ConnPool {
    weak_self: Weak<ConnPool>,
    config: MsgNetConfig,
    shutdown: AtomicBool,
    next_conn_id: AtomicU64,
    conns: Mutex<HashMap<u64, ConnRef>>,
    inbound_tx: Sender<(Msg, ConnRef)>,
    event_tx: Sender<ConnEvent>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnPool {
    pub fn new(
        config: MsgNetConfig,
        inbound_tx: Sender<(Msg, ConnRef)>,
        event_tx: Sender<ConnEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            config,
            shutdown: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            conns: Mutex::new(HashMap::new()),
            inbound_tx,
            event_tx,
            acceptor: Mutex::new(None),
        })
    }

    fn arc(&self) -> Option<Arc<ConnPool>> {
        self.weak_self.upgrade()
    }

    /// Bind `addr` and start accepting. Bind errors surface to the caller;
    /// everything after that is asynchronous.
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let mut acceptor = self.acceptor.lock();
        if acceptor.is_some() {
            return Err(LinkError::Config("already listening".to_string()));
        }
        let Some(pool) = self.arc() else {
            return Err(LinkError::Config("pool is shut down".to_string()));
        };

        let listener = TcpListener::bind(addr)?;
        // Non-blocking so the accept loop can observe the shutdown flag
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        tracing::info!("listening on {}", local_addr);

        let handle = thread::Builder::new()
            .name("peerlink-acceptor".to_string())
            .spawn(move || pool.accept_loop(listener))?;
        *acceptor = Some(handle);

        Ok(local_addr)
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while !self.shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    // The accepted socket must block; only the listener is
                    // non-blocking.
                    if let Err(e) = stream.set_nonblocking(false) {
                        tracing::warn!("failed to configure accepted socket: {}", e);
                        continue;
                    }
                    tracing::debug!("accepted connection from {}", peer_addr);
                    let conn = Conn::new(self.next_id(), peer_addr, ConnMode::Passive);
                    self.conns.lock().insert(conn.id, Arc::clone(&conn));
                    self.attach(conn, stream);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    // No pending connections, sleep briefly
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    if !self.shutdown.load(Ordering::Relaxed) {
                        tracing::error!("accept error: {}", e);
                    }
                }
            }
        }
        tracing::debug!("acceptor stopped");
    }

    /// Dial `addr`. The handle is returned immediately in `Active` mode;
    /// the blocking connect happens on a dial thread. Success emits a
    /// setup event, failure a teardown event (which is what drives the
    /// peer layer's retry path).
    pub fn connect(&self, addr: SocketAddr) -> ConnRef {
        let conn = Conn::new(self.next_id(), addr, ConnMode::Active);
        self.conns.lock().insert(conn.id, Arc::clone(&conn));

        let Some(pool) = self.arc() else {
            self.teardown(&conn);
            return conn;
        };
        let dial_conn = Arc::clone(&conn);
        let spawned = thread::Builder::new()
            .name("peerlink-dial".to_string())
            .spawn(move || match TcpStream::connect(addr) {
                Ok(stream) => pool.attach(dial_conn, stream),
                Err(e) => {
                    tracing::debug!("dial to {} failed: {}", addr, e);
                    pool.teardown(&dial_conn);
                }
            });
        if spawned.is_err() {
            self.teardown(&conn);
        }
        conn
    }

    /// Wire up reader/writer threads for an established socket and emit
    /// the setup event (always before the reader can enqueue a message).
    fn attach(&self, conn: ConnRef, stream: TcpStream) {
        if conn.is_dead() {
            return;
        }
        let _ = stream.set_nodelay(true);

        let writer_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("failed to clone socket for {}: {}", conn.addr(), e);
                self.teardown(&conn);
                return;
            }
        };
        let ctl_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("failed to clone socket for {}: {}", conn.addr(), e);
                self.teardown(&conn);
                return;
            }
        };
        *conn.stream.lock() = Some(ctl_stream);
        // A terminate may have raced the attach before the control handle
        // was stored; close the socket it could not reach.
        if conn.is_dead() {
            if let Some(s) = conn.stream.lock().as_ref() {
                let _ = s.shutdown(Shutdown::Both);
            }
            return;
        }

        let Some(outbound_rx) = conn.take_outbound_rx() else {
            return;
        };
        let Some(pool) = self.arc() else {
            self.teardown(&conn);
            return;
        };

        let _ = self.event_tx.send(ConnEvent::SetUp(Arc::clone(&conn)));

        let writer_pool = Arc::clone(&pool);
        let writer_conn = Arc::clone(&conn);
        let spawned = thread::Builder::new()
            .name("peerlink-writer".to_string())
            .spawn(move || run_writer(writer_pool, writer_conn, writer_stream, outbound_rx));
        if spawned.is_err() {
            self.teardown(&conn);
            return;
        }

        let reader_conn = Arc::clone(&conn);
        let spawned = thread::Builder::new()
            .name("peerlink-reader".to_string())
            .spawn(move || run_reader(pool, reader_conn, stream));
        if spawned.is_err() {
            self.teardown(&conn);
        }
    }

    /// Terminate a connection: flip to `Dead`, close the socket, stop the
    /// writer, emit the teardown event. Idempotent.
    pub fn terminate(&self, conn: &ConnRef) {
        self.teardown(conn);
    }

    fn teardown(&self, conn: &ConnRef) {
        conn.set_dead();
        conn.timeout_timer.cancel();
        if !conn.closed.swap(true, Ordering::SeqCst) {
            if let Some(stream) = conn.stream.lock().as_ref() {
                let _ = stream.shutdown(Shutdown::Both);
            }
            conn.shutdown_writer();
            self.conns.lock().remove(&conn.id);
            let _ = self.event_tx.send(ConnEvent::TearDown(Arc::clone(conn)));
            tracing::debug!("connection to {} closed", conn.addr());
        }
    }

    /// Terminate everything and join the acceptor.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let conns: Vec<ConnRef> = self.conns.lock().values().cloned().collect();
        for conn in conns {
            self.teardown(&conn);
        }
        if let Some(handle) = self.acceptor.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn conn_count(&self) -> usize {
        self.conns.lock().len()
    }

    fn next_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Reader thread: socket bytes → decoder → inbound queue.
fn run_reader(pool: Arc<ConnPool>, conn: ConnRef, mut stream: TcpStream) {
    let mut decoder = Decoder::new(pool.config.max_msg_size);
    let mut chunk = vec![0u8; pool.config.seg_buff_size];
    let mut decoded = Vec::new();

    'read: loop {
        if conn.is_dead() || pool.shutdown.load(Ordering::Relaxed) {
            break;
        }
        match stream.read(&mut chunk) {
            Ok(0) => break, // EOF
            Ok(n) => {
                if let Err(e) = decoder.feed(&chunk[..n], &mut decoded) {
                    tracing::warn!("protocol error from {}: {}", conn.addr(), e);
                    break;
                }
                for msg in decoded.drain(..) {
                    conn.add_recv(u64::from(msg.length()));
                    // Yield-spin while the inbound queue is full; messages
                    // are never dropped.
                    let mut item = (msg, Arc::clone(&conn));
                    loop {
                        match pool.inbound_tx.try_send(item) {
                            Ok(()) => break,
                            Err(TrySendError::Full(it)) => {
                                item = it;
                                thread::yield_now();
                            }
                            Err(TrySendError::Disconnected(_)) => break 'read,
                        }
                    }
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("read error on {}: {}", conn.addr(), e);
                break;
            }
        }
    }
    pool.teardown(&conn);
}

/// Writer thread: outbound queue → socket.
fn run_writer(
    pool: Arc<ConnPool>,
    conn: ConnRef,
    mut stream: TcpStream,
    outbound_rx: Receiver<WriteOp>,
) {
    for op in outbound_rx.iter() {
        match op {
            WriteOp::Data(bytes) => {
                if let Err(e) = stream.write_all(&bytes) {
                    tracing::debug!("write error on {}: {}", conn.addr(), e);
                    break;
                }
            }
            WriteOp::Shutdown => break,
        }
    }
    pool.teardown(&conn);
}
