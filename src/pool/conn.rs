//! Connection handle and framing decoder
//!
//! A [`Conn`] is a shared handle (`Arc`) passed to handlers, held by the
//! inbound queue while a message is in flight, and held by the peer
//! registry while a peer is connected. `Dead` is a terminal tag: the
//! handle stays valid after termination and layers observing `Dead`
//! no-op.

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{LinkError, Result};
use crate::msg::{Msg, HEADER_SIZE};
use crate::timer::TimerHandle;

/// Shared connection handle
pub type ConnRef = Arc<Conn>;

/// Connection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnMode {
    /// We dialed
    Active,
    /// We accepted
    Passive,
    /// Terminated; handlers observing this no-op
    Dead,
}

const MODE_ACTIVE: u8 = 0;
const MODE_PASSIVE: u8 = 1;
const MODE_DEAD: u8 = 2;

/// Operations queued to the writer thread
pub(crate) enum WriteOp {
    Data(Vec<u8>),
    Shutdown,
}

/// A single TCP connection
pub struct Conn {
    pub(crate) id: u64,
    addr: SocketAddr,
    mode: AtomicU8,

    /// Outbound byte queue, drained by the writer thread
    outbound_tx: Sender<WriteOp>,
    /// Receiver side; taken by the writer thread on attach
    outbound_rx: Mutex<Option<Receiver<WriteOp>>>,
    /// Control handle to the socket, used to unblock reader/writer on
    /// termination
    pub(crate) stream: Mutex<Option<TcpStream>>,
    /// Teardown latch: the teardown event is emitted exactly once
    pub(crate) closed: AtomicBool,

    /// Peer identity, resolved by the peer layer (dial target, or learned
    /// from the PING/PONG port exchange on passive connections)
    peer_id: Mutex<Option<SocketAddr>>,
    /// Inactivity timer; expiry terminates the connection
    pub(crate) timeout_timer: TimerHandle,

    // Message/byte counters; workers bump the recv side, the dispatcher
    // bumps the send side.
    msgs_sent: AtomicU64,
    msgs_recv: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
}

impl Conn {
    pub(crate) fn new(id: u64, addr: SocketAddr, mode: ConnMode) -> ConnRef {
        let (outbound_tx, outbound_rx) = unbounded();
        Arc::new(Self {
            id,
            addr,
            mode: AtomicU8::new(match mode {
                ConnMode::Active => MODE_ACTIVE,
                ConnMode::Passive => MODE_PASSIVE,
                ConnMode::Dead => MODE_DEAD,
            }),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            stream: Mutex::new(None),
            closed: AtomicBool::new(false),
            peer_id: Mutex::new(None),
            timeout_timer: TimerHandle::new(),
            msgs_sent: AtomicU64::new(0),
            msgs_recv: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
        })
    }

    /// Connection handle with no socket behind it. Test scaffolding only.
    #[cfg(test)]
    pub(crate) fn new_detached(addr: SocketAddr) -> ConnRef {
        Self::new(0, addr, ConnMode::Active)
    }

    /// Remote address of the connection
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn mode(&self) -> ConnMode {
        match self.mode.load(Ordering::SeqCst) {
            MODE_ACTIVE => ConnMode::Active,
            MODE_PASSIVE => ConnMode::Passive,
            _ => ConnMode::Dead,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.mode.load(Ordering::SeqCst) == MODE_DEAD
    }

    pub(crate) fn set_dead(&self) {
        self.mode.store(MODE_DEAD, Ordering::SeqCst);
    }

    /// Peer identity, if resolved
    pub fn peer_id(&self) -> Option<SocketAddr> {
        *self.peer_id.lock()
    }

    pub(crate) fn set_peer_id(&self, id: SocketAddr) {
        *self.peer_id.lock() = Some(id);
    }

    /// Queue serialized bytes for the writer thread.
    pub(crate) fn write(&self, bytes: Vec<u8>) -> Result<()> {
        if self.is_dead() {
            return Err(LinkError::ConnClosed);
        }
        self.outbound_tx
            .send(WriteOp::Data(bytes))
            .map_err(|_| LinkError::ConnClosed)
    }

    pub(crate) fn shutdown_writer(&self) {
        let _ = self.outbound_tx.send(WriteOp::Shutdown);
    }

    pub(crate) fn take_outbound_rx(&self) -> Option<Receiver<WriteOp>> {
        self.outbound_rx.lock().take()
    }

    pub(crate) fn add_sent(&self, bytes: u64) {
        self.msgs_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_recv(&self, bytes: u64) {
        self.msgs_recv.fetch_add(1, Ordering::Relaxed);
        self.bytes_recv.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Messages written to this connection
    pub fn msgs_sent(&self) -> u64 {
        self.msgs_sent.load(Ordering::Relaxed)
    }

    /// Messages decoded off this connection
    pub fn msgs_recv(&self) -> u64 {
        self.msgs_recv.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_recv(&self) -> u64 {
        self.bytes_recv.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("mode", &self.mode())
            .finish()
    }
}

/// Two-state (header / payload) framing decoder.
///
/// Runs on the reader thread; state persists across socket reads, so a
/// frame may arrive in arbitrarily small fragments.
pub(crate) struct Decoder {
    buffer: Vec<u8>,
    /// Header already parsed, payload pending
    pending: Option<Msg>,
    max_msg_size: usize,
}

impl Decoder {
    pub fn new(max_msg_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            pending: None,
            max_msg_size,
        }
    }

    /// Consume freshly read bytes and append every completed message to
    /// `out`. Messages with a bad checksum are dropped with a warning
    /// (the stream is not resynced). An oversized frame is unrecoverable
    /// and errors out; the caller terminates the connection.
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<Msg>) -> Result<()> {
        self.buffer.extend_from_slice(bytes);
        loop {
            match self.pending.take() {
                None => {
                    if self.buffer.len() < HEADER_SIZE {
                        return Ok(());
                    }
                    let header: Vec<u8> = self.buffer.drain(..HEADER_SIZE).collect();
                    let msg = Msg::from_header(&header)?;
                    if msg.length() as usize > self.max_msg_size {
                        return Err(LinkError::Protocol(format!(
                            "frame of {} bytes exceeds max message size {}",
                            msg.length(),
                            self.max_msg_size
                        )));
                    }
                    self.pending = Some(msg);
                }
                Some(mut msg) => {
                    let len = msg.length() as usize;
                    if self.buffer.len() < len {
                        self.pending = Some(msg);
                        return Ok(());
                    }
                    msg.set_payload(self.buffer.drain(..len).collect());
                    if msg.verify_checksum() {
                        out.push(msg);
                    } else {
                        tracing::warn!("checksums do not match, dropping the message");
                    }
                }
            }
        }
    }
}
