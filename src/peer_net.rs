//! Peer-to-peer network
//!
//! Any two nodes hold one bidirectional message channel, established by
//! either side. Liveness and identity ride on a PING/PONG exchange: each
//! side advertises the TCP port it *listens* on (distinct from the
//! ephemeral source port of a dial), which is how a passive connection
//! resolves the dialer's identity.
//!
//! ## State machine, per connection
//! 1. setup: arm the inactivity timer, send `PING(listen_port)`
//! 2. `PING` received: resolve identity, arbitrate duplicates, reply `PONG`
//! 3. `PONG` received: mark the pong; the next `PING` goes out once the
//!    jittered ping timer has also fired (throttled to the slower of the
//!    two)
//! 4. teardown of the peer's current connection: schedule a jittered
//!    reconnect
//!
//! When both sides dial simultaneously, whichever connection reaches the
//! dispatcher first wins; the loser is terminated on arrival (duplicate
//! with a different handle).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::config::{IdentityMode, PeerNetConfig};
use crate::dispatch::{DispatcherHandle, NetShared};
use crate::error::{LinkError, Result};
use crate::msg::{Msg, Opcode, Payload};
use crate::msg_net::{send_on_conn, MsgNetwork};
use crate::pool::{ConnPool, ConnRef};
use crate::timer::TimerHandle;

/// Peer-to-peer overlay network.
pub struct PeerNetwork {
    net: MsgNetwork,
    inner: Arc<PeerInner>,
}

/// One registry entry. The connection inside is a shared handle; the
/// entry itself is uniquely owned by its registry.
struct Peer {
    /// Connection address; may differ from the identity on passive
    /// connections (ephemeral source port)
    addr: SocketAddr,
    /// Current connection, absent while disconnected
    conn: Option<ConnRef>,
    ping_timer: TimerHandle,
    retry_timer: TimerHandle,
    /// Periodic ping timer has fired since the last PING
    ping_timer_fired: bool,
    /// PONG for the last PING has arrived
    pong_received: bool,
    connected: bool,
}

impl Peer {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            conn: None,
            ping_timer: TimerHandle::new(),
            retry_timer: TimerHandle::new(),
            ping_timer_fired: false,
            pong_received: false,
            connected: false,
        }
    }

    fn holds(&self, conn: &ConnRef) -> bool {
        self.conn.as_ref().map_or(false, |c| Arc::ptr_eq(c, conn))
    }
}

/// Registries and listen state. Mutated only on the dispatcher; the lock
/// lets user threads run read-only queries directly.
struct PeerState {
    known: HashMap<SocketAddr, Peer>,
    unknown: HashMap<SocketAddr, Peer>,
    listen_port: u16,
}

impl PeerState {
    fn get_peer(&self, id: &SocketAddr) -> Option<&Peer> {
        self.known.get(id).or_else(|| self.unknown.get(id))
    }

    fn get_peer_mut(&mut self, id: &SocketAddr) -> Option<&mut Peer> {
        if self.known.contains_key(id) {
            self.known.get_mut(id)
        } else {
            self.unknown.get_mut(id)
        }
    }
}

struct PeerInner {
    weak_self: Weak<PeerInner>,
    config: PeerNetConfig,
    state: Mutex<PeerState>,
    shared: Arc<NetShared>,
    disp: DispatcherHandle,
    pool: Arc<ConnPool>,
    unknown_cb: Mutex<Option<Arc<dyn Fn(SocketAddr) + Send + Sync>>>,
}

impl PeerNetwork {
    pub fn new(config: PeerNetConfig) -> Result<Self> {
        let net = MsgNetwork::new(config.msg_net.clone())?;

        let inner = Arc::new_cyclic(|weak_self| PeerInner {
            weak_self: weak_self.clone(),
            state: Mutex::new(PeerState {
                known: HashMap::new(),
                unknown: HashMap::new(),
                listen_port: 0,
            }),
            shared: Arc::clone(net.shared()),
            disp: net.dispatcher().clone(),
            pool: Arc::clone(net.pool()),
            unknown_cb: Mutex::new(None),
            config,
        });

        let weak = Arc::downgrade(&inner);
        net.set_conn_hook(move |conn, connected| {
            if let Some(inner) = weak.upgrade() {
                if connected {
                    inner.on_setup(conn);
                } else {
                    inner.on_teardown(conn);
                }
            }
        });

        let weak = Arc::downgrade(&inner);
        net.set_handler(inner.config.opcode_ping, move |msg, conn| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_ping(&msg, &conn);
            }
        });

        let weak = Arc::downgrade(&inner);
        net.set_handler(inner.config.opcode_pong, move |msg, conn| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_pong(&msg, &conn);
            }
        });

        Ok(Self { net, inner })
    }

    // -------------------------------------------------------------------------
    // Peer Management
    // -------------------------------------------------------------------------

    /// Add a peer and start dialing it. Requires an active listener: the
    /// handshake advertises our listen port, so joining the overlay
    /// before `listen` reports `NotListening`. A duplicate identity
    /// reports `PeerAlreadyExists`; a previously accepted unknown peer is
    /// promoted instead. All faults go through the error callback.
    pub fn add_peer(&self, addr: SocketAddr) {
        let inner = Arc::clone(&self.inner);
        let id = self.inner.identity_of(addr);
        self.inner.disp.post(move || {
            let mut st = inner.state.lock();
            if st.listen_port == 0 {
                inner.shared.report(&LinkError::NotListening, false);
                return;
            }
            if st.known.contains_key(&id) {
                inner.shared.report(&LinkError::PeerAlreadyExists(id), false);
                return;
            }
            let peer = st.unknown.remove(&id).unwrap_or_else(|| Peer::new(addr));
            st.known.insert(id, peer);
            inner.start_active_conn(&mut st, id);
        });
    }

    /// Remove a known peer: terminate its connection and cancel its ping
    /// and retry timers so no reconnect outlives the removal. Reports
    /// `PeerNotFound` when absent.
    pub fn del_peer(&self, addr: SocketAddr) {
        let inner = Arc::clone(&self.inner);
        let id = self.inner.identity_of(addr);
        self.inner.disp.post(move || {
            let mut st = inner.state.lock();
            match st.known.remove(&id) {
                None => inner.shared.report(&LinkError::PeerNotFound(id), false),
                Some(peer) => {
                    peer.ping_timer.cancel();
                    peer.retry_timer.cancel();
                    if let Some(conn) = peer.conn {
                        inner.pool.terminate(&conn);
                    }
                    tracing::info!("removed peer {}", id);
                }
            }
        });
    }

    /// Whether `addr`'s identity is in the known set.
    pub fn has_peer(&self, addr: SocketAddr) -> bool {
        let id = self.inner.identity_of(addr);
        self.inner.state.lock().known.contains_key(&id)
    }

    /// Current connection of a peer (known or unknown); `Ok(None)` while
    /// disconnected.
    pub fn get_peer_conn(&self, addr: SocketAddr) -> Result<Option<ConnRef>> {
        let id = self.inner.identity_of(addr);
        let st = self.inner.state.lock();
        match st.get_peer(&id) {
            None => Err(LinkError::PeerNotFound(id)),
            Some(peer) => Ok(peer.conn.clone()),
        }
    }

    /// Number of known peers currently connected.
    pub fn connected_peer_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .known
            .values()
            .filter(|p| p.connected)
            .count()
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    /// Send a typed message to a peer by identity. A missing peer is a
    /// recoverable error reported through the error callback.
    pub fn send_msg<M: Payload>(&self, msg: M, addr: SocketAddr) {
        self.send_raw(msg.into_msg(), addr);
    }

    pub fn send_raw(&self, msg: Msg, addr: SocketAddr) {
        let inner = Arc::clone(&self.inner);
        let id = self.inner.identity_of(addr);
        self.inner.disp.post(move || {
            let st = inner.state.lock();
            match st.get_peer(&id) {
                None => inner.shared.report(&LinkError::PeerNotFound(id), false),
                Some(peer) => match &peer.conn {
                    Some(conn) => send_on_conn(&inner.shared, &msg, conn),
                    None => inner.shared.report(&LinkError::ConnClosed, false),
                },
            }
        });
    }

    /// Send one message to many peers, serialized once per recipient.
    /// Best-effort prefix: recipients before the first missing peer have
    /// already been sent to when the failure is reported.
    pub fn multicast_msg<M: Payload>(&self, msg: M, addrs: &[SocketAddr]) {
        self.multicast_raw(msg.into_msg(), addrs);
    }

    pub fn multicast_raw(&self, msg: Msg, addrs: &[SocketAddr]) {
        let inner = Arc::clone(&self.inner);
        let addrs = addrs.to_vec();
        self.inner.disp.post(move || {
            let st = inner.state.lock();
            for addr in &addrs {
                let id = inner.identity_of(*addr);
                let Some(peer) = st.get_peer(&id) else {
                    inner.shared.report(&LinkError::PeerNotFound(id), false);
                    break;
                };
                let Some(conn) = &peer.conn else {
                    inner.shared.report(&LinkError::ConnClosed, false);
                    break;
                };
                send_on_conn(&inner.shared, &msg, conn);
            }
        });
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Bind and start accepting; records the listen port advertised in
    /// PING/PONG. Bind errors return to the caller.
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let local_addr = self.net.listen(addr)?;
        self.inner.state.lock().listen_port = local_addr.port();
        Ok(local_addr)
    }

    /// Terminate a connection.
    pub fn terminate(&self, conn: &ConnRef) {
        self.net.terminate(conn);
    }

    /// Number of live connections in the pool.
    pub fn conn_count(&self) -> usize {
        self.net.conn_count()
    }

    pub fn stop(&self) {
        self.net.stop();
    }

    // -------------------------------------------------------------------------
    // Handler Registration
    // -------------------------------------------------------------------------

    /// Register a typed handler. `M::OPCODE` must not collide with the
    /// reserved PING/PONG opcodes.
    pub fn reg_handler<M, F>(&self, handler: F)
    where
        M: Payload,
        F: Fn(M, ConnRef) + Send + Sync + 'static,
    {
        debug_assert!(
            M::OPCODE != self.inner.config.opcode_ping && M::OPCODE != self.inner.config.opcode_pong,
            "opcode collides with reserved PING/PONG"
        );
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

    /// Register the callback invoked with the identity of a peer that was
    /// never added. Runs on the dispatcher, outside registry locks.
    pub fn reg_unknown_peer_handler<F>(&self, handler: F)
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        *self.inner.unknown_cb.lock() = Some(Arc::new(handler));
    }

    /// Send a typed message on a connection handle directly.
    pub fn send_msg_conn<M: Payload>(&self, msg: M, conn: &ConnRef) {
        self.net.send_msg(msg, conn);
    }
}

impl Drop for PeerNetwork {
    fn drop(&mut self) {
        self.stop();
    }
}

// Everything below runs on the dispatcher thread.
impl PeerInner {
    fn arc(&self) -> Option<Arc<PeerInner>> {
        self.weak_self.upgrade()
    }

    /// Map a user-supplied address to the registry identity.
    fn identity_of(&self, addr: SocketAddr) -> SocketAddr {
        match self.config.id_mode {
            IdentityMode::IpBased => SocketAddr::new(addr.ip(), 0),
            IdentityMode::IpPortBased => addr,
        }
    }

    /// Connection established (either direction): arm the inactivity
    /// timer and open the handshake with a PING.
    fn on_setup(&self, conn: &ConnRef) {
        tracing::debug!("connection to {} up ({:?})", conn.addr(), conn.mode());
        self.reset_timeout(conn);
        let listen_port = self.state.lock().listen_port;
        send_on_conn(&self.shared, &self.ping_msg(listen_port), conn);
    }

    /// Connection lost. Only reacts when this is the peer's *current*
    /// connection; a losing duplicate from a dial race tears down without
    /// touching the peer.
    fn on_teardown(&self, conn: &ConnRef) {
        let Some(id) = conn.peer_id() else { return };
        let mut st = self.state.lock();
        let in_known = st.known.contains_key(&id);
        let Some(peer) = st.get_peer_mut(&id) else { return };
        if !peer.holds(conn) {
            return;
        }
        peer.ping_timer.cancel();
        peer.connected = false;
        peer.conn = None;
        tracing::info!("connection lost: {}", conn.addr());
        if in_known {
            let Some(inner) = self.arc() else { return };
            let delay = gen_rand_timeout(self.config.retry_conn_delay);
            tracing::debug!("reconnecting to {} in {:?}", id, delay);
            self.disp.schedule(delay, &peer.retry_timer, move || {
                let mut st = inner.state.lock();
                inner.start_active_conn(&mut st, id);
            });
        }
    }

    /// Re-arm the inactivity timer on a connection. A no-op once the
    /// connection is dead.
    fn reset_timeout(&self, conn: &ConnRef) {
        let Some(inner) = self.arc() else { return };
        let timer_conn = Arc::clone(conn);
        self.disp
            .schedule(self.config.conn_timeout, &conn.timeout_timer, move || {
                if timer_conn.is_dead() {
                    return;
                }
                tracing::info!("peer ping-pong timeout on {}", timer_conn.addr());
                inner.pool.terminate(&timer_conn);
            });
    }

    fn handle_ping(&self, msg: &Msg, conn: &ConnRef) {
        if conn.is_dead() {
            return;
        }
        let port = match decode_port(msg.payload()) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("malformed ping from {}: {}", conn.addr(), e);
                return;
            }
        };
        tracing::debug!("ping from {}, port {}", conn.addr(), port);
        let mut st = self.state.lock();
        if self.check_new_conn(&mut st, conn, port) {
            return;
        }
        let listen_port = st.listen_port;
        drop(st);
        send_on_conn(&self.shared, &self.pong_msg(listen_port), conn);
    }

    fn handle_pong(&self, msg: &Msg, conn: &ConnRef) {
        if conn.is_dead() {
            return;
        }
        let port = match decode_port(msg.payload()) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("malformed pong from {}: {}", conn.addr(), e);
                return;
            }
        };
        tracing::debug!("pong from {}, port {}", conn.addr(), port);
        let mut st = self.state.lock();
        let known_id = conn.peer_id().filter(|id| st.get_peer(id).is_some());
        if known_id.is_none() {
            tracing::warn!("pong message discarded");
            return;
        }
        if self.check_new_conn(&mut st, conn, port) {
            return;
        }
        let Some(id) = conn.peer_id() else { return };
        let listen_port = st.listen_port;
        let Some(peer) = st.get_peer_mut(&id) else { return };
        peer.pong_received = true;
        if peer.ping_timer_fired {
            // Both the period and the response have arrived; next round.
            self.reset_ping_timer(peer, id);
            self.send_ping(peer, listen_port);
        }
    }

    /// Identity resolution and duplicate arbitration for a connection
    /// that just produced a PING or PONG. Returns `true` when the
    /// connection was terminated here.
    fn check_new_conn(&self, st: &mut PeerState, conn: &ConnRef, port: u16) -> bool {
        if conn.peer_id().is_none() {
            // Passive connection dialed from an ephemeral port; identity
            // comes from the advertised listen port.
            let ip = conn.addr().ip();
            let id = match self.config.id_mode {
                IdentityMode::IpBased => SocketAddr::new(ip, 0),
                IdentityMode::IpPortBased => SocketAddr::new(ip, port),
            };
            conn.set_peer_id(id);
        }
        let Some(id) = conn.peer_id() else { return false };

        if !st.known.contains_key(&id) {
            self.notify_unknown(id);
            if !self.config.allow_unknown_peer {
                tracing::info!("terminating connection from unknown peer {}", id);
                self.pool.terminate(conn);
                return true;
            }
            st.unknown.entry(id).or_insert_with(|| Peer::new(conn.addr()));
        }

        let listen_port = st.listen_port;
        let Some(peer) = st.get_peer_mut(&id) else { return false };

        if peer.connected {
            if !peer.holds(conn) {
                // Symmetric dial race: the first established connection
                // wins, the later one dies on arrival.
                tracing::info!("duplicate connection to {}, terminating {}", id, conn.addr());
                self.pool.terminate(conn);
                return true;
            }
            return false;
        }

        self.reset_conn(peer, conn);
        peer.connected = true;
        self.reset_ping_timer(peer, id);
        self.send_ping(peer, listen_port);
        tracing::info!("established connection with {} via {}", id, conn.addr());
        false
    }

    /// Bind a connection to a peer, terminating any prior half-open one
    /// and clearing its ping timer.
    fn reset_conn(&self, peer: &mut Peer, new_conn: &ConnRef) {
        if !peer.holds(new_conn) {
            if let Some(old) = peer.conn.take() {
                tracing::info!("terminating old connection {}", old.addr());
                self.pool.terminate(&old);
            }
            peer.addr = new_conn.addr();
            peer.conn = Some(Arc::clone(new_conn));
        }
        peer.ping_timer.cancel();
    }

    /// Arm the jittered periodic ping timer.
    fn reset_ping_timer(&self, peer: &Peer, id: SocketAddr) {
        let Some(inner) = self.arc() else { return };
        let delay = gen_rand_timeout(self.config.ping_period);
        self.disp.schedule(delay, &peer.ping_timer, move || {
            inner.ping_timer_fired(id);
        });
    }

    fn ping_timer_fired(&self, id: SocketAddr) {
        let mut st = self.state.lock();
        let listen_port = st.listen_port;
        let Some(peer) = st.get_peer_mut(&id) else { return };
        peer.ping_timer_fired = true;
        if peer.pong_received {
            self.reset_ping_timer(peer, id);
            self.send_ping(peer, listen_port);
        }
    }

    /// Emit a PING on the peer's connection, resetting the rendezvous
    /// flags and the inactivity timer.
    fn send_ping(&self, peer: &mut Peer, listen_port: u16) {
        peer.ping_timer_fired = false;
        peer.pong_received = false;
        if let Some(conn) = peer.conn.clone() {
            self.reset_timeout(&conn);
            send_on_conn(&self.shared, &self.ping_msg(listen_port), &conn);
        }
    }

    /// Dial a peer unless it is already connected. The dial target is the
    /// identity under `IpPortBased` (the advertised listen endpoint) and
    /// the last observed connection address under `IpBased`.
    fn start_active_conn(&self, st: &mut PeerState, id: SocketAddr) {
        let id_mode = self.config.id_mode;
        let Some(peer) = st.get_peer_mut(&id) else { return };
        if peer.connected {
            return;
        }
        let target = match id_mode {
            IdentityMode::IpPortBased => id,
            IdentityMode::IpBased => peer.addr,
        };
        tracing::debug!("dialing peer {} at {}", id, target);
        let conn = self.pool.connect(target);
        conn.set_peer_id(id);
        peer.conn = Some(conn);
    }

    fn notify_unknown(&self, id: SocketAddr) {
        let cb = self.unknown_cb.lock().clone();
        if let Some(cb) = cb {
            // Posted so the callback runs outside the registry lock.
            self.disp.post(move || cb(id));
        }
    }

    fn ping_msg(&self, listen_port: u16) -> Msg {
        Msg::new(self.config.opcode_ping, listen_port.to_le_bytes().to_vec())
    }

    fn pong_msg(&self, listen_port: u16) -> Msg {
        Msg::new(self.config.opcode_pong, listen_port.to_le_bytes().to_vec())
    }
}

/// `u16` little-endian port field of PING/PONG payloads.
fn decode_port(bytes: &[u8]) -> Result<u16> {
    if bytes.len() != 2 {
        return Err(LinkError::Protocol(format!(
            "bad ping/pong payload length {}",
            bytes.len()
        )));
    }
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Uniform random duration in `[base, 2*base)`; desynchronizes ping and
/// reconnect schedules across a swarm.
pub(crate) fn gen_rand_timeout(base: Duration) -> Duration {
    base.mul_f64(1.0 + rand::thread_rng().gen::<f64>())
}
