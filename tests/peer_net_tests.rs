//! PeerNetwork integration tests
//!
//! End-to-end scenarios over real localhost sockets: keepalive, the
//! symmetric dial race, reconnection, unknown-peer policy, and payload
//! integrity. Nodes bind ephemeral ports; identities resolve through the
//! listen port carried in PING/PONG.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use peerlink::{
    ConnRef, LinkError, MsgNetConfig, Opcode, Payload, PeerNetConfig, PeerNetwork, Result,
};

fn wait_until(timeout: Duration, f: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    f()
}

fn local(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

fn fast_config() -> PeerNetConfig {
    PeerNetConfig::default()
        .ping_period(Duration::from_millis(300))
        .conn_timeout(Duration::from_secs(5))
        .retry_conn_delay(Duration::from_millis(300))
}

/// Node listening on an ephemeral port.
fn make_node(config: PeerNetConfig) -> (Arc<PeerNetwork>, SocketAddr) {
    let net = Arc::new(PeerNetwork::new(config).unwrap());
    let addr = net.listen(local(0)).unwrap();
    (net, addr)
}

// =============================================================================
// Keepalive
// =============================================================================

#[test]
fn test_ping_pong_keepalive() {
    let (a, addr_a) = make_node(fast_config());
    let (b, addr_b) = make_node(fast_config());

    a.add_peer(addr_b);
    b.add_peer(addr_a);

    // Both sides converge to one established connection within 2 s.
    assert!(wait_until(Duration::from_secs(2), || {
        a.connected_peer_count() == 1 && b.connected_peer_count() == 1
    }));
    assert!(a.has_peer(addr_b));
    assert!(b.has_peer(addr_a));

    // With a 300 ms ping period, several PING/PONG round-trips complete
    // within 5 s; all of that traffic shows up on the connection counters.
    thread::sleep(Duration::from_secs(5));
    let conn = a.get_peer_conn(addr_b).unwrap().expect("connected");
    assert!(!conn.is_dead());
    assert!(conn.msgs_recv() >= 3, "only {} msgs received", conn.msgs_recv());
    assert!(conn.msgs_sent() >= 3);

    a.stop();
    b.stop();
}

// =============================================================================
// Symmetric Dial Race
// =============================================================================

#[test]
fn test_dial_race_converges_to_one_conn_per_pair() {
    const N: usize = 5;
    let mut nodes = Vec::new();
    let mut addrs = Vec::new();
    for _ in 0..N {
        let (net, addr) = make_node(fast_config());
        nodes.push(net);
        addrs.push(addr);
    }

    // Everyone adds everyone else at once; both ends of every pair dial.
    for (i, node) in nodes.iter().enumerate() {
        for (j, addr) in addrs.iter().enumerate() {
            if i != j {
                node.add_peer(*addr);
            }
        }
    }

    // Each node ends up with all four peers connected. A cross-pick (both
    // ends binding different sockets of the same pair) costs one jittered
    // retry round, so the window is generous.
    assert!(wait_until(Duration::from_secs(10), || {
        nodes.iter().all(|n| n.connected_peer_count() == N - 1)
    }));

    // ...and exactly one live connection per pair: the losing duplicate
    // of each race has been torn down and left the pool.
    assert!(wait_until(Duration::from_secs(5), || {
        nodes.iter().all(|n| n.conn_count() == N - 1)
    }));

    // Hold for a moment: convergence is stable, not transient.
    thread::sleep(Duration::from_secs(1));
    for node in &nodes {
        assert_eq!(node.connected_peer_count(), N - 1);
        assert_eq!(node.conn_count(), N - 1);
    }

    for node in &nodes {
        node.stop();
    }
}

// =============================================================================
// Reconnect
// =============================================================================

#[test]
fn test_reconnect_after_forced_termination() {
    // Single-sided topology: A dials, B accepts unknown peers. Keeps the
    // reconnect path free of dial-race noise.
    let (a, _addr_a) = make_node(fast_config());
    let (b, addr_b) = make_node(fast_config().allow_unknown_peer(true));

    a.add_peer(addr_b);
    assert!(wait_until(Duration::from_secs(2), || a.connected_peer_count() == 1));

    let old_conn = a.get_peer_conn(addr_b).unwrap().expect("connected");
    a.terminate(&old_conn);

    // The retry timer re-dials within [retry, 2*retry); with 300 ms base
    // a new connection is live well within 3 s.
    assert!(wait_until(Duration::from_secs(3), || {
        a.connected_peer_count() == 1
            && a.get_peer_conn(addr_b)
                .ok()
                .flatten()
                .map_or(false, |c| !c.is_dead() && !Arc::ptr_eq(&c, &old_conn))
    }));
    assert!(old_conn.is_dead());

    // PING/PONG resumes on the replacement connection.
    let new_conn = a.get_peer_conn(addr_b).unwrap().expect("reconnected");
    let before = new_conn.msgs_recv();
    assert!(wait_until(Duration::from_secs(2), || new_conn.msgs_recv() > before));

    a.stop();
    b.stop();
}

#[test]
fn test_reconnect_delay_within_jitter_window() {
    let retry = Duration::from_millis(500);
    let (a, _addr_a) = make_node(fast_config().retry_conn_delay(retry));
    let (b, addr_b) = make_node(
        fast_config()
            .retry_conn_delay(retry)
            .allow_unknown_peer(true),
    );

    a.add_peer(addr_b);
    assert!(wait_until(Duration::from_secs(2), || a.connected_peer_count() == 1));

    // Stop B entirely: A's reconnect attempts keep failing, so the peer
    // stays disconnected past the retry window...
    b.stop();
    assert!(wait_until(Duration::from_secs(2), || a.connected_peer_count() == 0));

    // ...but A keeps the peer and never drops it from the known set.
    thread::sleep(2 * retry);
    assert!(a.has_peer(addr_b));
    assert_eq!(a.connected_peer_count(), 0);

    a.stop();
}

// =============================================================================
// Unknown Peers
// =============================================================================

#[test]
fn test_unknown_peer_rejected_by_default() {
    let (a, addr_a) = make_node(fast_config());
    let unknown_seen: Arc<Mutex<Vec<SocketAddr>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let unknown_seen = Arc::clone(&unknown_seen);
        a.reg_unknown_peer_handler(move |id| {
            unknown_seen.lock().unwrap().push(id);
        });
    }

    // C dials A without A ever having added C.
    let (c, addr_c) = make_node(fast_config());
    c.add_peer(addr_a);

    // A learns C's identity (its listen endpoint) and terminates the
    // inbound connection within a second.
    assert!(wait_until(Duration::from_secs(1), || {
        unknown_seen.lock().unwrap().contains(&addr_c)
    }));
    assert!(wait_until(Duration::from_secs(1), || a.conn_count() == 0));
    assert!(!a.has_peer(addr_c));
    assert_eq!(a.connected_peer_count(), 0);

    a.stop();
    c.stop();
}

#[test]
fn test_unknown_peer_accepted_when_allowed() {
    let (a, addr_a) = make_node(fast_config().allow_unknown_peer(true));
    let (c, addr_c) = make_node(fast_config());
    c.add_peer(addr_a);

    // The connection survives and A tracks C in the unknown set: not a
    // known peer, but its connection is queryable.
    assert!(wait_until(Duration::from_secs(2), || {
        a.get_peer_conn(addr_c).ok().flatten().is_some()
    }));
    assert!(!a.has_peer(addr_c));

    // Promotion: add_peer moves the same identity into the known set
    // without creating a second peer or a second connection.
    a.add_peer(addr_c);
    assert!(wait_until(Duration::from_secs(2), || a.has_peer(addr_c)));
    assert!(wait_until(Duration::from_secs(2), || {
        a.connected_peer_count() == 1 && a.conn_count() == 1
    }));

    a.stop();
    c.stop();
}

// =============================================================================
// Peer API Errors
// =============================================================================

#[test]
fn test_duplicate_add_peer_is_recoverable() {
    let (a, _addr_a) = make_node(fast_config());
    let recoverable = Arc::new(AtomicUsize::new(0));
    let fatal = Arc::new(AtomicUsize::new(0));
    {
        let recoverable = Arc::clone(&recoverable);
        let fatal = Arc::clone(&fatal);
        a.reg_error_handler(move |err, is_fatal| {
            if is_fatal {
                fatal.fetch_add(1, Ordering::SeqCst);
            } else {
                assert!(err.is_recoverable());
                assert!(matches!(err, LinkError::PeerAlreadyExists(_)));
                recoverable.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let target = local(45678);
    a.add_peer(target);
    a.add_peer(target);

    assert!(wait_until(Duration::from_secs(2), || recoverable
        .load(Ordering::SeqCst)
        == 1));
    assert_eq!(fatal.load(Ordering::SeqCst), 0);
    // The registry still holds exactly one entry for the identity.
    assert!(a.has_peer(target));

    a.stop();
}

#[test]
fn test_add_peer_before_listen_is_not_listening() {
    // No listen() yet: the node has no port to advertise in PING, so
    // joining the overlay is rejected with the dedicated error.
    let net = PeerNetwork::new(fast_config()).unwrap();
    let not_listening = Arc::new(AtomicUsize::new(0));
    {
        let not_listening = Arc::clone(&not_listening);
        net.reg_error_handler(move |err, fatal| {
            if matches!(err, LinkError::NotListening) {
                assert!(!fatal);
                assert!(err.is_recoverable());
                not_listening.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let target = local(45690);
    net.add_peer(target);
    assert!(wait_until(Duration::from_secs(2), || not_listening
        .load(Ordering::SeqCst)
        == 1));
    assert!(!net.has_peer(target));

    // Once listening, the same add goes through.
    net.listen(local(0)).unwrap();
    net.add_peer(target);
    assert!(wait_until(Duration::from_secs(2), || net.has_peer(target)));
    assert_eq!(not_listening.load(Ordering::SeqCst), 1);

    net.stop();
}

#[test]
fn test_del_peer_unknown_is_recoverable() {
    let (a, _addr_a) = make_node(fast_config());
    let not_found = Arc::new(AtomicUsize::new(0));
    {
        let not_found = Arc::clone(&not_found);
        a.reg_error_handler(move |err, _fatal| {
            if matches!(err, LinkError::PeerNotFound(_)) {
                not_found.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    a.del_peer(local(45679));
    assert!(wait_until(Duration::from_secs(2), || not_found
        .load(Ordering::SeqCst)
        == 1));

    a.stop();
}

#[test]
fn test_del_peer_tears_down_and_cancels_retry() {
    let (a, addr_a) = make_node(fast_config());
    let (b, addr_b) = make_node(fast_config());

    a.add_peer(addr_b);
    b.add_peer(addr_a);
    assert!(wait_until(Duration::from_secs(2), || a.connected_peer_count() == 1));

    a.del_peer(addr_b);
    assert!(wait_until(Duration::from_secs(2), || !a.has_peer(addr_b)));
    assert!(wait_until(Duration::from_secs(2), || a.conn_count() == 0));

    // No reconnect attempt sneaks in after removal: well past the retry
    // window the pool stays empty. (B may re-dial us, so B is stopped
    // first.)
    b.stop();
    thread::sleep(Duration::from_millis(900));
    assert_eq!(a.conn_count(), 0);
    assert!(!a.has_peer(addr_b));

    a.stop();
}

#[test]
fn test_send_to_missing_peer_is_recoverable() {
    let (a, _addr_a) = make_node(fast_config());
    let not_found = Arc::new(AtomicUsize::new(0));
    {
        let not_found = Arc::clone(&not_found);
        a.reg_error_handler(move |err, _fatal| {
            if matches!(err, LinkError::PeerNotFound(_)) {
                not_found.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    a.send_msg(Blob { bytes: vec![1] }, local(45680));
    assert!(wait_until(Duration::from_secs(2), || not_found
        .load(Ordering::SeqCst)
        == 1));

    assert!(a.get_peer_conn(local(45680)).is_err());

    a.stop();
}

// =============================================================================
// Payload Integrity
// =============================================================================

struct Blob {
    bytes: Vec<u8>,
}

impl Payload for Blob {
    const OPCODE: Opcode = 0x10;

    fn encode_payload(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    fn decode_payload(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }
}

struct BlobAck {
    hash: [u8; 32],
}

impl Payload for BlobAck {
    const OPCODE: Opcode = 0x11;

    fn encode_payload(&self) -> Vec<u8> {
        self.hash.to_vec()
    }

    fn decode_payload(bytes: &[u8]) -> Result<Self> {
        let hash: [u8; 32] = bytes
            .try_into()
            .map_err(|_| LinkError::Protocol(format!("bad ack length {}", bytes.len())))?;
        Ok(Self { hash })
    }
}

#[test]
fn test_payload_integrity_with_hashed_acks() {
    // Small read chunks so payloads span many socket reads. Only A dials
    // (B accepts it as an unknown peer), so exactly one connection exists
    // for the whole exchange.
    let seg_buff_size = 256;
    let (a, _addr_a) = make_node(
        fast_config().msg_net(MsgNetConfig::default().seg_buff_size(seg_buff_size)),
    );
    let (b, addr_b) = make_node(
        fast_config()
            .msg_net(MsgNetConfig::default().seg_buff_size(seg_buff_size))
            .allow_unknown_peer(true),
    );

    // B acknowledges every blob with its sha256.
    {
        let b_ref = Arc::clone(&b);
        b.reg_handler(move |msg: Blob, conn: ConnRef| {
            let hash: [u8; 32] = Sha256::digest(&msg.bytes).into();
            b_ref.send_msg_conn(BlobAck { hash }, &conn);
        });
    }

    // A records the acks in arrival order.
    let acks: Arc<Mutex<Vec<[u8; 32]>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let acks = Arc::clone(&acks);
        a.reg_handler(move |msg: BlobAck, _conn: ConnRef| {
            acks.lock().unwrap().push(msg.hash);
        });
    }

    a.add_peer(addr_b);
    assert!(wait_until(Duration::from_secs(2), || a.connected_peer_count() == 1));

    // Sizes from one byte up to twice the read chunk.
    let mut expected = Vec::new();
    for size in 1..=(2 * seg_buff_size) {
        let bytes: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
        expected.push(<[u8; 32]>::from(Sha256::digest(&bytes)));
        a.send_msg(Blob { bytes }, addr_b);
    }

    assert!(wait_until(Duration::from_secs(10), || acks.lock().unwrap().len()
        == expected.len()));
    // Per-connection FIFO both ways: ack order matches send order, every
    // hash matches the sender-side digest.
    assert_eq!(*acks.lock().unwrap(), expected);

    a.stop();
    b.stop();
}

// =============================================================================
// Multicast
// =============================================================================

#[test]
fn test_multicast_best_effort_prefix() {
    // Only A dials; B and C accept it as an unknown peer, so no dial
    // races complicate the connection count.
    let (a, _addr_a) = make_node(fast_config());
    let (b, addr_b) = make_node(fast_config().allow_unknown_peer(true));
    let (c, addr_c) = make_node(fast_config().allow_unknown_peer(true));

    let b_got = Arc::new(AtomicUsize::new(0));
    let c_got = Arc::new(AtomicUsize::new(0));
    {
        let b_got = Arc::clone(&b_got);
        b.reg_handler(move |_msg: Blob, _conn: ConnRef| {
            b_got.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let c_got = Arc::clone(&c_got);
        c.reg_handler(move |_msg: Blob, _conn: ConnRef| {
            c_got.fetch_add(1, Ordering::SeqCst);
        });
    }

    a.add_peer(addr_b);
    a.add_peer(addr_c);
    assert!(wait_until(Duration::from_secs(2), || a.connected_peer_count() == 2));

    let missing = local(45681);
    let not_found = Arc::new(AtomicUsize::new(0));
    {
        let not_found = Arc::clone(&not_found);
        a.reg_error_handler(move |err, _fatal| {
            if matches!(err, LinkError::PeerNotFound(_)) {
                not_found.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    // B precedes the missing address, C follows it: B receives the
    // message, the batch aborts at the failure, C never sees it.
    a.multicast_msg(Blob { bytes: vec![42] }, &[addr_b, missing, addr_c]);

    assert!(wait_until(Duration::from_secs(2), || b_got.load(Ordering::SeqCst) == 1));
    assert!(wait_until(Duration::from_secs(2), || not_found
        .load(Ordering::SeqCst)
        == 1));
    thread::sleep(Duration::from_millis(300));
    assert_eq!(c_got.load(Ordering::SeqCst), 0);

    // A clean multicast reaches everyone.
    a.multicast_msg(Blob { bytes: vec![43] }, &[addr_b, addr_c]);
    assert!(wait_until(Duration::from_secs(2), || {
        b_got.load(Ordering::SeqCst) == 2 && c_got.load(Ordering::SeqCst) == 1
    }));

    a.stop();
    b.stop();
    c.stop();
}

// =============================================================================
// Inactivity Timeout
// =============================================================================

#[test]
fn test_inactivity_terminates_silent_connection() {
    // A raw transport client connects to a peer node but never answers
    // its PING; the node's inactivity timer kills the connection.
    let (a, addr_a) = make_node(
        fast_config()
            .conn_timeout(Duration::from_millis(600))
            .allow_unknown_peer(true),
    );

    let client = peerlink::MsgNetwork::new(MsgNetConfig::default()).unwrap();
    // Swallow the node's PINGs without replying.
    client.set_handler(0xf0, |_msg, _conn| {});
    let conn = client.connect(addr_a);

    assert!(wait_until(Duration::from_secs(1), || a.conn_count() == 1));
    // No PONG ever arrives; within conn_timeout (plus slack) the node
    // tears the connection down and the client observes the close.
    assert!(wait_until(Duration::from_secs(3), || conn.is_dead()));
    assert!(wait_until(Duration::from_secs(1), || a.conn_count() == 0));

    client.stop();
    a.stop();
}
