//! Full-mesh stress demo
//!
//! Spawns N peer nodes on localhost, connects them into a full mesh, and
//! exchanges random payloads of escalating size. Every payload is
//! answered with an ACK carrying its sha256, which the sender verifies
//! against the digest it recorded at send time; any mismatch is
//! corrupted I/O and aborts the run.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing_subscriber::{fmt, EnvFilter};

use peerlink::{
    ConnMode, ConnRef, LinkError, MsgNetConfig, Opcode, Payload, PeerNetConfig, PeerNetwork,
};

/// Peerlink stress demo
#[derive(Parser, Debug)]
#[command(name = "p2p-stress")]
#[command(about = "Full-mesh peer network stress demo")]
#[command(version)]
struct Args {
    /// Number of local nodes
    #[arg(long, default_value = "5")]
    npeers: usize,

    /// Socket read chunk size; payload escalation tops out at twice this
    #[arg(long, default_value = "4096")]
    seg_buff_size: usize,

    /// First listen port; node i listens on base_port + i
    #[arg(long, default_value = "12345")]
    base_port: u16,

    /// Only form the mesh, send no payload traffic
    #[arg(long)]
    no_msg: bool,

    /// Seconds to run before shutting down
    #[arg(long, default_value = "10")]
    duration_secs: u64,
}

struct MsgRand {
    bytes: Vec<u8>,
}

impl MsgRand {
    fn random(size: usize) -> Self {
        let mut bytes = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }
}

impl Payload for MsgRand {
    const OPCODE: Opcode = 0x00;

    fn encode_payload(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    fn decode_payload(bytes: &[u8]) -> peerlink::Result<Self> {
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }
}

struct MsgAck {
    hash: [u8; 32],
}

impl Payload for MsgAck {
    const OPCODE: Opcode = 0x01;

    fn encode_payload(&self) -> Vec<u8> {
        self.hash.to_vec()
    }

    fn decode_payload(bytes: &[u8]) -> peerlink::Result<Self> {
        let hash: [u8; 32] = bytes
            .try_into()
            .map_err(|_| LinkError::Protocol(format!("bad ack length {}", bytes.len())))?;
        Ok(Self { hash })
    }
}

/// Per-remote progress: the escalation state and the digest of the
/// payload awaiting its ACK.
#[derive(Default)]
struct TestContext {
    state: i64,
    hash: [u8; 32],
}

type ContextMap = Arc<Mutex<HashMap<SocketAddr, TestContext>>>;

fn context_key(conn: &ConnRef) -> SocketAddr {
    conn.peer_id().unwrap_or_else(|| conn.addr())
}

fn install_proto(net: &Arc<PeerNetwork>, seg_buff_size: usize) {
    let contexts: ContextMap = Arc::new(Mutex::new(HashMap::new()));

    let send_rand = {
        let net = Arc::clone(net);
        let contexts = Arc::clone(&contexts);
        Arc::new(move |size: usize, conn: &ConnRef| {
            let msg = MsgRand::random(size);
            let hash: [u8; 32] = Sha256::digest(&msg.bytes).into();
            contexts.lock().entry(context_key(conn)).or_default().hash = hash;
            net.send_msg_conn(msg, conn);
        })
    };

    // The dialing side opens the payload exchange once the connection is up.
    {
        let contexts = Arc::clone(&contexts);
        let send_rand = Arc::clone(&send_rand);
        net.reg_conn_handler(move |conn, connected| {
            if connected && conn.mode() == ConnMode::Active {
                contexts.lock().entry(context_key(conn)).or_default().state = 1;
                send_rand(1, conn);
            }
        });
    }

    // Echo every payload's digest back.
    {
        let net_ref = Arc::clone(net);
        net.reg_handler(move |msg: MsgRand, conn: ConnRef| {
            let hash: [u8; 32] = Sha256::digest(&msg.bytes).into();
            net_ref.send_msg_conn(MsgAck { hash }, &conn);
        });
    }

    // Verify the digest and escalate the payload size.
    {
        let contexts = Arc::clone(&contexts);
        let send_rand = Arc::clone(&send_rand);
        net.reg_handler(move |msg: MsgAck, conn: ConnRef| {
            let next_size;
            {
                let mut map = contexts.lock();
                let tc = map.entry(context_key(&conn)).or_default();
                if msg.hash != tc.hash {
                    tracing::error!("corrupted I/O!");
                    std::process::exit(1);
                }
                if tc.state == (seg_buff_size * 2) as i64 {
                    tracing::info!("entering rand-bombard phase with {}", conn.addr());
                    next_size = tc.state as usize;
                    tc.state = -1;
                } else if tc.state == -1 {
                    next_size = rand::thread_rng().next_u32() as usize % (seg_buff_size * 10);
                } else {
                    tc.state += 1;
                    next_size = tc.state as usize;
                }
            }
            send_rand(next_size, &conn);
        });
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,peerlink=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("peerlink p2p-stress v{}", peerlink::VERSION);
    tracing::info!(
        "{} nodes, seg_buff_size {}, ports {}..{}",
        args.npeers,
        args.seg_buff_size,
        args.base_port,
        args.base_port as usize + args.npeers - 1
    );

    let addrs: Vec<SocketAddr> = (0..args.npeers)
        .map(|i| {
            format!("127.0.0.1:{}", args.base_port as usize + i)
                .parse()
                .expect("valid address")
        })
        .collect();

    let mut nodes = Vec::with_capacity(args.npeers);
    for (i, addr) in addrs.iter().enumerate() {
        let config = PeerNetConfig::default()
            .msg_net(MsgNetConfig::default().seg_buff_size(args.seg_buff_size))
            .ping_period(Duration::from_secs(2))
            .conn_timeout(Duration::from_secs(5));

        let net = match PeerNetwork::new(config) {
            Ok(net) => Arc::new(net),
            Err(e) => {
                tracing::error!("failed to create node {}: {}", i, e);
                std::process::exit(1);
            }
        };

        if !args.no_msg {
            install_proto(&net, args.seg_buff_size);
        }

        if let Err(e) = net.listen(*addr) {
            tracing::error!("node {} failed to listen on {}: {}", i, addr, e);
            std::process::exit(1);
        }
        for peer_addr in &addrs {
            if peer_addr != addr {
                net.add_peer(*peer_addr);
            }
        }
        nodes.push(net);
    }

    std::thread::sleep(Duration::from_secs(args.duration_secs));

    for (i, net) in nodes.iter().enumerate() {
        let conn = net
            .get_peer_conn(addrs[(i + 1) % args.npeers])
            .ok()
            .flatten();
        if let Some(conn) = conn {
            tracing::info!(
                "node {}: {} peers connected, sample conn sent {} msgs / {} bytes, recv {} msgs / {} bytes",
                i,
                net.connected_peer_count(),
                conn.msgs_sent(),
                conn.bytes_sent(),
                conn.msgs_recv(),
                conn.bytes_recv()
            );
        }
    }

    for net in &nodes {
        net.stop();
    }
    tracing::info!("done");
}
