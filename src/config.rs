//! Configuration for peerlink networks
//!
//! Centralized configuration with sensible defaults. Setters chain, so a
//! config reads as one expression:
//!
//! ```
//! use std::time::Duration;
//! use peerlink::config::PeerNetConfig;
//!
//! let config = PeerNetConfig::default()
//!     .ping_period(Duration::from_secs(1))
//!     .conn_timeout(Duration::from_secs(5));
//! assert_eq!(config.ping_period, Duration::from_secs(1));
//! ```

use std::time::Duration;

use crate::msg::Opcode;

/// Configuration for [`crate::MsgNetwork`] (and layers built on it)
#[derive(Debug, Clone)]
pub struct MsgNetConfig {
    // -------------------------------------------------------------------------
    // Dispatch Configuration
    // -------------------------------------------------------------------------
    /// Max inbound messages dispatched per scheduling slice
    pub burst_size: usize,

    /// Inbound message queue capacity (producers yield-spin when full)
    pub queue_capacity: usize,

    // -------------------------------------------------------------------------
    // Wire Configuration
    // -------------------------------------------------------------------------
    /// Max payload size accepted from the wire; larger frames terminate
    /// the connection
    pub max_msg_size: usize,

    /// Socket read chunk size for the per-connection reader
    pub seg_buff_size: usize,
}

impl Default for MsgNetConfig {
    fn default() -> Self {
        Self {
            burst_size: 1000,
            queue_capacity: 65536,
            max_msg_size: 16 * 1024 * 1024, // 16 MiB
            seg_buff_size: 4096,
        }
    }
}

impl MsgNetConfig {
    pub fn burst_size(mut self, x: usize) -> Self {
        self.burst_size = x;
        self
    }

    pub fn queue_capacity(mut self, x: usize) -> Self {
        self.queue_capacity = x;
        self
    }

    pub fn max_msg_size(mut self, x: usize) -> Self {
        self.max_msg_size = x;
        self
    }

    pub fn seg_buff_size(mut self, x: usize) -> Self {
        self.seg_buff_size = x;
        self
    }
}

/// Peer identity scheme for [`crate::PeerNetwork`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMode {
    /// Identity is the remote IP; the port field is zeroed
    IpBased,

    /// Identity is `(IP, listen_port)`, where the listen port is learned
    /// from the peer's PING/PONG payload rather than the connection's
    /// source port
    IpPortBased,
}

/// Configuration for [`crate::PeerNetwork`]
#[derive(Debug, Clone)]
pub struct PeerNetConfig {
    /// Transport-level configuration
    pub msg_net: MsgNetConfig,

    // -------------------------------------------------------------------------
    // Liveness Configuration
    // -------------------------------------------------------------------------
    /// Base delay before re-dialing a lost peer; actual delay is jittered
    /// into `[base, 2*base)`
    pub retry_conn_delay: Duration,

    /// Base period between PINGs on an established connection (jittered)
    pub ping_period: Duration,

    /// Inactivity timeout; reset on every PING sent, expiry terminates
    /// the connection
    pub conn_timeout: Duration,

    // -------------------------------------------------------------------------
    // Identity Configuration
    // -------------------------------------------------------------------------
    /// Peer identity scheme
    pub id_mode: IdentityMode,

    /// Accept connections from peers that were never `add_peer`ed
    pub allow_unknown_peer: bool,

    /// Reserved opcode for the PING message
    pub opcode_ping: Opcode,

    /// Reserved opcode for the PONG message
    pub opcode_pong: Opcode,
}

impl Default for PeerNetConfig {
    fn default() -> Self {
        Self {
            msg_net: MsgNetConfig::default(),
            retry_conn_delay: Duration::from_secs(2),
            ping_period: Duration::from_secs(30),
            conn_timeout: Duration::from_secs(180),
            id_mode: IdentityMode::IpPortBased,
            allow_unknown_peer: false,
            opcode_ping: 0xf0,
            opcode_pong: 0xf1,
        }
    }
}

impl PeerNetConfig {
    pub fn msg_net(mut self, x: MsgNetConfig) -> Self {
        self.msg_net = x;
        self
    }

    pub fn retry_conn_delay(mut self, x: Duration) -> Self {
        self.retry_conn_delay = x;
        self
    }

    pub fn ping_period(mut self, x: Duration) -> Self {
        self.ping_period = x;
        self
    }

    pub fn conn_timeout(mut self, x: Duration) -> Self {
        self.conn_timeout = x;
        self
    }

    pub fn id_mode(mut self, x: IdentityMode) -> Self {
        self.id_mode = x;
        self
    }

    pub fn allow_unknown_peer(mut self, x: bool) -> Self {
        self.allow_unknown_peer = x;
        self
    }

    pub fn ping_pong_opcodes(mut self, ping: Opcode, pong: Opcode) -> Self {
        self.opcode_ping = ping;
        self.opcode_pong = pong;
        self
    }
}
