//! Wire message format
//!
//! Every message on the wire is a fixed-size header followed by a raw
//! payload:
//!
//! ```text
//! ┌───────────┬─────────────┬──────────────┬─────────────────────┐
//! │ Opcode(1) │ Len (4, LE) │ CRC32 (4,LE) │       Payload       │
//! └───────────┴─────────────┴──────────────┴─────────────────────┘
//! ```
//!
//! The checksum covers the payload only. Both endpoints must agree on the
//! header layout; there is no version negotiation.

use crate::error::{LinkError, Result};

/// Opcode width used throughout the library.
///
/// `0xf0` and `0xf1` are reserved by [`crate::PeerNetwork`] for its
/// PING/PONG liveness protocol (configurable via
/// [`crate::config::PeerNetConfig`]); user protocols should avoid them.
pub type Opcode = u8;

/// Header size: 1 byte opcode + 4 bytes length + 4 bytes checksum
pub const HEADER_SIZE: usize = 9;

/// A framed wire message: header plus payload.
#[derive(Debug, Clone)]
pub struct Msg {
    opcode: Opcode,
    length: u32,
    checksum: u32,
    payload: Vec<u8>,
}

impl Msg {
    /// Build a message from an opcode and payload, computing the checksum.
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        let checksum = crc32fast::hash(&payload);
        Self {
            opcode,
            length: payload.len() as u32,
            checksum,
            payload,
        }
    }

    /// Parse a header popped off the receive buffer. The payload arrives
    /// later; until [`Msg::set_payload`] runs the message is incomplete.
    pub(crate) fn from_header(header: &[u8]) -> Result<Self> {
        if header.len() < HEADER_SIZE {
            return Err(LinkError::Protocol(format!(
                "incomplete header: expected {} bytes, got {}",
                HEADER_SIZE,
                header.len()
            )));
        }
        let opcode = header[0];
        let length = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
        let checksum = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);
        Ok(Self {
            opcode,
            length,
            checksum,
            payload: Vec::new(),
        })
    }

    /// Attach the payload bytes popped off the receive buffer.
    pub(crate) fn set_payload(&mut self, payload: Vec<u8>) {
        debug_assert_eq!(payload.len(), self.length as usize);
        self.payload = payload;
    }

    /// Verify the header checksum against the payload.
    ///
    /// Always true when the `nochecksum` feature is enabled.
    pub fn verify_checksum(&self) -> bool {
        if cfg!(feature = "nochecksum") {
            return true;
        }
        crc32fast::hash(&self.payload) == self.checksum
    }

    /// Serialize header + payload into a single byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.push(self.opcode);
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Payload length declared in the header.
    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// A typed message that knows its opcode and payload encoding.
///
/// Implement this for protocol message types and register them with
/// [`crate::MsgNetwork::reg_handler`]; the network decodes the payload
/// before invoking the handler.
pub trait Payload: Sized {
    /// Opcode this message type is bound to.
    const OPCODE: Opcode;

    /// Serialize the payload bytes (header excluded).
    fn encode_payload(&self) -> Vec<u8>;

    /// Parse the payload bytes.
    fn decode_payload(bytes: &[u8]) -> Result<Self>;

    /// Wrap into a wire [`Msg`].
    fn into_msg(self) -> Msg {
        Msg::new(Self::OPCODE, self.encode_payload())
    }
}
