//! Wire Format
//!
//! Every UDP datagram exchanged with the peer is a fixed 24-byte header
//! followed by the payload.
//!
//! ```text
//! ┌─────────┬────────┬──────────────┬──────────────────────┬────────────┐
//! │ Version │  Type  │ Counter (LE) │        Nonce         │  Reserved  │
//! │   (1)   │  (1)   │     (4)      │        (12)          │    (6)     │
//! └─────────┴────────┴──────────────┴──────────────────────┴────────────┘
//! │ Payload: ciphertext ‖ 16-byte tag                                   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The serialized header is never encrypted. It is the associated data of
//! the AEAD operation on its own packet.

use rand::rngs::OsRng;
use rand::RngCore;

/// Protocol version carried in every header
pub const PROTOCOL_VERSION: u8 = 3;

/// Serialized header size in bytes
pub const HEADER_SIZE: usize = 24;

/// AEAD nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// Reserved trailer of the header
pub const RESERVED_SIZE: usize = 6;

const COUNTER_OFFSET: usize = 2;
const NONCE_OFFSET: usize = COUNTER_OFFSET + 4;
const RESERVED_OFFSET: usize = NONCE_OFFSET + NONCE_SIZE;

const _: () = assert!(RESERVED_OFFSET + RESERVED_SIZE == HEADER_SIZE);

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Reserved for a future handshake; not produced by this client
    HandshakeInit = 1,
    /// Reserved for a future handshake; logged on receipt
    HandshakeResponse = 2,
    /// Encrypted IP packet
    Data = 3,
    /// Liveness / NAT binding refresh
    Keepalive = 4,
    /// Peer is closing the session
    Disconnect = 5,
}

impl PacketType {
    /// Map a wire byte to a packet type
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(PacketType::HandshakeInit),
            2 => Ok(PacketType::HandshakeResponse),
            3 => Ok(PacketType::Data),
            4 => Ok(PacketType::Keepalive),
            5 => Ok(PacketType::Disconnect),
            other => Err(ProtocolError::InvalidPacketType(other)),
        }
    }

    /// Is this a control frame with an empty plaintext?
    pub fn is_control(&self) -> bool {
        matches!(self, PacketType::Keepalive | PacketType::Disconnect)
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PacketType::HandshakeInit => "HANDSHAKE_INIT",
            PacketType::HandshakeResponse => "HANDSHAKE_RESPONSE",
            PacketType::Data => "DATA",
            PacketType::Keepalive => "KEEPALIVE",
            PacketType::Disconnect => "DISCONNECT",
        };
        f.write_str(name)
    }
}

/// Build a fresh nonce for `counter`.
///
/// The first 4 bytes repeat the little-endian counter, the last 8 come
/// from the OS CSPRNG on every call.
pub fn generate_nonce(counter: u32) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..4].copy_from_slice(&counter.to_le_bytes());
    OsRng.fill_bytes(&mut nonce[4..]);
    nonce
}

/// Packet header (24 bytes on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Protocol version
    pub version: u8,
    /// Frame type
    pub packet_type: PacketType,
    /// Per-connection send counter
    pub counter: u32,
    /// AEAD nonce; prefix equals `counter`
    pub nonce: [u8; NONCE_SIZE],
}

impl PacketHeader {
    /// Create a header for `counter` with a freshly generated nonce
    pub fn new(packet_type: PacketType, counter: u32) -> Self {
        Self::with_nonce(packet_type, counter, generate_nonce(counter))
    }

    /// Create a header with a caller-supplied nonce
    pub fn with_nonce(packet_type: PacketType, counter: u32, nonce: [u8; NONCE_SIZE]) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            counter,
            nonce,
        }
    }

    /// Serialize to the fixed wire layout; reserved bytes are zero
    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.packet_type as u8;
        buf[COUNTER_OFFSET..NONCE_OFFSET].copy_from_slice(&self.counter.to_le_bytes());
        buf[NONCE_OFFSET..RESERVED_OFFSET].copy_from_slice(&self.nonce);
        buf[RESERVED_OFFSET..RESERVED_OFFSET + RESERVED_SIZE].fill(0);
        buf
    }

    /// Parse a header from the start of `buf`.
    ///
    /// Reserved bytes are required but not inspected.
    pub fn deserialize(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::PacketTooSmall {
                min: HEADER_SIZE,
                got: buf.len(),
            });
        }

        let version = buf[0];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        let packet_type = PacketType::from_u8(buf[1])?;
        let mut counter = [0u8; 4];
        counter.copy_from_slice(&buf[COUNTER_OFFSET..NONCE_OFFSET]);
        let counter = u32::from_le_bytes(counter);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&buf[NONCE_OFFSET..RESERVED_OFFSET]);

        Ok(Self {
            version,
            packet_type,
            counter,
            nonce,
        })
    }

    /// Does the nonce prefix carry the same counter as the header?
    pub fn nonce_matches_counter(&self) -> bool {
        self.nonce[..4] == self.counter.to_le_bytes()
    }
}

/// Header plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// Concatenate header and payload
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        buf.extend_from_slice(&self.header.serialize());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Split a datagram into header and payload
    pub fn deserialize(buf: &[u8]) -> Result<Self, ProtocolError> {
        let header = PacketHeader::deserialize(buf)?;
        Ok(Self {
            header,
            payload: buf[HEADER_SIZE..].to_vec(),
        })
    }

    /// Total wire size
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Header parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Packet too small: need {min} bytes, got {got}")]
    PacketTooSmall { min: usize, got: usize },

    #[error("Protocol version mismatch: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("Unknown packet type: {0}")]
    InvalidPacketType(u8),
}
