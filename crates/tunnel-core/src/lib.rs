//! tunnel-core - Packet Tunneling Engine for a Personal VPN Client
//!
//! Moves IP packets between a virtual network interface and a UDP
//! socket, sealing each one with an AEAD cipher under a pre-shared key.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Client Process                       │
//! │                                                           │
//! │  ┌────────────┐     ┌───────────────────┐                 │
//! │  │   Tunnel   │────▶│ Forwarding Engine │                 │
//! │  │ Interface  │◀────│ egress / ingress  │                 │
//! │  └────────────┘     │ keepalive / stats │                 │
//! │                     └─────────┬─────────┘                 │
//! │                               │ AEAD + replay window      │
//! │                     ┌─────────▼─────────┐                 │
//! │                     │  Protected UDP    │                 │
//! │                     │     Socket        │                 │
//! │                     └─────────┬─────────┘                 │
//! └───────────────────────────────│───────────────────────────┘
//!                                 │
//!                                 ▼ UDP
//!                       ┌───────────────────┐
//!                       │    VPN Server     │
//!                       │ (same shared key) │
//!                       └───────────────────┘
//! ```
//!
//! # Wire Format
//!
//! Every datagram is a 24-byte header followed by `ciphertext ‖ tag`. The
//! header (version, type, counter, nonce) is the AEAD associated data, so
//! it is authenticated but not encrypted.
//!
//! # Security
//!
//! - ChaCha20-Poly1305 (default) or AES-256-GCM
//! - 64-entry sliding replay window, updated only after authentication
//! - Key material zeroized when the connection is torn down
//! - Transport socket bypasses the tunnel via a host-supplied protector

mod config;
mod crypto;
mod engine;
mod keys;
mod manager;
mod protocol;
mod replay;
mod stats;
mod transport;
mod tun;

pub use config::{AddressConfig, ConfigError, ConfigFormat, TunnelConfig};
pub use crypto::{
    create_cipher, Aes256GcmCipher, ChaCha20Poly1305Cipher, Cipher, CipherSuite, CryptoError,
    KEY_SIZE, TAG_SIZE,
};
pub use engine::{
    seal_frame, DropReason, EngineError, EngineHandle, EngineOptions, EngineState,
    ForwardingEngine,
};
pub use keys::{KeyError, PresharedKey};
pub use manager::{VpnError, VpnManager, VpnState};
pub use protocol::{
    generate_nonce, Packet, PacketHeader, PacketType, ProtocolError, HEADER_SIZE, NONCE_SIZE,
    PROTOCOL_VERSION,
};
pub use replay::{Rejection, ReplayWindow, WINDOW_SIZE};
pub use stats::{StatsCallback, TrafficCounters, VpnStats};
pub use transport::{
    NoProtection, ProtectedUdpSocket, SocketOptions, SocketProtector, Transport, TransportError,
};
pub use tun::{
    split_device, Cidr, InterfaceSettings, TunInput, TunOutput, TunnelProvider, TunnelReader,
    TunnelWriter,
};
