//! Tunnel Configuration
//!
//! Connection settings for one tunnel. Loaded from TOML or JSON, validated
//! up front, then converted into the pieces each component needs: the key,
//! socket options, engine options and [`InterfaceSettings`].
//!
//! ```toml
//! server = "vpn.example.com:51820"
//! cipher = "chacha20-poly1305"
//! key_file = "/etc/tunnel/psk"
//! dns = ["10.8.0.1"]
//!
//! [ipv4]
//! address = "10.8.0.2"
//! prefix = 24
//! routes = ["0.0.0.0/0"]
//! ```

use crate::crypto::CipherSuite;
use crate::engine::EngineOptions;
use crate::keys::{KeyError, PresharedKey};
use crate::transport::{SocketOptions, DEFAULT_RECV_TIMEOUT, DEFAULT_SOCKET_BUFFER};
use crate::tun::{Cidr, InterfaceSettings};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Accepted MTU range
pub const MTU_RANGE: RangeInclusive<u16> = 576..=9000;

/// Interval between stats snapshots
const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Tunnel address for one address family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressConfig {
    /// Address assigned to the tunnel interface
    pub address: IpAddr,
    /// Prefix length of the tunnel subnet
    pub prefix: u8,
    /// Routes sent through the tunnel (CIDR notation)
    #[serde(default)]
    pub routes: Vec<String>,
}

impl AddressConfig {
    pub fn new(address: IpAddr, prefix: u8) -> Self {
        Self {
            address,
            prefix,
            routes: Vec::new(),
        }
    }

    /// Add a route
    pub fn with_route(mut self, route: &str) -> Self {
        self.routes.push(route.to_string());
        self
    }

    fn validate(&self, ipv6: bool) -> Result<(), ConfigError> {
        let family = if ipv6 { "IPv6" } else { "IPv4" };
        if self.address.is_ipv6() != ipv6 {
            return Err(ConfigError::InvalidAddress(format!(
                "{} is not an {} address",
                self.address, family
            )));
        }
        let max = if ipv6 { 128 } else { 32 };
        if self.prefix > max {
            return Err(ConfigError::InvalidAddress(format!(
                "{} prefix /{} exceeds /{}",
                family, self.prefix, max
            )));
        }
        for route in self.parse_routes()? {
            if route.addr.is_ipv6() != ipv6 {
                return Err(ConfigError::InvalidRoute(format!("{} in {} routes", route, family)));
            }
        }
        Ok(())
    }

    fn cidr(&self) -> Result<Cidr, ConfigError> {
        Cidr::new(self.address, self.prefix).ok_or_else(|| {
            ConfigError::InvalidAddress(format!("{}/{}", self.address, self.prefix))
        })
    }

    fn parse_routes(&self) -> Result<Vec<Cidr>, ConfigError> {
        self.routes
            .iter()
            .map(|route| route.parse::<Cidr>().map_err(ConfigError::InvalidRoute))
            .collect()
    }
}

/// Complete tunnel configuration
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Server endpoint as `host:port`
    pub server: String,
    /// AEAD suite shared with the server
    #[serde(default)]
    pub cipher: CipherSuite,
    /// Pre-shared key (base64). Takes precedence over `key_file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// File holding the pre-shared key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    /// Tunnel MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Transmit queue length hint for the interface
    #[serde(default = "default_queue_len")]
    pub queue_len: u32,
    /// DNS servers pushed to the interface
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    /// Seconds between keepalives
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Socket send buffer (bytes)
    #[serde(default = "default_buffer")]
    pub send_buffer: usize,
    /// Socket receive buffer (bytes)
    #[serde(default = "default_buffer")]
    pub recv_buffer: usize,
    /// Label the host shows for the session
    #[serde(default = "default_session_name")]
    pub session_name: String,
    pub ipv4: AddressConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<AddressConfig>,
}

fn default_mtu() -> u16 {
    1420
}

fn default_queue_len() -> u32 {
    500
}

fn default_keepalive_secs() -> u64 {
    25
}

fn default_buffer() -> usize {
    DEFAULT_SOCKET_BUFFER
}

fn default_session_name() -> String {
    "tunnel".to_string()
}

impl TunnelConfig {
    /// Configuration with defaults for everything but the server, key and
    /// IPv4 address
    pub fn new(server: impl Into<String>, key: &PresharedKey, ipv4: AddressConfig) -> Self {
        Self {
            server: server.into(),
            cipher: CipherSuite::default(),
            key: Some(key.to_base64()),
            key_file: None,
            mtu: default_mtu(),
            queue_len: default_queue_len(),
            dns: Vec::new(),
            keepalive_secs: default_keepalive_secs(),
            send_buffer: default_buffer(),
            recv_buffer: default_buffer(),
            session_name: default_session_name(),
            ipv4,
            ipv6: None,
        }
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a file, picking the format from its extension
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let format = ConfigFormat::from_path(path)?;
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        match format {
            ConfigFormat::Toml => Self::from_toml(&content),
            ConfigFormat::Json => Self::from_json(&content),
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check every field. Called before any resource is created.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server_host_port()?;

        if !MTU_RANGE.contains(&self.mtu) {
            return Err(ConfigError::InvalidMtu(self.mtu));
        }
        if self.key.is_none() && self.key_file.is_none() {
            return Err(ConfigError::MissingKey);
        }
        if self.keepalive_secs == 0 {
            return Err(ConfigError::InvalidKeepalive);
        }
        if self.send_buffer == 0 || self.recv_buffer == 0 {
            return Err(ConfigError::InvalidBuffer);
        }

        self.ipv4.validate(false)?;
        if let Some(ipv6) = &self.ipv6 {
            ipv6.validate(true)?;
        }
        Ok(())
    }

    /// Split `server` into host and port
    pub fn server_host_port(&self) -> Result<(&str, u16), ConfigError> {
        let invalid = || ConfigError::InvalidServer(self.server.clone());

        let (host, port) = self.server.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid());
        }

        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        Ok((host, port))
    }

    /// Load the pre-shared key from `key` or `key_file`
    pub fn load_key(&self) -> Result<PresharedKey, ConfigError> {
        match (&self.key, &self.key_file) {
            (Some(key), _) => Ok(PresharedKey::from_base64(key)?),
            (None, Some(path)) => Ok(PresharedKey::from_file(path)?),
            (None, None) => Err(ConfigError::MissingKey),
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            send_buffer: self.send_buffer,
            recv_buffer: self.recv_buffer,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            keepalive_interval: self.keepalive_interval(),
            stats_interval: STATS_INTERVAL,
            mtu: self.mtu,
        }
    }

    /// Settings handed to the host's [`TunnelProvider`](crate::tun::TunnelProvider)
    pub fn interface_settings(&self) -> Result<InterfaceSettings, ConfigError> {
        let mut addresses = vec![self.ipv4.cidr()?];
        let mut routes = self.ipv4.parse_routes()?;
        if let Some(ipv6) = &self.ipv6 {
            addresses.push(ipv6.cidr()?);
            routes.extend(ipv6.parse_routes()?);
        }

        Ok(InterfaceSettings {
            session_name: self.session_name.clone(),
            mtu: self.mtu,
            queue_len: self.queue_len,
            addresses,
            routes,
            dns: self.dns.clone(),
        })
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("server", &self.server)
            .field("cipher", &self.cipher)
            .field("key", &self.key.as_ref().map(|_| "[redacted]"))
            .field("key_file", &self.key_file)
            .field("mtu", &self.mtu)
            .field("queue_len", &self.queue_len)
            .field("dns", &self.dns)
            .field("keepalive_secs", &self.keepalive_secs)
            .field("send_buffer", &self.send_buffer)
            .field("recv_buffer", &self.recv_buffer)
            .field("session_name", &self.session_name)
            .field("ipv4", &self.ipv4)
            .field("ipv6", &self.ipv6)
            .finish()
    }
}

/// Configuration file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Detect from file extension
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(ConfigFormat::Toml),
            Some("json") => Ok(ConfigFormat::Json),
            _ => Err(ConfigError::UnsupportedFormat),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address '{0}' (expected host:port)")]
    InvalidServer(String),

    #[error("Server port must not be 0")]
    InvalidPort,

    #[error("MTU {0} outside 576..=9000")]
    InvalidMtu(u16),

    #[error("No pre-shared key configured")]
    MissingKey,

    #[error("Keepalive interval must be at least 1 second")]
    InvalidKeepalive,

    #[error("Socket buffer sizes must be non-zero")]
    InvalidBuffer,

    #[error("Invalid tunnel address: {0}")]
    InvalidAddress(String),

    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format")]
    UnsupportedFormat,
}
