//! VPN Manager
//!
//! Owns one forwarding engine per connection and publishes connection
//! state and traffic statistics to observers.
//!
//! # Usage
//!
//! ```rust,ignore
//! let vpn = VpnManager::new();
//! let mut state = vpn.subscribe_state();
//!
//! vpn.connect(&config, &provider, &protector).await?;
//! assert!(vpn.is_connected());
//!
//! // Later
//! vpn.disconnect().await?;
//! ```
//!
//! Setup runs in a fixed order: validate config, load key, build cipher,
//! resolve server, create protected socket, establish tunnel. Any failure
//! aborts the attempt and publishes a single `Failed` state.

use crate::config::{ConfigError, TunnelConfig};
use crate::crypto::{create_cipher, CryptoError};
use crate::engine::{EngineError, EngineHandle, ForwardingEngine};
use crate::keys::KeyError;
use crate::stats::{StatsCallback, VpnStats};
use crate::transport::{ProtectedUdpSocket, SocketProtector, TransportError};
use crate::tun::TunnelProvider;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// VPN connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VpnState {
    /// No connection
    Disconnected,
    /// Setup in progress
    Connecting,
    /// Engine is forwarding traffic
    Connected,
    /// Shutdown requested
    Disconnecting,
    /// Setup or forwarding failed
    Failed(String),
}

impl VpnState {
    /// Check if VPN is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, VpnState::Connected)
    }

    /// Check if VPN is in a failure state
    pub fn is_failed(&self) -> bool {
        matches!(self, VpnState::Failed(_))
    }

    /// Does a connection attempt or session still hold resources?
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            VpnState::Connecting | VpnState::Connected | VpnState::Disconnecting
        )
    }
}

/// VPN Manager errors
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    #[error("VPN already connected")]
    AlreadyConnected,

    #[error("VPN not connected")]
    NotConnected,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Cannot resolve server {0}")]
    Resolve(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to establish tunnel interface: {0}")]
    Tunnel(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Live session
struct Connection {
    handle: EngineHandle<ProtectedUdpSocket>,
    task: JoinHandle<()>,
    server: SocketAddr,
}

/// VPN Manager
///
/// - Runs the setup sequence for each connection
/// - Drives the forwarding engine on a background task
/// - Publishes state and stats through watch channels
pub struct VpnManager {
    state: Arc<watch::Sender<VpnState>>,
    stats: Arc<watch::Sender<VpnStats>>,
    connection: Mutex<Option<Connection>>,
}

impl VpnManager {
    pub fn new() -> Self {
        let (state, _) = watch::channel(VpnState::Disconnected);
        let (stats, _) = watch::channel(VpnStats::empty());
        Self {
            state: Arc::new(state),
            stats: Arc::new(stats),
            connection: Mutex::new(None),
        }
    }

    /// Get current state
    pub fn state(&self) -> VpnState {
        self.state.borrow().clone()
    }

    /// Check if VPN is connected
    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// Observe state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<VpnState> {
        self.state.subscribe()
    }

    /// Observe stats snapshots, published once per second while connected
    pub fn subscribe_stats(&self) -> watch::Receiver<VpnStats> {
        self.stats.subscribe()
    }

    /// Latest published stats
    pub fn stats(&self) -> VpnStats {
        *self.stats.borrow()
    }

    /// Control handle for the current engine
    pub async fn engine(&self) -> Option<EngineHandle<ProtectedUdpSocket>> {
        self.connection.lock().await.as_ref().map(|c| c.handle.clone())
    }

    /// Resolved server address of the current connection
    pub async fn server_addr(&self) -> Option<SocketAddr> {
        self.connection.lock().await.as_ref().map(|c| c.server)
    }

    /// Connect and start forwarding.
    ///
    /// Returns once the engine is running. The engine keeps going on a
    /// background task until `disconnect()`, a peer DISCONNECT, or a fatal
    /// I/O error.
    pub async fn connect<P>(
        &self,
        config: &TunnelConfig,
        provider: &P,
        protector: &dyn SocketProtector,
    ) -> Result<(), VpnError>
    where
        P: TunnelProvider,
    {
        let mut connection = self.connection.lock().await;
        if connection.is_some() && self.state.borrow().is_active() {
            return Err(VpnError::AlreadyConnected);
        }
        // Previous session already ended on its own
        *connection = None;

        info!("Connecting to VPN ({})", config.server);
        self.state.send_replace(VpnState::Connecting);

        let (engine, server) = match Self::setup(config, provider, protector).await {
            Ok(setup) => setup,
            Err(e) => {
                error!("VPN connection failed: {}", e);
                self.state.send_replace(VpnState::Failed(e.to_string()));
                return Err(e);
            }
        };

        let engine = Arc::new(engine);
        let handle = engine.handle();

        let stats_tx = self.stats.clone();
        let observer: StatsCallback = Arc::new(move |stats| {
            stats_tx.send_replace(stats);
        });

        self.stats.send_replace(handle.stats());
        self.state.send_replace(VpnState::Connected);
        info!("VPN connected to {} ({})", server, config.cipher);

        let state = self.state.clone();
        let task = tokio::spawn(async move {
            let next = match engine.run(Some(observer)).await {
                Ok(()) => VpnState::Disconnected,
                Err(e) => VpnState::Failed(e.to_string()),
            };
            info!("VPN session ended: {:?}", next);
            state.send_replace(next);
        });

        *connection = Some(Connection {
            handle,
            task,
            server,
        });
        Ok(())
    }

    /// Fatal-on-error setup. Everything built here is dropped (and the key
    /// zeroized) if a later step fails.
    async fn setup<P>(
        config: &TunnelConfig,
        provider: &P,
        protector: &dyn SocketProtector,
    ) -> Result<(ForwardingEngine<P::Reader, P::Writer, ProtectedUdpSocket>, SocketAddr), VpnError>
    where
        P: TunnelProvider,
    {
        config.validate()?;
        let settings = config.interface_settings()?;

        let key = config.load_key()?;
        let cipher = create_cipher(config.cipher, key.as_bytes())?;
        drop(key);

        let (host, port) = config.server_host_port()?;
        let server = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| VpnError::Resolve(format!("{}: {}", config.server, e)))?
            .next()
            .ok_or_else(|| VpnError::Resolve(config.server.clone()))?;
        debug!("Resolved {} to {}", config.server, server);

        let transport = ProtectedUdpSocket::connect(server, &config.socket_options(), protector)?;

        let (input, output) = provider
            .establish(&settings)
            .map_err(|e| VpnError::Tunnel(e.to_string()))?;
        debug!(
            "Tunnel interface '{}' up (mtu {}, {} routes)",
            settings.session_name,
            settings.mtu,
            settings.routes.len()
        );

        let engine = ForwardingEngine::new(input, output, transport, cipher, config.engine_options());
        // Running before the task exists, so an early disconnect still
        // reaches the peer
        engine.start()?;
        Ok((engine, server))
    }

    /// Stop the engine and wait for it to release its resources
    pub async fn disconnect(&self) -> Result<(), VpnError> {
        let connection = self
            .connection
            .lock()
            .await
            .take()
            .ok_or(VpnError::NotConnected)?;

        info!("Disconnecting VPN");
        self.state.send_if_modified(|state| {
            if state.is_connected() {
                *state = VpnState::Disconnecting;
                true
            } else {
                false
            }
        });

        connection.handle.stop().await;
        if let Err(e) = connection.task.await {
            warn!("Engine task ended abnormally: {}", e);
        }

        // The task normally publishes the final state itself
        self.state.send_if_modified(|state| {
            if *state == VpnState::Disconnecting {
                *state = VpnState::Disconnected;
                true
            } else {
                false
            }
        });

        info!("VPN disconnected");
        Ok(())
    }

    /// Format status for display
    pub fn status(&self) -> String {
        format!("VPN: {:?} | {}", self.state(), self.stats().format())
    }
}

impl Default for VpnManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VpnManager {
    fn drop(&mut self) {
        // Dropping the task drops the engine, which releases its resources
        if let Some(connection) = self.connection.get_mut().take() {
            connection.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressConfig;
    use crate::crypto::{Cipher, CipherSuite};
    use crate::engine::seal_frame;
    use crate::keys::PresharedKey;
    use crate::protocol::{PacketHeader, PacketType, HEADER_SIZE};
    use crate::transport::NoProtection;
    use crate::tun::{InterfaceSettings, TunInput, TunOutput};
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(3);

    type Device = (TunInput<ReadHalf<DuplexStream>>, TunOutput<WriteHalf<DuplexStream>>);

    /// Hands out one in-memory device and keeps the host end
    struct MemoryProvider {
        device: std::sync::Mutex<Option<DuplexStream>>,
        settings: std::sync::Mutex<Option<InterfaceSettings>>,
        fail: bool,
    }

    impl MemoryProvider {
        fn new() -> (Self, DuplexStream) {
            let (host, device) = tokio::io::duplex(64 * 1024);
            let provider = Self {
                device: std::sync::Mutex::new(Some(device)),
                settings: std::sync::Mutex::new(None),
                fail: false,
            };
            (provider, host)
        }

        fn failing() -> Self {
            Self {
                device: std::sync::Mutex::new(None),
                settings: std::sync::Mutex::new(None),
                fail: true,
            }
        }
    }

    impl TunnelProvider for MemoryProvider {
        type Reader = TunInput<ReadHalf<DuplexStream>>;
        type Writer = TunOutput<WriteHalf<DuplexStream>>;

        fn establish(&self, settings: &InterfaceSettings) -> io::Result<Device> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "user declined"));
            }
            *self.settings.lock().unwrap() = Some(settings.clone());
            let device = self
                .device
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::AlreadyExists, "device in use"))?;
            let (reader, writer) = tokio::io::split(device);
            Ok((TunInput::new(reader), TunOutput::new(writer)))
        }
    }

    /// Minimal server side: a UDP socket sharing the tunnel key
    struct Peer {
        socket: UdpSocket,
        cipher: Box<dyn Cipher>,
        client: Option<SocketAddr>,
        counter: u32,
    }

    impl Peer {
        async fn bind(key: &PresharedKey) -> Self {
            Self {
                socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
                cipher: create_cipher(CipherSuite::ChaCha20Poly1305, key.as_bytes()).unwrap(),
                client: None,
                counter: 0,
            }
        }

        fn addr(&self) -> SocketAddr {
            self.socket.local_addr().unwrap()
        }

        /// Receive and open the next frame, skipping keepalives
        async fn recv(&mut self) -> (PacketType, Vec<u8>) {
            let mut buf = vec![0u8; 65_535];
            loop {
                let (n, from) = timeout(WAIT, self.socket.recv_from(&mut buf))
                    .await
                    .expect("peer timed out")
                    .unwrap();
                self.client = Some(from);
                let header = PacketHeader::deserialize(&buf[..n]).unwrap();
                let plaintext = self
                    .cipher
                    .decrypt(&header.nonce, &buf[HEADER_SIZE..n], &buf[..HEADER_SIZE])
                    .unwrap();
                if header.packet_type != PacketType::Keepalive {
                    return (header.packet_type, plaintext);
                }
            }
        }

        async fn send(&mut self, packet_type: PacketType, plaintext: &[u8]) {
            self.counter += 1;
            let header = PacketHeader::new(packet_type, self.counter);
            let datagram = seal_frame(self.cipher.as_ref(), &header, plaintext).unwrap();
            let client = self.client.expect("client address unknown");
            self.socket.send_to(&datagram, client).await.unwrap();
        }
    }

    fn config(server: SocketAddr, key: &PresharedKey) -> TunnelConfig {
        let ipv4 = AddressConfig::new(IpAddr::V4(Ipv4Addr::new(10, 8, 0, 2)), 24)
            .with_route("0.0.0.0/0");
        TunnelConfig::new(server.to_string(), key, ipv4)
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<VpnState>,
        pred: impl FnMut(&VpnState) -> bool,
    ) -> VpnState {
        timeout(WAIT, rx.wait_for(pred))
            .await
            .expect("state timed out")
            .unwrap()
            .clone()
    }

    #[test]
    fn test_vpn_state() {
        assert!(VpnState::Connected.is_connected());
        assert!(!VpnState::Disconnected.is_connected());
        assert!(VpnState::Failed("x".into()).is_failed());
        assert!(VpnState::Disconnecting.is_active());
        assert!(!VpnState::Failed("x".into()).is_active());
    }

    #[tokio::test]
    async fn test_vpn_manager_creation() {
        let vpn = VpnManager::new();
        assert_eq!(vpn.state(), VpnState::Disconnected);
        assert!(vpn.engine().await.is_none());
        assert!(vpn.status().starts_with("VPN: Disconnected"));
    }

    #[tokio::test]
    async fn test_connect_forward_disconnect() {
        let key = PresharedKey::generate();
        let mut peer = Peer::bind(&key).await;
        let (provider, mut host) = MemoryProvider::new();
        let vpn = VpnManager::new();
        let mut states = vpn.subscribe_state();

        vpn.connect(&config(peer.addr(), &key), &provider, &NoProtection)
            .await
            .unwrap();
        assert!(vpn.is_connected());
        assert_eq!(vpn.server_addr().await, Some(peer.addr()));

        let settings = provider.settings.lock().unwrap().clone().unwrap();
        assert_eq!(settings.mtu, 1420);
        assert_eq!(settings.addresses[0].to_string(), "10.8.0.2/24");

        // Host → tunnel → peer
        host.write_all(b"\x45outbound-packet").await.unwrap();
        let (packet_type, payload) = peer.recv().await;
        assert_eq!(packet_type, PacketType::Data);
        assert_eq!(payload, b"\x45outbound-packet");

        // Peer → tunnel → host
        peer.send(PacketType::Data, b"\x45inbound-packet").await;
        let mut buf = [0u8; 64];
        let n = timeout(WAIT, host.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"\x45inbound-packet");

        let handle = vpn.engine().await.unwrap();
        assert!(handle.tx_counter() >= 1);
        assert_eq!(handle.replay_high_water(), 1);

        vpn.disconnect().await.unwrap();
        let (packet_type, payload) = peer.recv().await;
        assert_eq!(packet_type, PacketType::Disconnect);
        assert!(payload.is_empty());

        assert_eq!(vpn.state(), VpnState::Disconnected);
        assert_eq!(wait_for_state(&mut states, |s| *s == VpnState::Disconnected).await, VpnState::Disconnected);
        assert!(!handle.is_running());
        assert!(matches!(vpn.disconnect().await, Err(VpnError::NotConnected)));
    }

    #[tokio::test]
    async fn test_disconnect_right_after_connect() {
        let key = PresharedKey::generate();
        let mut peer = Peer::bind(&key).await;
        let (provider, _host) = MemoryProvider::new();
        let vpn = VpnManager::new();

        vpn.connect(&config(peer.addr(), &key), &provider, &NoProtection)
            .await
            .unwrap();
        vpn.disconnect().await.unwrap();

        let (packet_type, payload) = peer.recv().await;
        assert_eq!(packet_type, PacketType::Disconnect);
        assert!(payload.is_empty());
        assert_eq!(vpn.state(), VpnState::Disconnected);
    }

    #[tokio::test]
    async fn test_peer_disconnect_ends_session() {
        let key = PresharedKey::generate();
        let mut peer = Peer::bind(&key).await;
        let (provider, mut host) = MemoryProvider::new();
        let vpn = VpnManager::new();
        let mut states = vpn.subscribe_state();

        vpn.connect(&config(peer.addr(), &key), &provider, &NoProtection)
            .await
            .unwrap();

        // Let the peer learn the client address
        host.write_all(b"\x45hello").await.unwrap();
        peer.recv().await;

        peer.send(PacketType::Disconnect, &[]).await;
        wait_for_state(&mut states, |s| *s == VpnState::Disconnected).await;

        // A new session may start once the old one ended
        let (provider, _host) = MemoryProvider::new();
        vpn.connect(&config(peer.addr(), &key), &provider, &NoProtection)
            .await
            .unwrap();
        vpn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_already_connected() {
        let key = PresharedKey::generate();
        let peer = Peer::bind(&key).await;
        let (provider, _host) = MemoryProvider::new();
        let vpn = VpnManager::new();

        vpn.connect(&config(peer.addr(), &key), &provider, &NoProtection)
            .await
            .unwrap();
        let again = vpn.connect(&config(peer.addr(), &key), &provider, &NoProtection).await;
        assert!(matches!(again, Err(VpnError::AlreadyConnected)));
        assert!(vpn.is_connected());

        vpn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_fails_once() {
        let key = PresharedKey::generate();
        let (provider, _host) = MemoryProvider::new();
        let vpn = VpnManager::new();
        let mut states = vpn.subscribe_state();

        let mut config = config("127.0.0.1:9".parse().unwrap(), &key);
        config.mtu = 100;

        let result = vpn.connect(&config, &provider, &NoProtection).await;
        assert!(matches!(result, Err(VpnError::Config(ConfigError::InvalidMtu(100)))));

        let state = wait_for_state(&mut states, |s| s.is_failed()).await;
        assert!(matches!(state, VpnState::Failed(ref msg) if msg.contains("MTU")));
        assert!(provider.settings.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_protect_failure_is_fatal() {
        let key = PresharedKey::generate();
        let (provider, _host) = MemoryProvider::new();
        let vpn = VpnManager::new();

        let protector = |_: &socket2::Socket| -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "no"))
        };
        let result = vpn
            .connect(&config("127.0.0.1:9".parse().unwrap(), &key), &provider, &protector)
            .await;

        assert!(matches!(result, Err(VpnError::Transport(TransportError::ProtectFailed(_)))));
        assert!(vpn.state().is_failed());
        assert!(provider.settings.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tunnel_establish_failure() {
        let key = PresharedKey::generate();
        let vpn = VpnManager::new();

        let result = vpn
            .connect(&config("127.0.0.1:9".parse().unwrap(), &key), &MemoryProvider::failing(), &NoProtection)
            .await;

        assert!(matches!(result, Err(VpnError::Tunnel(_))));
        assert!(matches!(vpn.state(), VpnState::Failed(ref msg) if msg.contains("user declined")));
        assert!(vpn.engine().await.is_none());
    }

    #[tokio::test]
    async fn test_stats_published() {
        let key = PresharedKey::generate();
        let mut peer = Peer::bind(&key).await;
        let (provider, mut host) = MemoryProvider::new();
        let vpn = VpnManager::new();
        let mut stats = vpn.subscribe_stats();

        vpn.connect(&config(peer.addr(), &key), &provider, &NoProtection)
            .await
            .unwrap();
        host.write_all(b"\x45counted").await.unwrap();
        peer.recv().await;

        let snapshot = *timeout(WAIT, stats.wait_for(|s| s.packets_sent >= 1))
            .await
            .unwrap()
            .unwrap();
        assert!(snapshot.bytes_sent >= (HEADER_SIZE + 8 + 16) as u64);

        vpn.disconnect().await.unwrap();
        assert!(vpn.stats().packets_sent >= 2);
    }
}
