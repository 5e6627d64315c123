//! Transport Socket
//!
//! A connected UDP endpoint bound to one peer for the lifetime of the
//! connection. The socket is handed to the host's [`SocketProtector`]
//! before it connects, so its traffic bypasses the tunnel it carries.
//!
//! Receives poll with a short timeout instead of blocking forever, so the
//! owning loop can notice cancellation.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Default kernel buffer size in each direction
pub const DEFAULT_SOCKET_BUFFER: usize = 2 * 1024 * 1024;

/// Default receive poll timeout
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Datagram transport used by the forwarding engine
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram to the peer
    fn send(&self, datagram: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Receive one datagram. `Ok(None)` means the poll timed out.
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<Option<usize>>> + Send;

    /// Close the endpoint. Later sends and receives fail.
    fn close(&self) -> io::Result<()>;
}

/// Host capability that exempts a socket from the tunnel's own routing
pub trait SocketProtector: Send + Sync {
    fn protect(&self, socket: &Socket) -> io::Result<()>;
}

impl<F> SocketProtector for F
where
    F: Fn(&Socket) -> io::Result<()> + Send + Sync,
{
    fn protect(&self, socket: &Socket) -> io::Result<()> {
        self(socket)
    }
}

/// Protector for hosts where the socket cannot loop through the tunnel
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProtection;

impl SocketProtector for NoProtection {
    fn protect(&self, _socket: &Socket) -> io::Result<()> {
        Ok(())
    }
}

/// Socket tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    /// SO_SNDBUF request
    pub send_buffer: usize,
    /// SO_RCVBUF request
    pub recv_buffer: usize,
    /// Receive poll timeout
    pub recv_timeout: Duration,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            send_buffer: DEFAULT_SOCKET_BUFFER,
            recv_buffer: DEFAULT_SOCKET_BUFFER,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        }
    }
}

/// Connected, protected UDP socket
pub struct ProtectedUdpSocket {
    socket: RwLock<Option<Arc<UdpSocket>>>,
    peer: SocketAddr,
    local: SocketAddr,
    recv_timeout: Duration,
}

impl ProtectedUdpSocket {
    /// Create, protect and connect a socket to `peer`.
    ///
    /// Must be called from within a tokio runtime. A protect failure is
    /// fatal and is not retried.
    pub fn connect(
        peer: SocketAddr,
        options: &SocketOptions,
        protector: &dyn SocketProtector,
    ) -> Result<Self, TransportError> {
        let socket = Socket::new(Domain::for_address(peer), Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| TransportError::Socket(e.to_string()))?;

        if let Err(e) = socket.set_send_buffer_size(options.send_buffer) {
            warn!("Failed to set send buffer to {} bytes: {}", options.send_buffer, e);
        }
        if let Err(e) = socket.set_recv_buffer_size(options.recv_buffer) {
            warn!("Failed to set receive buffer to {} bytes: {}", options.recv_buffer, e);
        }

        protector
            .protect(&socket)
            .map_err(|e| TransportError::ProtectFailed(e.to_string()))?;

        let unspecified = match peer.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        socket
            .bind(&SockAddr::from(SocketAddr::new(unspecified, 0)))
            .map_err(|e| TransportError::Socket(e.to_string()))?;
        socket
            .connect(&SockAddr::from(peer))
            .map_err(|e| TransportError::Socket(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::Socket(e.to_string()))?;

        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| TransportError::Socket(e.to_string()))?;
        let local = socket
            .local_addr()
            .map_err(|e| TransportError::Socket(e.to_string()))?;

        info!("Transport socket {} connected to {}", local, peer);

        Ok(Self {
            socket: RwLock::new(Some(Arc::new(socket))),
            peer,
            local,
            recv_timeout: options.recv_timeout,
        })
    }

    /// Remote peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Local bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn current(&self) -> io::Result<Arc<UdpSocket>> {
        self.socket
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport socket closed"))
    }
}

impl Transport for ProtectedUdpSocket {
    async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        let socket = self.current()?;
        socket.send(datagram).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let socket = self.current()?;
        match tokio::time::timeout(self.recv_timeout, socket.recv(buf)).await {
            Ok(Ok(n)) => Ok(Some(n)),
            // ICMP port unreachable from a peer that is restarting
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                debug!("Peer {} refused datagram: {}", self.peer, e);
                Ok(None)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    fn close(&self) -> io::Result<()> {
        let previous = self
            .socket
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if previous.is_some() {
            debug!("Transport socket to {} closed", self.peer);
        }
        Ok(())
    }
}

/// Transport setup errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Failed to protect socket: {0}")]
    ProtectFailed(String),
}
