//! Tunnel Interface
//!
//! The virtual network device as two independent halves: a reader that
//! yields raw IP packets leaving the host, and a writer that injects
//! decrypted packets back into it. A read of 0 bytes means the device was
//! torn down externally.
//!
//! Provisioning the device (addresses, routes, DNS) belongs to the host.
//! The core hands it a plain [`InterfaceSettings`] through
//! [`TunnelProvider::establish`].

use std::fmt;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Extra read-buffer room beyond the MTU for headers the OS may add
pub const READ_SLACK: usize = 100;

/// Read buffer size for a device with the given MTU
pub fn read_buffer_size(mtu: u16) -> usize {
    mtu as usize + READ_SLACK
}

/// Packets leaving the host
pub trait TunnelReader: Send + 'static {
    /// Read one packet. `Ok(0)` signals end of stream.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    fn close(&mut self) -> io::Result<()>;
}

/// Packets entering the host
pub trait TunnelWriter: Send + 'static {
    /// Write one whole packet
    fn write(&mut self, packet: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    fn close(&mut self) -> io::Result<()>;
}

/// Reader half over any async byte stream that preserves packet boundaries
pub struct TunInput<R> {
    inner: Option<R>,
}

impl<R> TunInput<R> {
    pub fn new(inner: R) -> Self {
        Self { inner: Some(inner) }
    }
}

impl<R> TunnelReader for TunInput<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.as_mut() {
            Some(inner) => inner.read(buf).await,
            None => Ok(0),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if self.inner.take().is_some() {
            debug!("Tunnel input closed");
        }
        Ok(())
    }
}

/// Writer half over any async byte sink
pub struct TunOutput<W> {
    inner: Option<W>,
}

impl<W> TunOutput<W> {
    pub fn new(inner: W) -> Self {
        Self { inner: Some(inner) }
    }
}

impl<W> TunnelWriter for TunOutput<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write(&mut self, packet: &[u8]) -> io::Result<()> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "tunnel output closed"))?;
        inner.write_all(packet).await?;
        inner.flush().await
    }

    fn close(&mut self) -> io::Result<()> {
        if self.inner.take().is_some() {
            debug!("Tunnel output closed");
        }
        Ok(())
    }
}

/// Split a device file descriptor into independent input and output halves
pub fn split_device(
    device: std::fs::File,
) -> io::Result<(TunInput<tokio::fs::File>, TunOutput<tokio::fs::File>)> {
    let output = device.try_clone()?;
    Ok((
        TunInput::new(tokio::fs::File::from_std(device)),
        TunOutput::new(tokio::fs::File::from_std(output)),
    ))
}

/// Address with prefix length, e.g. `10.8.0.2/24`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl Cidr {
    /// Create, checking the prefix against the address family
    pub fn new(addr: IpAddr, prefix: u8) -> Option<Self> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        (prefix <= max).then_some(Self { addr, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl std::str::FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("missing prefix length in '{}'", s))?;
        let addr: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| format!("invalid address in '{}'", s))?;
        let prefix: u8 = prefix
            .trim()
            .parse()
            .map_err(|_| format!("invalid prefix length in '{}'", s))?;
        Self::new(addr, prefix).ok_or_else(|| format!("prefix length out of range in '{}'", s))
    }
}

/// Everything the host needs to bring the device up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSettings {
    /// Label shown by the host for this session
    pub session_name: String,
    pub mtu: u16,
    /// Transmit queue length hint
    pub queue_len: u32,
    pub addresses: Vec<Cidr>,
    pub routes: Vec<Cidr>,
    pub dns: Vec<IpAddr>,
}

impl InterfaceSettings {
    /// Read buffer size the engine uses for this device
    pub fn read_buffer_size(&self) -> usize {
        read_buffer_size(self.mtu)
    }
}

/// Host hook that turns settings into a ready device
pub trait TunnelProvider: Send + Sync {
    type Reader: TunnelReader;
    type Writer: TunnelWriter;

    fn establish(&self, settings: &InterfaceSettings) -> io::Result<(Self::Reader, Self::Writer)>;
}
