//! Traffic statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Observer invoked with each published snapshot
pub type StatsCallback = Arc<dyn Fn(VpnStats) + Send + Sync>;

/// Immutable snapshot of the traffic counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VpnStats {
    /// Bytes received from the peer
    pub bytes_received: u64,
    /// Bytes sent to the peer
    pub bytes_sent: u64,
    /// Packets received from the peer
    pub packets_received: u64,
    /// Packets sent to the peer
    pub packets_sent: u64,
    /// When the engine started forwarding
    pub connected_at: Instant,
}

impl VpnStats {
    /// Empty snapshot starting now
    pub fn empty() -> Self {
        Self {
            bytes_received: 0,
            bytes_sent: 0,
            packets_received: 0,
            packets_sent: 0,
            connected_at: Instant::now(),
        }
    }

    /// Time since the connection came up
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "TX: {:.2}MB ({} pkts), RX: {:.2}MB ({} pkts), Up: {}s",
            self.bytes_sent as f64 / (1024.0 * 1024.0),
            self.packets_sent,
            self.bytes_received as f64 / (1024.0 * 1024.0),
            self.packets_received,
            self.duration().as_secs()
        )
    }
}

/// Live counters shared by the forwarding loops
#[derive(Debug)]
pub struct TrafficCounters {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    connected_at: Instant,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(connected_at: Instant) -> Self {
        Self {
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            connected_at,
        }
    }

    /// Count one datagram sent
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one datagram received
    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> VpnStats {
        VpnStats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            connected_at: self.connected_at,
        }
    }
}

impl Default for TrafficCounters {
    fn default() -> Self {
        Self::new()
    }
}
