//! Forwarding Engine
//!
//! Moves packets between the tunnel interface and the transport socket.
//!
//! # Loops
//!
//! ```text
//!            ┌──────────── egress ────────────┐
//!   tunnel ──┤ read → frame → encrypt → send  ├──▶ socket
//!            └────────────────────────────────┘
//!            ┌──────────── ingress ───────────┐
//!   tunnel ◀─┤ write ← decrypt ← replay ← parse├── socket
//!            └────────────────────────────────┘
//!   keepalive: every N seconds send an empty KEEPALIVE frame
//!   stats:     every second publish a VpnStats snapshot
//! ```
//!
//! All four loops run as separate tokio tasks and share one atomic
//! running flag. [`ForwardingEngine::run`] returns once every loop has
//! exited, then releases all resources. An engine is used for exactly one
//! connection and never restarted.

use crate::crypto::{Cipher, CryptoError};
use crate::protocol::{Packet, PacketHeader, PacketType, ProtocolError, HEADER_SIZE};
use crate::replay::{Rejection, ReplayWindow};
use crate::stats::{StatsCallback, TrafficCounters, VpnStats};
use crate::transport::Transport;
use crate::tun::{read_buffer_size, TunnelReader, TunnelWriter};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Largest datagram the ingress loop accepts
pub const MAX_DATAGRAM: usize = 65_535;

/// Upper bound on the best-effort DISCONNECT send in `stop()`
const DISCONNECT_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, not yet running
    Idle,
    /// Loops are forwarding traffic
    Running,
    /// Shutdown requested, loops draining
    Stopping,
    /// All loops exited
    Stopped,
}

/// Engine tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Interval between KEEPALIVE frames
    pub keepalive_interval: Duration,
    /// Interval between stats snapshots
    pub stats_interval: Duration,
    /// Tunnel MTU, sizes the read buffer
    pub mtu: u16,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(25),
            stats_interval: Duration::from_secs(1),
            mtu: 1420,
        }
    }
}

/// Reasons an inbound datagram is dropped
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DropReason {
    #[error("malformed header: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("nonce prefix does not match counter {counter}")]
    NonceMismatch { counter: u32 },

    #[error("replay window rejected counter {counter} ({reason:?})")]
    Replay { counter: u32, reason: Rejection },

    #[error("authentication failed for counter {counter}")]
    Unauthenticated { counter: u32 },

    #[error("control frame {counter} carries a payload")]
    ControlPayload { counter: u32 },
}

/// Authenticated inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
enum Inbound {
    Data(Vec<u8>),
    Keepalive,
    Disconnect,
    HandshakeInit,
    HandshakeResponse,
}

/// Engine errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Engine cannot start from state {0:?}")]
    AlreadyStarted(EngineState),

    #[error("Tunnel interface already released")]
    TunnelReleased,

    #[error("Tunnel read failed: {0}")]
    TunnelRead(String),

    #[error("Transport receive failed: {0}")]
    TransportRecv(String),

    #[error("Transport send failed: {0}")]
    Send(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Forwarding task failed: {0}")]
    TaskFailed(String),
}

/// Encrypt `plaintext` under `header` and return the full datagram.
///
/// The serialized header is the associated data.
pub fn seal_frame(
    cipher: &dyn Cipher,
    header: &PacketHeader,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let ciphertext = cipher.encrypt(&header.nonce, plaintext, &header.serialize())?;
    Ok(Packet::new(*header, ciphertext).serialize())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolves once shutdown has been signalled
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // The sender lives in `Core`, so the channel outlives every loop
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// State shared by the loops and every handle
struct Core<T> {
    transport: T,
    cipher: Box<dyn Cipher>,
    running: AtomicBool,
    state: Mutex<EngineState>,
    shutdown: watch::Sender<bool>,
    tx_counter: AtomicU32,
    counters: TrafficCounters,
    replay: ReplayWindow,
    options: EngineOptions,
    released: AtomicBool,
}

impl<T: Transport> Core<T> {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn state(&self) -> EngineState {
        *lock(&self.state)
    }

    /// Next send counter. Shared by every frame type, starts at 1.
    fn next_counter(&self) -> u32 {
        self.tx_counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Clear the running flag and wake every loop
    fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
        {
            let mut state = lock(&self.state);
            if *state == EngineState::Running {
                *state = EngineState::Stopping;
            }
        }
        self.shutdown.send_replace(true);
    }

    /// Frame, encrypt and send one packet
    async fn send_frame(&self, packet_type: PacketType, plaintext: &[u8]) -> Result<usize, EngineError> {
        let header = PacketHeader::new(packet_type, self.next_counter());
        let datagram = seal_frame(self.cipher.as_ref(), &header, plaintext)?;

        let sent = self
            .transport
            .send(&datagram)
            .await
            .map_err(|e| EngineError::Send(e.to_string()))?;
        self.counters.record_sent(sent);
        Ok(sent)
    }

    /// Parse, replay-check and authenticate one datagram.
    ///
    /// The window is only updated after the frame authenticates, so forged
    /// counters never move it. Control frames must decrypt to nothing.
    fn open_datagram(&self, datagram: &[u8]) -> Result<Inbound, DropReason> {
        let header = PacketHeader::deserialize(datagram)?;
        let counter = header.counter;
        if !header.nonce_matches_counter() {
            return Err(DropReason::NonceMismatch { counter });
        }

        self.replay
            .classify(u64::from(counter))
            .map_err(|reason| DropReason::Replay { counter, reason })?;

        let plaintext = self
            .cipher
            .try_decrypt(&header.nonce, &datagram[HEADER_SIZE..], &datagram[..HEADER_SIZE])
            .ok_or(DropReason::Unauthenticated { counter })?;
        if header.packet_type.is_control() && !plaintext.is_empty() {
            return Err(DropReason::ControlPayload { counter });
        }

        self.replay
            .check_and_update_detailed(u64::from(counter))
            .map_err(|reason| DropReason::Replay { counter, reason })?;
        self.counters.record_received(datagram.len());

        Ok(match header.packet_type {
            PacketType::Data => Inbound::Data(plaintext),
            PacketType::Keepalive => Inbound::Keepalive,
            PacketType::Disconnect => Inbound::Disconnect,
            PacketType::HandshakeInit => Inbound::HandshakeInit,
            PacketType::HandshakeResponse => Inbound::HandshakeResponse,
        })
    }

    async fn stop(&self) {
        let notify_peer = {
            let mut state = lock(&self.state);
            match *state {
                EngineState::Running => {
                    *state = EngineState::Stopping;
                    true
                }
                EngineState::Idle => {
                    *state = EngineState::Stopped;
                    false
                }
                EngineState::Stopping | EngineState::Stopped => false,
            }
        };

        if notify_peer {
            info!("Stopping forwarding engine");
            match tokio::time::timeout(
                DISCONNECT_SEND_TIMEOUT,
                self.send_frame(PacketType::Disconnect, &[]),
            )
            .await
            {
                Ok(Ok(_)) => debug!("Sent DISCONNECT to peer"),
                Ok(Err(e)) => warn!("Failed to notify peer of disconnect: {}", e),
                Err(_) => warn!("Timed out notifying peer of disconnect"),
            }
        }

        self.halt();
    }
}

/// Cheap, cloneable control handle for a running engine
pub struct EngineHandle<T> {
    core: Arc<Core<T>>,
}

impl<T> Clone for EngineHandle<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Transport> EngineHandle<T> {
    /// Request shutdown. Sends a best-effort DISCONNECT first and returns
    /// without waiting for the loops to drain.
    pub async fn stop(&self) {
        self.core.stop().await;
    }

    pub fn state(&self) -> EngineState {
        self.core.state()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// Current traffic snapshot
    pub fn stats(&self) -> VpnStats {
        self.core.counters.snapshot()
    }

    /// Last counter used for an outbound frame
    pub fn tx_counter(&self) -> u32 {
        self.core.tx_counter.load(Ordering::SeqCst)
    }

    /// Highest counter accepted from the peer
    pub fn replay_high_water(&self) -> u64 {
        self.core.replay.current_counter()
    }
}

/// Bidirectional packet forwarder for one connection
pub struct ForwardingEngine<R, W, T>
where
    R: TunnelReader,
    W: TunnelWriter,
    T: Transport,
{
    core: Arc<Core<T>>,
    input: Mutex<Option<R>>,
    output: Mutex<Option<W>>,
    launched: AtomicBool,
}

impl<R, W, T> ForwardingEngine<R, W, T>
where
    R: TunnelReader,
    W: TunnelWriter,
    T: Transport,
{
    /// Assemble an idle engine. The cipher is moved in and destroyed on
    /// cleanup.
    pub fn new(
        input: R,
        output: W,
        transport: T,
        cipher: Box<dyn Cipher>,
        options: EngineOptions,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core: Arc::new(Core {
                transport,
                cipher,
                running: AtomicBool::new(false),
                state: Mutex::new(EngineState::Idle),
                shutdown,
                tx_counter: AtomicU32::new(0),
                counters: TrafficCounters::new(),
                replay: ReplayWindow::new(),
                options,
                released: AtomicBool::new(false),
            }),
            input: Mutex::new(Some(input)),
            output: Mutex::new(Some(output)),
            launched: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> EngineHandle<T> {
        EngineHandle {
            core: self.core.clone(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.core.state()
    }

    pub fn stats(&self) -> VpnStats {
        self.core.counters.snapshot()
    }

    /// See [`EngineHandle::stop`]
    pub async fn stop(&self) {
        self.core.stop().await;
    }

    /// Move Idle → Running without spawning anything.
    ///
    /// Call this before handing `run()` to a task: a `stop()` issued before
    /// the task is first polled then still notifies the peer.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut state = lock(&self.core.state);
        if *state != EngineState::Idle {
            return Err(EngineError::AlreadyStarted(*state));
        }
        *state = EngineState::Running;
        self.core.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Run all four loops until they exit, then clean up.
    ///
    /// Starts the engine if [`start`](Self::start) was not called. An
    /// engine stopped before it ever ran only releases its resources.
    /// Returns the first loop-terminating error, if any. Resources are
    /// released on every path.
    pub async fn run(&self, observer: Option<StatsCallback>) -> Result<(), EngineError> {
        if self.launched.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted(self.state()));
        }

        let stopped_early = {
            let mut state = lock(&self.core.state);
            match *state {
                EngineState::Idle => {
                    *state = EngineState::Running;
                    self.core.running.store(true, Ordering::SeqCst);
                    false
                }
                EngineState::Running | EngineState::Stopping => false,
                EngineState::Stopped => true,
            }
        };
        if stopped_early {
            debug!("Forwarding engine stopped before it ran");
            self.finish();
            return Ok(());
        }

        let halves = (lock(&self.input).take(), lock(&self.output).take());
        let (input, output) = match halves {
            (Some(input), Some(output)) => (input, output),
            (input, output) => {
                *lock(&self.input) = input;
                *lock(&self.output) = output;
                self.core.halt();
                self.finish();
                return Err(EngineError::TunnelReleased);
            }
        };

        info!(
            "Forwarding engine running ({}, keepalive {}s)",
            self.core.cipher.suite(),
            self.core.options.keepalive_interval.as_secs()
        );

        let (egress, ingress, keepalive, stats) = tokio::join!(
            tokio::spawn(egress_loop(self.core.clone(), input)),
            tokio::spawn(ingress_loop(self.core.clone(), output)),
            tokio::spawn(keepalive_loop(self.core.clone())),
            tokio::spawn(stats_loop(self.core.clone(), observer)),
        );

        let mut outcome = Ok(());
        match egress {
            Ok((input, result)) => {
                *lock(&self.input) = Some(input);
                merge(&mut outcome, result);
            }
            Err(e) => merge(&mut outcome, Err(EngineError::TaskFailed(format!("egress: {}", e)))),
        }
        match ingress {
            Ok((output, result)) => {
                *lock(&self.output) = Some(output);
                merge(&mut outcome, result);
            }
            Err(e) => merge(&mut outcome, Err(EngineError::TaskFailed(format!("ingress: {}", e)))),
        }
        if let Err(e) = keepalive {
            merge(&mut outcome, Err(EngineError::TaskFailed(format!("keepalive: {}", e))));
        }
        if let Err(e) = stats {
            merge(&mut outcome, Err(EngineError::TaskFailed(format!("stats: {}", e))));
        }

        self.finish();

        match &outcome {
            Ok(()) => info!("Forwarding engine stopped ({})", self.stats().format()),
            Err(e) => error!("Forwarding engine stopped with error: {}", e),
        }
        outcome
    }

    fn finish(&self) {
        self.cleanup();
        *lock(&self.core.state) = EngineState::Stopped;
    }

    /// Release the tunnel halves, the socket and the key. Idempotent.
    ///
    /// Each resource is closed independently; a failure on one does not
    /// skip the rest. The cipher is destroyed last.
    pub fn cleanup(&self) {
        self.core.halt();

        if let Some(mut input) = lock(&self.input).take() {
            if let Err(e) = input.close() {
                warn!("Failed to close tunnel input: {}", e);
            }
        }
        if let Some(mut output) = lock(&self.output).take() {
            if let Err(e) = output.close() {
                warn!("Failed to close tunnel output: {}", e);
            }
        }

        if !self.core.released.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.core.transport.close() {
                warn!("Failed to close transport socket: {}", e);
            }
            self.core.cipher.destroy();
            debug!("Forwarding engine resources released");
        }

        let mut state = lock(&self.core.state);
        if *state == EngineState::Idle {
            *state = EngineState::Stopped;
        }
    }
}

impl<R, W, T> Drop for ForwardingEngine<R, W, T>
where
    R: TunnelReader,
    W: TunnelWriter,
    T: Transport,
{
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn merge(outcome: &mut Result<(), EngineError>, result: Result<(), EngineError>) {
    if outcome.is_ok() {
        *outcome = result;
    }
}

/// Tunnel → socket
async fn egress_loop<R, T>(core: Arc<Core<T>>, mut input: R) -> (R, Result<(), EngineError>)
where
    R: TunnelReader,
    T: Transport,
{
    let mut buf = vec![0u8; read_buffer_size(core.options.mtu)];
    let mut shutdown = core.shutdown.subscribe();

    let result = loop {
        if !core.is_running() {
            break Ok(());
        }

        let read = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break Ok(()),
            read = input.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                if core.is_running() {
                    info!("Tunnel interface closed");
                }
                break Ok(());
            }
            Ok(n) => {
                if let Err(e) = core.send_frame(PacketType::Data, &buf[..n]).await {
                    warn!("Dropping outbound packet ({} bytes): {}", n, e);
                }
            }
            Err(e) => {
                if !core.is_running() {
                    break Ok(());
                }
                error!("Tunnel read failed: {}", e);
                break Err(EngineError::TunnelRead(e.to_string()));
            }
        }

        tokio::task::yield_now().await;
    };

    core.halt();
    debug!("Egress loop exited");
    (input, result)
}

/// Socket → tunnel
async fn ingress_loop<W, T>(core: Arc<Core<T>>, mut output: W) -> (W, Result<(), EngineError>)
where
    W: TunnelWriter,
    T: Transport,
{
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut shutdown = core.shutdown.subscribe();

    let result = loop {
        if !core.is_running() {
            break Ok(());
        }

        let received = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break Ok(()),
            received = core.transport.recv(&mut buf) => received,
        };

        let n = match received {
            Ok(Some(n)) => n,
            Ok(None) => continue,
            Err(e) => {
                if !core.is_running() {
                    break Ok(());
                }
                error!("Transport receive failed: {}", e);
                break Err(EngineError::TransportRecv(e.to_string()));
            }
        };

        match core.open_datagram(&buf[..n]) {
            Ok(Inbound::Data(packet)) => {
                if let Err(e) = output.write(&packet).await {
                    warn!("Failed to write {} byte packet to tunnel: {}", packet.len(), e);
                }
            }
            Ok(Inbound::Keepalive) => debug!("Keepalive from peer"),
            Ok(Inbound::Disconnect) => {
                info!("Peer closed the connection");
                core.halt();
                break Ok(());
            }
            Ok(Inbound::HandshakeResponse) => {
                info!("Ignoring HANDSHAKE_RESPONSE: no handshake in progress");
            }
            Ok(Inbound::HandshakeInit) => debug!("Ignoring HANDSHAKE_INIT from peer"),
            Err(
                reason @ (DropReason::Malformed(_)
                | DropReason::NonceMismatch { .. }
                | DropReason::ControlPayload { .. }),
            ) => {
                debug!("Dropping {} byte datagram: {}", n, reason);
            }
            Err(reason) => warn!("Dropping {} byte datagram: {}", n, reason),
        }
    };

    core.halt();
    debug!("Ingress loop exited");
    (output, result)
}

async fn keepalive_loop<T: Transport>(core: Arc<Core<T>>) {
    let mut shutdown = core.shutdown.subscribe();

    loop {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = tokio::time::sleep(core.options.keepalive_interval) => {}
        }
        if !core.is_running() {
            break;
        }

        match core.send_frame(PacketType::Keepalive, &[]).await {
            Ok(_) => debug!("Sent keepalive"),
            Err(e) => warn!("Keepalive send failed: {}", e),
        }
    }
    debug!("Keepalive loop exited");
}

async fn stats_loop<T: Transport>(core: Arc<Core<T>>, observer: Option<StatsCallback>) {
    let mut shutdown = core.shutdown.subscribe();
    let period = core.options.stats_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }
        if !core.is_running() {
            break;
        }
        if let Some(observer) = &observer {
            observer(core.counters.snapshot());
        }
    }

    // Final totals
    if let Some(observer) = &observer {
        observer(core.counters.snapshot());
    }
    debug!("Stats loop exited");
}
