use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};
use uuid::Uuid;

use crate::config::HostConfig;
use crate::log::LogSink;
use crate::net::cipher::{Cipher, CipherError};
use crate::net::framing::{encode_frame, FrameBuffer, FramingError, POKE};
use crate::net::protocol::{format_call, HandlerRef, ProtocolError, Timestamp, Transport};

/// Stable 128-bit connection identity
pub type ConnectionId = Uuid;

/// Which side of the link this connection object lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Server-side view of a client
    Authority,
    /// Client-side view of the server
    Proxy,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection {0} is closed")]
    Closed(ConnectionId),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

type CloseHook = Box<dyn FnOnce(ConnectionId) + Send>;

/// Learned datagram endpoint
#[derive(Debug, Clone)]
struct UnreliableBinding {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

/// Traffic counters
#[derive(Debug)]
pub struct ConnectionStats {
    pub created_at: Instant,
    last_activity: Mutex<Instant>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
}

impl ConnectionStats {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            last_activity: Mutex::new(now),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }
}

/// One peer link: a reliable stream plus an optional datagram endpoint
///
/// Calls are formatted and queued here; transport pumps own the sockets and
/// drain the queues. Every method takes `&self` so the connection can be shared
/// between the tick loop, pumps and map workers.
pub struct Connection {
    id: ConnectionId,
    role: ConnectionRole,
    remote_addr: Option<SocketAddr>,
    bind_token: String,
    reliable_tx: Sender<Vec<u8>>,
    reliable_rx: Receiver<Vec<u8>>,
    unreliable_tx: Sender<Vec<u8>>,
    unreliable_rx: Receiver<Vec<u8>>,
    reliable_frames: Mutex<FrameBuffer>,
    unreliable_frames: Mutex<FrameBuffer>,
    unreliable: RwLock<Option<UnreliableBinding>>,
    cipher: RwLock<Cipher>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    wakeup: Notify,
    close_hooks: Mutex<Vec<CloseHook>>,
    stats: ConnectionStats,
    log: LogSink,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        role: ConnectionRole,
        remote_addr: Option<SocketAddr>,
        config: &HostConfig,
        log: LogSink,
    ) -> Self {
        let (reliable_tx, reliable_rx) = unbounded();
        let (unreliable_tx, unreliable_rx) = unbounded();

        let mut token = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut token);

        Self {
            id,
            role,
            remote_addr,
            bind_token: STANDARD.encode(token),
            reliable_tx,
            reliable_rx,
            unreliable_tx,
            unreliable_rx,
            reliable_frames: Mutex::new(FrameBuffer::new(config.text_encoding, config.max_frame_size)),
            unreliable_frames: Mutex::new(FrameBuffer::new(config.text_encoding, config.max_frame_size)),
            unreliable: RwLock::new(None),
            cipher: RwLock::new(Cipher::identity()),
            closed: AtomicBool::new(false),
            closed_tx: watch::channel(false).0,
            wakeup: Notify::new(),
            close_hooks: Mutex::new(Vec::new()),
            stats: ConnectionStats::new(),
            log,
        }
    }

    /// Connection with no socket behind it; queued frames stay queued
    pub fn detached(role: ConnectionRole) -> Self {
        Self::new(
            Uuid::new_v4(),
            role,
            None,
            &HostConfig::default(),
            LogSink::default().child("connection"),
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Secret the peer presents to bind its datagram endpoint
    pub fn bind_token(&self) -> &str {
        &self.bind_token
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a call on the reliable stream
    pub fn send<S: AsRef<str>>(&self, handler: HandlerRef, args: &[S]) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let text = format_call(handler, Timestamp::now(), args)?;
        self.enqueue(Transport::Reliable, encode_frame(&text));
        Ok(())
    }

    /// Queue a call as a datagram
    ///
    /// Dropped silently when no datagram endpoint is bound.
    pub fn hurl<S: AsRef<str>>(&self, handler: HandlerRef, args: &[S]) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        if !self.has_unreliable() {
            self.log.trace(format_args!("{} dropped {} (no datagram endpoint)", self.id, handler));
            return Ok(());
        }
        let text = format_call(handler, Timestamp::now(), args)?;
        self.enqueue(Transport::Unreliable, encode_frame(&text));
        Ok(())
    }

    /// Queue an already formatted message (terminator is appended)
    pub fn send_raw(&self, text: &str) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.enqueue(Transport::Reliable, encode_frame(text));
        Ok(())
    }

    pub fn send_raw_unreliable(&self, text: &str) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        if self.has_unreliable() {
            self.enqueue(Transport::Unreliable, encode_frame(text));
        }
        Ok(())
    }

    /// Keep-alive: a terminator with nothing before it
    pub fn poke(&self) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.enqueue(Transport::Reliable, POKE.to_vec());
        Ok(())
    }

    /// Close the connection
    ///
    /// Returns true only for the call that actually closed it. Close hooks
    /// run exactly once.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.closed_tx.send_replace(true);
        self.wakeup.notify_one();

        let hooks = std::mem::take(&mut *self.close_hooks.lock());
        for hook in hooks {
            hook(self.id);
        }
        self.log.debug(format_args!("Connection {} closed", self.id));
        true
    }

    /// Run `hook` once when the connection closes (immediately if it already has)
    pub fn on_close(&self, hook: impl FnOnce(ConnectionId) + Send + 'static) {
        {
            let mut hooks = self.close_hooks.lock();
            if !self.is_closed() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook(self.id);
    }

    /// Install a cipher after it passes its self-test
    pub fn set_cipher(&self, cipher: Cipher) -> Result<(), CipherError> {
        match cipher.self_test() {
            Ok(()) => {
                *self.cipher.write() = cipher;
                Ok(())
            }
            Err(e) => {
                self.log
                    .warn(format_args!("Rejected cipher for {}: {}; keeping previous", self.id, e));
                Err(e)
            }
        }
    }

    pub fn has_unreliable(&self) -> bool {
        self.unreliable.read().is_some()
    }

    /// Bind the learned datagram endpoint
    pub fn bind_unreliable(&self, socket: Arc<UdpSocket>, peer: SocketAddr) {
        *self.unreliable.write() = Some(UnreliableBinding { socket, peer });
    }

    pub fn unreliable_peer(&self) -> Option<SocketAddr> {
        self.unreliable.read().as_ref().map(|b| b.peer)
    }

    pub(crate) fn unreliable_socket(&self) -> Option<(Arc<UdpSocket>, SocketAddr)> {
        self.unreliable
            .read()
            .as_ref()
            .map(|b| (b.socket.clone(), b.peer))
    }

    /// Decrypt incoming bytes and collect the frames they complete
    pub fn receive(&self, transport: Transport, bytes: &[u8]) -> Vec<Result<String, FramingError>> {
        self.record_received(bytes.len());
        let plain = self.cipher.read().decrypt(bytes);
        match transport {
            Transport::Reliable => self.reliable_frames.lock().push(&plain),
            Transport::Unreliable => self.unreliable_frames.lock().push(&plain),
        }
    }

    /// Everything queued on the reliable stream as one encrypted batch
    pub(crate) fn drain_reliable(&self) -> Option<Vec<u8>> {
        let mut batch = Vec::new();
        while let Ok(frame) = self.reliable_rx.try_recv() {
            batch.extend_from_slice(&frame);
        }
        if batch.is_empty() {
            return None;
        }
        Some(self.cipher.read().encrypt(&batch))
    }

    /// Queued datagrams, one encrypted payload per frame
    pub(crate) fn drain_unreliable(&self) -> Vec<Vec<u8>> {
        let cipher = self.cipher.read();
        self.unreliable_rx
            .try_iter()
            .map(|frame| cipher.encrypt(&frame))
            .collect()
    }

    /// Frames waiting for the send pump
    pub fn queued(&self) -> usize {
        self.reliable_rx.len() + self.unreliable_rx.len()
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Resolves when new output is queued or the connection closes
    pub async fn wait_for_output(&self) {
        self.wakeup.notified().await
    }

    pub fn record_sent(&self, bytes: usize) {
        self.stats.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.stats.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn touch(&self) {
        *self.stats.last_activity.lock() = Instant::now();
    }

    /// Time since anything was received
    pub fn idle_time(&self) -> Duration {
        self.stats.last_activity.lock().elapsed()
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            Err(ConnectionError::Closed(self.id))
        } else {
            Ok(())
        }
    }

    fn enqueue(&self, transport: Transport, frame: Vec<u8>) {
        let sent = match transport {
            Transport::Reliable => self.reliable_tx.send(frame),
            Transport::Unreliable => self.unreliable_tx.send(frame),
        };
        // Receiver lives in self, so send only fails during teardown
        if sent.is_ok() {
            self.wakeup.notify_one();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Live connections by id
#[derive(Default)]
pub struct ConnectionSet {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection: Arc<Connection>) {
        self.connections.insert(connection.id(), connection);
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|c| c.value().clone())
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, c)| c)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|c| *c.key()).collect()
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close and drop connections idle for longer than `max_idle`
    pub fn cleanup_idle(&self, max_idle: Duration) -> Vec<ConnectionId> {
        let stale: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|c| c.idle_time() > max_idle)
            .map(|c| c.value().clone())
            .collect();

        stale
            .into_iter()
            .map(|conn| {
                conn.close();
                self.remove(conn.id());
                conn.id()
            })
            .collect()
    }
}
