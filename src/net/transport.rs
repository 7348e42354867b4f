//! Socket ownership and pump tasks
//!
//! A [`Link`] owns everything between the sockets and the host's inbox: the
//! stream listener with bind retry, the datagram endpoint sharing its port,
//! and the receive/send pump pair spawned for every connection.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use crossbeam_channel::Sender;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::HostConfig;
use crate::host::control::{BIND_UNRELIABLE, WELCOME};
use crate::log::LogSink;
use crate::metrics::Metrics;
use crate::net::connection::{Connection, ConnectionId, ConnectionRole, ConnectionSet};
use crate::net::framing::{SEPARATOR, TERMINATOR};
use crate::net::protocol::{format_call, Message, Timestamp, Transport};

const READ_BUFFER: usize = 8 * 1024;
const MAX_DATAGRAM: usize = 64 * 1024;

/// Connection lifecycle notifications for the host
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Opened(Arc<Connection>),
    Closed(Arc<Connection>),
}

/// Socket side of one host
pub struct Link {
    config: HostConfig,
    connections: Arc<ConnectionSet>,
    peers: DashMap<SocketAddr, ConnectionId>,
    datagrams: Mutex<Option<Arc<UdpSocket>>>,
    inbox: Sender<Message>,
    events: Sender<LinkEvent>,
    metrics: Arc<Metrics>,
    log: LogSink,
    shutdown: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Link {
    pub fn new(
        config: HostConfig,
        connections: Arc<ConnectionSet>,
        inbox: Sender<Message>,
        events: Sender<LinkEvent>,
        metrics: Arc<Metrics>,
        log: LogSink,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            connections,
            peers: DashMap::new(),
            datagrams: Mutex::new(None),
            inbox,
            events,
            metrics,
            log,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Bind the stream listener and the datagram socket on the same port
    ///
    /// Retries every `bind_retry_delay` until both binds succeed or shutdown
    /// is signalled. Returns the bound address.
    pub async fn listen(self: &Arc<Self>) -> io::Result<SocketAddr> {
        let requested = SocketAddr::new(self.config.bind_address, self.config.port);
        let mut shutdown = self.shutdown.clone();

        let (listener, socket) = loop {
            match bind_pair(requested).await {
                Ok(pair) => break pair,
                Err(e) => {
                    self.log.error(format_args!(
                        "Bind {} failed: {}; retrying in {:?}",
                        requested, e, self.config.bind_retry_delay
                    ));
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.bind_retry_delay) => {}
                        _ = shutdown.changed() => {
                            return Err(io::Error::new(io::ErrorKind::Interrupted, "shutdown during bind"));
                        }
                    }
                }
            }
        };

        let local = listener.local_addr()?;
        let socket = Arc::new(socket);
        *self.datagrams.lock() = Some(socket.clone());

        self.log.info(format_args!("Listening on {} (stream + datagram)", local));

        let link = self.clone();
        self.spawn(async move { link.accept_loop(listener).await });
        let link = self.clone();
        self.spawn(async move { link.datagram_loop(socket, true).await });

        Ok(local)
    }

    /// Open the proxy side link to a remote authority
    pub async fn connect(self: &Arc<Self>, remote: SocketAddr) -> io::Result<Arc<Connection>> {
        let stream = TcpStream::connect(remote).await?;
        stream.set_nodelay(true)?;

        let local_any = SocketAddr::new(
            match remote {
                SocketAddr::V4(_) => std::net::Ipv4Addr::UNSPECIFIED.into(),
                SocketAddr::V6(_) => std::net::Ipv6Addr::UNSPECIFIED.into(),
            },
            0,
        );
        let socket = Arc::new(UdpSocket::bind(local_any).await?);
        *self.datagrams.lock() = Some(socket.clone());

        let link = self.clone();
        self.spawn(async move { link.datagram_loop(socket, false).await });

        Ok(self.open(Uuid::new_v4(), ConnectionRole::Proxy, stream, remote))
    }

    /// Register a connection for a fresh stream and start its pumps
    fn open(
        self: &Arc<Self>,
        id: ConnectionId,
        role: ConnectionRole,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(
            id,
            role,
            Some(remote),
            &self.config,
            self.log.child("connection"),
        ));

        let weak_conn = Arc::downgrade(&conn);
        let weak_link: Weak<Link> = Arc::downgrade(self);
        conn.on_close(move |id| {
            if let Some(link) = weak_link.upgrade() {
                link.peers.retain(|_, owner| *owner != id);
                Metrics::decr(&link.metrics.connections_active);
                if let Some(conn) = weak_conn.upgrade() {
                    let _ = link.events.send(LinkEvent::Closed(conn));
                }
            }
        });

        // Welcome goes out before anything a connect hook might send
        if role == ConnectionRole::Authority {
            let args = [conn.id().to_string(), conn.bind_token().to_string()];
            if let Err(e) = conn.send(WELCOME, &args) {
                self.log.warn(format_args!("Failed to queue welcome for {}: {}", id, e));
            }
        }

        self.connections.insert(conn.clone());
        Metrics::incr(&self.metrics.connections_active);
        Metrics::incr(&self.metrics.connections_total);

        // Opened is queued before the pumps can observe a close
        let _ = self.events.send(LinkEvent::Opened(conn.clone()));

        let (reader, writer) = stream.into_split();
        let link = self.clone();
        let c = conn.clone();
        self.spawn(async move { link.receive_pump(c, reader).await });
        let link = self.clone();
        let c = conn.clone();
        self.spawn(async move { link.send_pump(c, writer).await });

        conn
    }

    /// Bind a connection's datagram endpoint to `peer`
    pub fn bind_peer(&self, conn: &Connection, peer: SocketAddr) -> bool {
        let Some(socket) = self.datagram_socket() else {
            return false;
        };
        conn.bind_unreliable(socket, peer);
        self.peers.insert(peer, conn.id());
        true
    }

    /// Plaintext bind request from a proxy to the authority's datagram port
    pub fn request_bind(&self, target: SocketAddr, id: ConnectionId, token: &str) -> io::Result<()> {
        let socket = self
            .datagram_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no datagram socket"))?;
        let text = format_call(BIND_UNRELIABLE, Timestamp::now(), &[id.to_string(), token.to_string()])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut bytes = text.into_bytes();
        bytes.push(TERMINATOR);
        socket.try_send_to(&bytes, target)?;
        Ok(())
    }

    pub fn datagram_socket(&self) -> Option<Arc<UdpSocket>> {
        self.datagrams.lock().clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Await every pump and loop task
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                self.log.warn(format_args!("Transport task ended abnormally: {}", e));
            }
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            self.log.debug(format_args!("set_nodelay failed for {}: {}", addr, e));
                        }
                        let conn = self.open(Uuid::new_v4(), ConnectionRole::Authority, stream, addr);
                        self.log.debug(format_args!("Accepted {} from {}", conn.id(), addr));
                    }
                    Err(e) => self.log.warn(format_args!("Accept failed: {}", e)),
                }
            }
        }
        self.log.debug("Accept loop stopped");
    }

    async fn receive_pump(self: Arc<Self>, conn: Arc<Connection>, mut reader: OwnedReadHalf) {
        let mut shutdown = self.shutdown.clone();
        let mut buffer = vec![0u8; READ_BUFFER];

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = conn.closed() => break,
                read = reader.read(&mut buffer) => match read {
                    Ok(0) => {
                        self.log.debug(format_args!("{} reached end of stream", conn.id()));
                        break;
                    }
                    Ok(n) => self.deliver(&conn, Transport::Reliable, &buffer[..n]),
                    Err(e) => {
                        self.log.debug(format_args!("{} read error: {}", conn.id(), e));
                        break;
                    }
                }
            }
        }

        conn.close();
    }

    async fn send_pump(self: Arc<Self>, conn: Arc<Connection>, mut writer: OwnedWriteHalf) {
        let mut shutdown = self.shutdown.clone();
        let mut stopping = false;

        loop {
            if let Some(batch) = conn.drain_reliable() {
                if let Err(e) = writer.write_all(&batch).await {
                    self.log.debug(format_args!("{} write error: {}", conn.id(), e));
                    break;
                }
                conn.record_sent(batch.len());
                Metrics::add(&self.metrics.bytes_sent, batch.len() as u64);
            }

            let datagrams = conn.drain_unreliable();
            if !datagrams.is_empty() {
                if let Some((socket, peer)) = conn.unreliable_socket() {
                    for datagram in datagrams {
                        match socket.send_to(&datagram, peer).await {
                            Ok(n) => {
                                conn.record_sent(n);
                                Metrics::add(&self.metrics.bytes_sent, n as u64);
                            }
                            Err(e) => self.log.trace(format_args!("Datagram to {} lost: {}", peer, e)),
                        }
                    }
                }
            }

            if stopping || conn.is_closed() {
                break;
            }

            tokio::select! {
                _ = conn.wait_for_output() => {}
                _ = shutdown.changed() => stopping = true,
            }
        }

        let _ = writer.shutdown().await;
        conn.close();
    }

    async fn datagram_loop(self: Arc<Self>, socket: Arc<UdpSocket>, accept_binds: bool) {
        let mut shutdown = self.shutdown.clone();
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = socket.recv_from(&mut buffer) => match received {
                    Ok((n, addr)) => {
                        let bytes = &buffer[..n];
                        let known = self.peers.get(&addr).map(|id| *id);
                        match known.and_then(|id| self.connections.get(id)) {
                            Some(conn) => self.deliver(&conn, Transport::Unreliable, bytes),
                            None if accept_binds => self.try_bind(&socket, addr, bytes),
                            None => self.log.trace(format_args!("Datagram from unknown {}", addr)),
                        }
                    }
                    // ICMP errors from earlier sends surface here
                    Err(e) => self.log.trace(format_args!("Datagram receive error: {}", e)),
                }
            }
        }
    }

    /// Handle a plaintext `BindUnreliable` from an address we don't know yet
    fn try_bind(&self, socket: &Arc<UdpSocket>, addr: SocketAddr, bytes: &[u8]) {
        let Some(request) = parse_bind_request(bytes) else {
            self.log.debug(format_args!("Ignored datagram from unbound {}", addr));
            return;
        };
        let Some(conn) = self.connections.get(request.0) else {
            return;
        };
        if conn.bind_token() != request.1 {
            self.log.warn(format_args!("Bad datagram bind token for {} from {}", conn.id(), addr));
            return;
        }

        if let Some(previous) = conn.unreliable_peer() {
            self.peers.remove(&previous);
        }
        conn.bind_unreliable(socket.clone(), addr);
        self.peers.insert(addr, conn.id());
        self.log.debug(format_args!("Bound datagrams for {} to {}", conn.id(), addr));
    }

    /// Reassemble, parse and forward whatever `bytes` completes
    fn deliver(&self, conn: &Arc<Connection>, transport: Transport, bytes: &[u8]) {
        Metrics::add(&self.metrics.bytes_received, bytes.len() as u64);
        let received_at = Instant::now();

        for frame in conn.receive(transport, bytes) {
            let parsed = frame
                .map_err(|e| e.to_string())
                .and_then(|text| {
                    Message::parse(&text, conn.clone(), transport, received_at).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(message) => {
                    Metrics::incr(&self.metrics.messages_received);
                    if self.inbox.send(message).is_err() {
                        self.log.debug("Inbox closed; dropping message");
                    }
                }
                Err(e) => {
                    Metrics::incr(&self.metrics.messages_malformed);
                    self.log.warn(format_args!("Dropped frame from {}: {}", conn.id(), e));
                }
            }
        }
    }
}

async fn bind_pair(addr: SocketAddr) -> io::Result<(TcpListener, UdpSocket)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let socket = UdpSocket::bind(local).await?;
    Ok((listener, socket))
}

/// `Host SEP BindUnreliable SEP ts SEP id SEP token` with optional terminator
fn parse_bind_request(bytes: &[u8]) -> Option<(ConnectionId, String)> {
    let text = std::str::from_utf8(bytes).ok()?;
    let text = text.trim_end_matches(TERMINATOR as char);
    let fields: Vec<&str> = text.split(SEPARATOR as char).collect();
    if fields.len() < 5 || fields[0] != BIND_UNRELIABLE.kind || fields[1] != BIND_UNRELIABLE.method {
        return None;
    }
    Timestamp::decode(fields[2]).ok()?;
    let id = Uuid::parse_str(fields[3]).ok()?;
    Some((id, fields[4].to_string()))
}
