//! Host orchestration
//!
//! A host owns the connection set, the installed services, the dispatch table
//! and the tick loop. Two roles exist: [`AuthorityHost`] listens for clients,
//! [`ProxyHost`] holds one connection to a remote authority. Both share
//! [`HostContext`] and the [`Host`] trait.

pub mod control;
pub mod dispatch;
pub mod service;

use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Select};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::HostConfig;
use crate::host::control::{AuthorityControl, ProxyControl, CLOSED};
use crate::host::dispatch::DispatchTable;
use crate::host::service::{Service, ServiceRegistry};
use crate::log::LogSink;
use crate::metrics::Metrics;
use crate::net::connection::{Connection, ConnectionError, ConnectionId, ConnectionRole, ConnectionSet};
use crate::net::protocol::{HandlerRef, Message};
use crate::net::transport::{Link, LinkEvent};

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Service {0} is already installed")]
    DuplicateService(String),
    #[error("Service {0} failed to enable: {1}")]
    Enable(&'static str, String),
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Run `f`, logging instead of unwinding if it panics
pub(crate) fn guarded<T>(log: &LogSink, what: impl Display, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            log.error(format_args!("{} panicked: {}", what, panic_message(payload.as_ref())));
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// State shared by the tick loop, handlers and transport
pub struct HostContext {
    role: ConnectionRole,
    config: HostConfig,
    connections: Arc<ConnectionSet>,
    services: ServiceRegistry,
    dispatch: DispatchTable,
    inbox: Receiver<Message>,
    events: Receiver<LinkEvent>,
    /// Connections whose connect hooks have run
    opened: Mutex<FxHashSet<ConnectionId>>,
    /// Messages that arrived before their connection's open event
    deferred: Mutex<Vec<Message>>,
    link: Arc<Link>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    log: LogSink,
    metrics: Arc<Metrics>,
}

impl HostContext {
    pub fn new(role: ConnectionRole, config: HostConfig, log: LogSink, metrics: Arc<Metrics>) -> Arc<Self> {
        let connections = Arc::new(ConnectionSet::new());
        let (inbox_tx, inbox) = unbounded();
        let (events_tx, events) = unbounded();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let link = Link::new(
            config.clone(),
            connections.clone(),
            inbox_tx,
            events_tx,
            metrics.clone(),
            log.child("transport"),
            shutdown_rx,
        );

        Arc::new(Self {
            role,
            config,
            connections,
            services: ServiceRegistry::new(),
            dispatch: DispatchTable::new(log.child("dispatch")),
            inbox,
            events,
            opened: Mutex::new(FxHashSet::default()),
            deferred: Mutex::new(Vec::new()),
            link,
            running: AtomicBool::new(true),
            shutdown,
            log,
            metrics,
        })
    }

    /// Context with default config and no sockets opened
    pub fn detached(role: ConnectionRole) -> Arc<Self> {
        Self::new(role, HostConfig::default(), LogSink::default(), Arc::new(Metrics::new()))
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionSet> {
        &self.connections
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Install and enable a service
    pub fn install_service<S: Service>(&self, service: Arc<S>) -> Result<(), HostError> {
        let kind = service.kind();
        let installed = self.services.install(service)?;
        if let Err(e) = installed.enable(self) {
            self.services.uninstall(kind);
            self.dispatch.invalidate(kind);
            return Err(HostError::Enable(kind, format!("{:#}", e)));
        }
        self.log.debug(format_args!("Installed service {}", kind));
        Ok(())
    }

    /// Queue a reliable call on one connection
    pub fn call<S: AsRef<str>>(
        &self,
        connection: ConnectionId,
        handler: HandlerRef,
        args: &[S],
    ) -> Result<(), HostError> {
        let conn = self
            .connections
            .get(connection)
            .ok_or(HostError::UnknownConnection(connection))?;
        conn.send(handler, args)?;
        Metrics::incr(&self.metrics.messages_sent);
        Ok(())
    }

    /// Process pending connection events and messages once
    ///
    /// Opens are delivered before the inbox and closes after it. A message
    /// whose connection has not been opened yet waits for a later pump, so a
    /// connection's messages always land between its connect and disconnect.
    pub fn pump(&self) {
        let events: Vec<LinkEvent> = self.events.try_iter().collect();
        let arrived: Vec<Message> = self.inbox.try_iter().collect();
        self.process(events, arrived);
    }

    fn process(&self, events: Vec<LinkEvent>, arrived: Vec<Message>) {
        for event in &events {
            if let LinkEvent::Opened(conn) = event {
                self.opened.lock().insert(conn.id());
                self.connected(conn);
            }
        }

        let mut pending = std::mem::take(&mut *self.deferred.lock());
        pending.extend(arrived);
        for message in pending {
            let conn = message.connection();
            if self.opened.lock().contains(&conn.id()) {
                self.dispatch.dispatch(self, &message);
            } else if conn.is_closed() {
                self.log.debug(format_args!(
                    "Dropped {} from {}; closed before it was connected",
                    message.dispatch_key(),
                    conn.id()
                ));
            } else {
                self.deferred.lock().push(message);
            }
        }

        for event in &events {
            if let LinkEvent::Closed(conn) = event {
                self.disconnected(conn);
            }
        }
    }

    /// Run every service tick in install order
    pub fn tick_services(&self) {
        let started = Instant::now();
        for service in self.services.ordered() {
            guarded(&self.log, format_args!("{}.tick", service.kind()), || service.tick(self));
        }
        self.metrics.record_tick_time(started.elapsed());
    }

    fn connected(&self, conn: &Arc<Connection>) {
        self.log.debug(format_args!("Connected {}", conn.id()));
        for service in self.services.ordered() {
            guarded(&self.log, format_args!("{}.on_connect", service.kind()), || {
                service.on_connect(self, conn)
            });
        }
    }

    fn disconnected(&self, conn: &Arc<Connection>) {
        self.opened.lock().remove(&conn.id());
        self.connections.remove(conn.id());
        self.log.debug(format_args!("Disconnected {}", conn.id()));
        for service in self.services.ordered() {
            guarded(&self.log, format_args!("{}.on_disconnect", service.kind()), || {
                service.on_disconnect(self, conn)
            });
        }
    }

    /// Wall-clock rate limited loop; runs on a blocking thread
    fn tick_loop(self: Arc<Self>) {
        let interval = self.config.tick_interval();
        let mut last_tick = Instant::now();

        while self.is_running() {
            self.pump();

            if last_tick.elapsed() >= interval {
                last_tick = Instant::now();
                self.tick_services();
            }

            // Sleep until the next tick unless traffic arrives first
            let wait = interval.saturating_sub(last_tick.elapsed());
            let mut ready = Select::new();
            ready.recv(&self.inbox);
            ready.recv(&self.events);
            let _ = ready.ready_timeout(wait);
        }
    }

    fn begin_stop(&self) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        fence(Ordering::SeqCst);
        self.shutdown.send_replace(true);
        true
    }

    fn finish_stop(&self) {
        for conn in self.connections.all() {
            conn.close();
        }
        // Deliver the final closes so disconnect hooks see every connection
        self.pump();

        for service in self.services.ordered().into_iter().rev() {
            let kind = service.kind();
            guarded(&self.log, format_args!("{}.disable", kind), || service.disable(self));
            // Handlers capture their service; dropping them releases it
            self.services.uninstall(kind);
            self.dispatch.invalidate(kind);
        }
        self.log.info("Host stopped");
    }
}

/// Operations shared by both host roles
pub trait Host {
    fn context(&self) -> &Arc<HostContext>;

    fn install_service<S: Service>(&self, service: Arc<S>) -> Result<(), HostError> {
        self.context().install_service(service)
    }

    fn call<S: AsRef<str>>(&self, connection: ConnectionId, handler: HandlerRef, args: &[S]) -> Result<(), HostError> {
        self.context().call(connection, handler, args)
    }

    /// Stop every task and disable services in reverse install order
    fn stop(&self) -> impl Future<Output = ()> + Send;
}

/// Background tasks of one host
#[derive(Default)]
struct Tasks {
    tick: Mutex<Option<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Tasks {
    fn start_tick(&self, ctx: &Arc<HostContext>) {
        let ctx = ctx.clone();
        *self.tick.lock() = Some(tokio::task::spawn_blocking(move || ctx.tick_loop()));
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.background.lock().push(tokio::spawn(task));
    }

    async fn join(&self, ctx: &HostContext) {
        let tick = self.tick.lock().take();
        if let Some(tick) = tick {
            if let Err(e) = tick.await {
                ctx.log.error(format_args!("Tick loop ended abnormally: {}", e));
            }
        }
        let background: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for task in background {
            let _ = task.await;
        }
        ctx.link.join().await;
    }
}

/// Listening host that owns the authoritative state
pub struct AuthorityHost {
    ctx: Arc<HostContext>,
    local_addr: SocketAddr,
    tasks: Tasks,
}

impl AuthorityHost {
    /// Bind (retrying until it succeeds) and start the tick loop
    pub async fn start(config: HostConfig, log: LogSink, metrics: Arc<Metrics>) -> Result<Self, HostError> {
        let ctx = HostContext::new(ConnectionRole::Authority, config, log, metrics);
        ctx.install_service(Arc::new(AuthorityControl))?;

        let local_addr = ctx.link.listen().await?;
        let tasks = Tasks::default();
        tasks.start_tick(&ctx);

        let idle = ctx.clone();
        tasks.spawn(async move { idle_cleanup(idle).await });

        Ok(Self { ctx, local_addr, tasks })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Host for AuthorityHost {
    fn context(&self) -> &Arc<HostContext> {
        &self.ctx
    }

    async fn stop(&self) {
        if !self.ctx.begin_stop() {
            return;
        }
        self.tasks.join(&self.ctx).await;
        self.ctx.finish_stop();
    }
}

async fn idle_cleanup(ctx: Arc<HostContext>) {
    let timeout = ctx.config.idle_timeout;
    let mut shutdown = ctx.shutdown_signal();
    let mut interval = tokio::time::interval(timeout.min(Duration::from_secs(1)).max(Duration::from_millis(10)));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let closed = ctx.connections.cleanup_idle(timeout);
                if !closed.is_empty() {
                    ctx.log.info(format_args!("Closed {} idle connection(s)", closed.len()));
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Client-side host holding one connection to an authority
pub struct ProxyHost {
    ctx: Arc<HostContext>,
    server: Arc<Connection>,
    control: Arc<ProxyControl>,
    tasks: Tasks,
}

impl ProxyHost {
    pub async fn connect(
        config: HostConfig,
        remote: SocketAddr,
        log: LogSink,
        metrics: Arc<Metrics>,
    ) -> Result<Self, HostError> {
        let ctx = HostContext::new(ConnectionRole::Proxy, config, log, metrics);
        let control = Arc::new(ProxyControl::default());
        ctx.install_service(control.clone())?;

        let server = ctx.link.connect(remote).await?;
        let tasks = Tasks::default();
        tasks.start_tick(&ctx);

        let poker = ctx.clone();
        let conn = server.clone();
        tasks.spawn(async move { keep_alive(poker, conn).await });

        Ok(Self {
            ctx,
            server,
            control,
            tasks,
        })
    }

    /// Connection to the authority
    pub fn server(&self) -> &Arc<Connection> {
        &self.server
    }

    /// Identity the authority assigned, once welcomed
    pub fn assigned_id(&self) -> Option<ConnectionId> {
        self.control.assigned_id()
    }

    pub fn send<S: AsRef<str>>(&self, handler: HandlerRef, args: &[S]) -> Result<(), HostError> {
        self.server.send(handler, args)?;
        Metrics::incr(&self.ctx.metrics.messages_sent);
        Ok(())
    }

    pub fn hurl<S: AsRef<str>>(&self, handler: HandlerRef, args: &[S]) -> Result<(), HostError> {
        self.server.hurl(handler, args)?;
        Ok(())
    }
}

impl Host for ProxyHost {
    fn context(&self) -> &Arc<HostContext> {
        &self.ctx
    }

    async fn stop(&self) {
        if let Err(e) = self.server.send::<&str>(CLOSED, &[]) {
            self.ctx.log.debug(format_args!("Goodbye not sent: {}", e));
        }
        if !self.ctx.begin_stop() {
            return;
        }
        self.tasks.join(&self.ctx).await;
        self.ctx.finish_stop();
    }
}

async fn keep_alive(ctx: Arc<HostContext>, server: Arc<Connection>) {
    let mut shutdown = ctx.shutdown_signal();
    let mut interval = tokio::time::interval(ctx.config.poke_interval);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if server.poke().is_err() {
                    break;
                }
            }
            _ = server.closed() => break,
            _ = shutdown.changed() => break,
        }
    }
}
