//! Starting and stopping a server.
//!
//! A server moves through [`ServerStatus`] exactly once:
//! `Starting -> Opened -> Stopping -> Stopped`. Start binds the listener,
//! installs the connection, request and session trackers and registers
//! their `stop` as cleanups. Stop cancels the server token, runs the
//! cleanups concurrently, and closes the listener only after every one of
//! them finished.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::cancel::{CancelError, CancellationSource, CancellationToken, Operation, OperationError, Registration, StopReason};
use crate::publisher::Publisher;
use crate::server::config::{Protocol, ServerConfig, ServerHooks};
use crate::server::dispatch::{ConnectionContext, Dispatcher, StopTrigger};
use crate::server::error::Error;
use crate::server::handler::RequestHandler;
use crate::server::listener::{find_free_port, listen, Listening};
use crate::server::logger::Logger;
use crate::server::tls::make_tls_acceptor;
use crate::server::{http1, http2};
use crate::signal::{SignalBridge, SignalSubscription};
use crate::tracker::{Connection, ConnectionTracker, InflightRequest, RequestTracker, Session, SessionTracker};

/// Where a server is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServerStatus {
    Starting,
    Opened,
    Stopping,
    Stopped,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServerStatus::Starting => "starting",
            ServerStatus::Opened => "opened",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Stopped => "stopped",
        })
    }
}

type Cleanup = Box<dyn FnOnce(StopReason) -> BoxFuture<'static, ()> + Send>;

struct ServerShared {
    config: ServerConfig,
    hooks: ServerHooks,
    logger: Logger,
    status: Mutex<ServerStatus>,
    // Fires when stop begins; request tokens derive from it
    server_source: CancellationSource,
    // Only cancelled by a stop arriving while the listener is being opened
    listener_source: CancellationSource,
    cleanups: Mutex<Vec<Cleanup>>,
    listener: Mutex<Option<Operation<Listening>>>,
    starting: watch::Sender<bool>,
    stopped: watch::Sender<Option<StopReason>>,
    signal_subscription: Mutex<Option<SignalSubscription>>,
    external_token: Option<CancellationToken>,
    external_registration: Mutex<Option<Registration>>,
    connections: Publisher<Connection>,
    requests: Publisher<InflightRequest>,
    sessions: Publisher<Session>,
    dispatcher: Arc<Dispatcher>,
    tls: Option<TlsAcceptor>,
    runtime: Handle,
}

impl ServerShared {
    fn new(
        config: ServerConfig,
        hooks: ServerHooks,
        handler: RequestHandler,
        tls: Option<TlsAcceptor>,
        external_token: Option<CancellationToken>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ServerShared>| {
            let server_source = CancellationSource::new();
            let stop_trigger: StopTrigger = {
                let weak = weak.clone();
                Arc::new(move |reason: StopReason| {
                    if let Some(shared) = weak.upgrade() {
                        shared.spawn_stop(reason);
                    }
                })
            };
            let dispatcher = Arc::new(Dispatcher::new(
                &config,
                hooks.clone(),
                handler,
                server_source.token(),
                Some(stop_trigger),
            ));
            let (starting, _) = watch::channel(true);
            let (stopped, _) = watch::channel(None);

            ServerShared {
                logger: Logger::new(config.log_level),
                config,
                hooks,
                status: Mutex::new(ServerStatus::Starting),
                server_source,
                listener_source: CancellationSource::new(),
                cleanups: Mutex::new(Vec::new()),
                listener: Mutex::new(None),
                starting,
                stopped,
                signal_subscription: Mutex::new(None),
                external_token,
                external_registration: Mutex::new(None),
                connections: Publisher::new(),
                requests: Publisher::new(),
                sessions: Publisher::new(),
                dispatcher,
                tls,
                runtime: Handle::current(),
            }
        })
    }

    fn status(&self) -> ServerStatus {
        *self.status.lock()
    }

    fn cancelled(&self) -> Error {
        let reason = self
            .server_source
            .token()
            .reason()
            .or_else(|| self.external_token.as_ref().and_then(CancellationToken::reason))
            .unwrap_or_default();
        Error::Cancelled(CancelError::new(reason))
    }

    /// Whether opening may go on. The external token is checked directly
    /// since the stop it triggers runs on another task.
    fn may_open(&self, status: ServerStatus) -> bool {
        status == ServerStatus::Starting
            && !self
                .external_token
                .as_ref()
                .is_some_and(CancellationToken::is_cancellation_requested)
    }

    /// Stop from a context that cannot await, such as a signal callback.
    fn spawn_stop(self: &Arc<Self>, reason: StopReason) {
        let shared = self.clone();
        self.runtime.spawn(async move {
            shared.stop(reason).await;
        });
    }

    /// Subscribe the configured process triggers and the external token.
    fn wire_triggers(self: &Arc<Self>) {
        let triggers = self.config.stop_triggers();
        if !triggers.is_empty() {
            let bridge = self
                .hooks
                .signal_bridge
                .clone()
                .unwrap_or_else(SignalBridge::process);
            let weak = Arc::downgrade(self);
            let subscription = bridge.subscribe(&triggers, move |trigger| {
                if let Some(shared) = weak.upgrade() {
                    shared.logger.info(format_args!("received {trigger}"));
                    shared.spawn_stop(StopReason::Signal(trigger));
                }
            });
            *self.signal_subscription.lock() = Some(subscription);
        }

        if let Some(token) = &self.external_token {
            let weak = Arc::downgrade(self);
            let registration = token.on_cancel(move |reason| {
                if let Some(shared) = weak.upgrade() {
                    shared.spawn_stop(reason.clone());
                }
            });
            *self.external_registration.lock() = Some(registration);
        }
    }

    async fn resolve_port(&self, ip: IpAddr) -> Result<u16, Error> {
        match self.config.port_hint {
            Some(hint) if self.config.port == 0 && !self.config.force_port => Ok(find_free_port(ip, hint).await?),
            _ => Ok(self.config.port),
        }
    }

    /// Bind, install the trackers and start accepting.
    async fn open(self: &Arc<Self>, ip: IpAddr) -> Result<(String, SocketAddr), Error> {
        let port = self.resolve_port(ip).await?;
        let operation = match listen(&self.listener_source.token(), ip, port).await {
            Ok(operation) => operation,
            Err(OperationError::Cancelled(e)) => return Err(Error::Cancelled(e)),
            Err(OperationError::Failed(e)) => return Err(Error::Bind(e)),
        };
        let listening = operation.value().clone();
        let local_addr = listening.local_addr();
        let origin = origin_for(self.config.protocol, local_addr);

        let installed = {
            let status = self.status.lock();
            if self.may_open(*status) {
                self.install_trackers();
                true
            } else {
                false
            }
        };
        if !installed {
            operation.stop().await;
            return Err(self.cancelled());
        }
        *self.listener.lock() = Some(operation);

        let context = Arc::new(ConnectionContext {
            dispatcher: self.dispatcher.clone(),
            requests: self.requests.clone(),
            sessions: self.sessions.clone(),
            origin: origin.clone(),
            read_buffer_size: self.config.read_buffer_size,
            max_body_size: self.config.max_body_size,
        });
        let shared = self.clone();
        listening.serve(move |stream, peer| shared.accept(stream, peer, &context));

        let opened = {
            let mut status = self.status.lock();
            if self.may_open(*status) {
                *status = ServerStatus::Opened;
                true
            } else {
                false
            }
        };
        if !opened {
            return Err(self.cancelled());
        }
        Ok((origin, local_addr))
    }

    fn install_trackers(&self) {
        let mut cleanups = self.cleanups.lock();

        let connections = ConnectionTracker::new();
        connections.track(&self.connections);
        cleanups.push(Box::new(move |reason: StopReason| {
            async move { connections.stop(&reason).await }.boxed()
        }));

        let requests = RequestTracker::new();
        requests.track(&self.requests);
        cleanups.push(Box::new(move |reason: StopReason| {
            async move {
                requests
                    .stop(reason.termination_status(), &reason.to_string())
                    .await
            }
            .boxed()
        }));

        if self.config.http2 {
            let sessions = SessionTracker::new();
            sessions.track(&self.sessions);
            let logger = self.logger;
            cleanups.push(Box::new(move |reason: StopReason| {
                async move {
                    if let Err(e) = sessions.stop(&reason).await {
                        logger.warn(format_args!("error while closing HTTP/2 sessions: {e}"));
                    }
                }
                .boxed()
            }));
        }
    }

    fn accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, context: &Arc<ConnectionContext>) {
        let connection = Connection::new(peer);
        let guard = connection.close_guard();
        self.connections.next(connection.clone());
        if self.server_source.is_cancelled() {
            // Published first so a tracker snapshot taken meanwhile sees it closed
            drop(stream);
            drop(guard);
            return;
        }

        let shared = self.clone();
        let context = context.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = shared.serve(stream, &connection, context).await {
                match e {
                    Error::IoError(_) | Error::ParseError(_) => {
                        shared.logger.debug(format_args!("connection from {peer} ended: {e}"))
                    }
                    _ => shared.logger.warn(format_args!("error handling connection from {peer}: {e}")),
                }
            }
        });
    }

    async fn serve(&self, stream: TcpStream, connection: &Connection, context: Arc<ConnectionContext>) -> Result<(), Error> {
        let _ = stream.set_nodelay(true);
        let Some(acceptor) = &self.tls else {
            return http1::serve_connection(&context, stream, connection).await;
        };

        let destroy = connection.destroy_token();
        let stream = tokio::select! {
            biased;

            _ = destroy.cancelled() => return Ok(()),
            accepted = acceptor.accept(stream) => accepted?,
        };
        let negotiated_h2 = stream.get_ref().1.alpn_protocol() == Some(&b"h2"[..]);
        if negotiated_h2 {
            http2::serve_session(context, stream, connection).await
        } else {
            http1::serve_connection(&context, stream, connection).await
        }
    }

    async fn stop(self: &Arc<Self>, reason: StopReason) -> StopReason {
        let previous = {
            let mut status = self.status.lock();
            match *status {
                ServerStatus::Starting | ServerStatus::Opened => {
                    let previous = *status;
                    *status = ServerStatus::Stopping;
                    Some(previous)
                }
                ServerStatus::Stopping | ServerStatus::Stopped => None,
            }
        };
        let Some(previous) = previous else {
            return self.wait_stopped().await;
        };
        self.logger.info(format_args!("stopping server: {reason}"));

        let subscription = self.signal_subscription.lock().take();
        drop(subscription);
        let registration = self.external_registration.lock().take();
        if let Some(registration) = registration {
            registration.unregister();
        }

        self.server_source.cancel(reason.clone());
        if previous == ServerStatus::Starting {
            self.listener_source.cancel(reason.clone());
        }

        let cleanups = std::mem::take(&mut *self.cleanups.lock());
        let mut running = JoinSet::new();
        for cleanup in cleanups {
            running.spawn(cleanup(reason.clone()));
        }
        while let Some(finished) = running.join_next().await {
            if let Err(e) = finished {
                self.logger.error(format_args!("cleanup failed: {e}"));
            }
        }

        if previous == ServerStatus::Starting {
            let mut starting = self.starting.subscribe();
            let _ = starting.wait_for(|starting| !*starting).await;
        }
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.stop().await;
        }

        *self.status.lock() = ServerStatus::Stopped;
        self.stopped.send_replace(Some(reason.clone()));
        if let Some(callback) = &self.hooks.stopped_callback {
            callback(&reason);
        }
        self.logger.info(format_args!("server stopped"));
        reason
    }

    async fn wait_stopped(&self) -> StopReason {
        let mut stopped = self.stopped.subscribe();
        let reason = stopped
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|reason| (*reason).clone());
        reason.unwrap_or_default()
    }
}

/// Scheme, host and port clients reach `addr` at. Wildcard addresses are
/// reported as `localhost`.
pub fn origin_for(protocol: Protocol, addr: SocketAddr) -> String {
    let host = match addr.ip() {
        ip if ip.is_unspecified() => "localhost".to_string(),
        IpAddr::V6(ip) => format!("[{ip}]"),
        IpAddr::V4(ip) => ip.to_string(),
    };
    format!("{}://{host}:{}", protocol.scheme(), addr.port())
}

/// A server waiting to be started.
///
/// ```no_run
/// use microserve::server::{handler_fn, Response, Server, ServerConfig, StatusCode};
///
/// # async fn run() -> Result<(), microserve::server::Error> {
/// let handler = handler_fn(|_request| async { Ok(Some(Response::text(StatusCode::OK, "ok"))) });
/// let server = Server::new(ServerConfig::default(), handler).start().await?;
/// println!("listening on {}", server.origin());
/// server.stopped().await;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: ServerConfig,
    hooks: ServerHooks,
    handler: RequestHandler,
    cancellation_token: Option<CancellationToken>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: RequestHandler) -> Self {
        Self {
            config,
            hooks: ServerHooks::default(),
            handler,
            cancellation_token: None,
        }
    }

    pub fn with_hooks(mut self, hooks: ServerHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Stop the server when `token` is cancelled, with the token's reason.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    /// Validate the configuration, bind and start serving.
    ///
    /// Fails with [`Error::Configuration`] before anything opens, with
    /// [`Error::Bind`] when the socket cannot be bound, and with
    /// [`Error::Cancelled`] when a stop arrived while starting.
    pub async fn start(self) -> Result<ServerHandle, Error> {
        let Server {
            config,
            hooks,
            handler,
            cancellation_token,
        } = self;

        config.validate()?;
        let ip = config.ip_addr()?;
        if let Some(token) = &cancellation_token {
            token.throw_if_requested()?;
        }
        let tls = match config.protocol {
            Protocol::Secure => Some(make_tls_acceptor(&config).await?),
            Protocol::Plain => None,
        };

        let shared = ServerShared::new(config, hooks, handler, tls, cancellation_token);
        shared.wire_triggers();
        let opened = shared.open(ip).await;
        shared.starting.send_replace(false);

        match opened {
            Ok((origin, local_addr)) => {
                shared.logger.info(format_args!("server listening on {origin}"));
                if let Some(callback) = &shared.hooks.started_callback {
                    callback(&origin);
                }
                Ok(ServerHandle {
                    inner: Arc::new(HandleInner {
                        shared,
                        origin,
                        local_addr,
                    }),
                })
            }
            Err(error) => {
                shared.logger.error(format_args!("server failed to start: {error}"));
                shared
                    .stop(StopReason::requested(format!("start failed: {error}")))
                    .await;
                Err(error)
            }
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// Start a server with default hooks.
pub async fn start_server(config: ServerConfig, handler: RequestHandler) -> Result<ServerHandle, Error> {
    Server::new(config, handler).start().await
}

struct HandleInner {
    shared: Arc<ServerShared>,
    origin: String,
    local_addr: SocketAddr,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if !self.shared.config.keep_process_alive {
            self.shared
                .spawn_stop(StopReason::requested("server handle dropped"));
        }
    }
}

/// Control over a started server.
///
/// Clones share the server. With `keep_process_alive` off, dropping the last
/// clone stops it.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<HandleInner>,
}

impl ServerHandle {
    /// Scheme, host and port the server is reachable at.
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    pub fn status(&self) -> ServerStatus {
        self.inner.shared.status()
    }

    /// Cancelled as soon as the server starts stopping.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.shared.server_source.token()
    }

    /// Stop the server and wait until it stopped.
    ///
    /// Concurrent and repeated calls share the first stop; every caller gets
    /// the reason that stop ran with.
    pub async fn stop(&self, reason: impl Into<StopReason>) -> StopReason {
        self.inner.shared.stop(reason.into()).await
    }

    /// Wait until the server stopped, however the stop was triggered.
    pub async fn stopped(&self) -> StopReason {
        self.inner.shared.wait_stopped().await
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("origin", &self.inner.origin)
            .field("status", &self.status())
            .finish()
    }
}
