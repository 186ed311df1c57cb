//! Non-blocking HTTP serving with graceful drain.
//!
//! [`run_server`] spawns the accept loop and the drain task and returns at
//! once. When the stop trigger fires, the accept loop returns and every open
//! connection is asked to finish its in-flight request. Connections still open
//! once the shutdown timeout has passed are aborted.

use crate::config::{BindNetwork, ServingConfig};
use crate::metrics::MetricsCollector;
use crate::server::handler::ServerHandler;
use crate::server::lifecycle::{Signal, Signaled};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// TCP keep-alive period applied to accepted connections.
pub const DEFAULT_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// Listen backlog for sockets bound from configuration.
const LISTEN_BACKLOG: i32 = 1024;

/// Pause before accepting again after the process ran out of descriptors or
/// buffer space.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Errors that can occur while setting up serving.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("no listener configured")]
    NoListener,

    #[error("bind network {network} cannot listen on {address}")]
    NetworkMismatch {
        network: BindNetwork,
        address: SocketAddr,
    },

    #[error("failed to listen on {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to read listener address: {0}")]
    LocalAddr(#[source] io::Error),
}

/// A bound listener ready to serve.
#[derive(Debug)]
pub struct ServingInfo {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ServingInfo {
    /// Wrap an already bound listener.
    pub fn from_listener(listener: TcpListener) -> Result<Self, ServeError> {
        let local_addr = listener.local_addr().map_err(ServeError::LocalAddr)?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Bind a listener from configuration.
    ///
    /// Returns `Ok(None)` when the bind port is 0, which disables serving.
    /// Must be called from within a tokio runtime.
    pub fn bind(config: &ServingConfig) -> Result<Option<Self>, ServeError> {
        if config.bind_port == 0 {
            return Ok(None);
        }

        let address = SocketAddr::new(config.bind_address, config.bind_port);
        if !config.bind_network.accepts(&address.ip()) {
            return Err(ServeError::NetworkMismatch {
                network: config.bind_network,
                address,
            });
        }

        let listener = create_listener(address, config.bind_network)
            .map_err(|source| ServeError::Bind { address, source })?;

        info!(address = %address, network = %config.bind_network, "listener bound");
        Self::from_listener(listener).map(Some)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start serving. See [`run_server`].
    pub fn serve(
        self,
        handler: Arc<ServerHandler>,
        metrics: MetricsCollector,
        shutdown_timeout: Duration,
        stop: Signaled,
    ) -> ServeHandles {
        run_server(self.listener, handler, metrics, shutdown_timeout, stop)
    }
}

fn create_listener(address: SocketAddr, network: BindNetwork) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if address.is_ipv6() {
        socket.set_only_v6(network == BindNetwork::Tcp6)?;
    }
    socket.bind(&address.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    TcpListener::from_std(socket.into())
}

/// Completion handles for a running server.
pub struct ServeHandles {
    /// Fires once every connection has finished or been aborted.
    pub drained: Signaled,
    /// Fires once the accept loop has returned.
    pub listener_stopped: Signaled,
    tasks: JoinSet<()>,
}

impl ServeHandles {
    /// Wait for both the accept loop and the drain to finish.
    ///
    /// A panic in either task is resumed on the caller.
    pub async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }
    }
}

/// Serve `handler` on `listener` until `stop` fires.
///
/// Does not block. Must be called from within a tokio runtime.
pub fn run_server(
    listener: TcpListener,
    handler: Arc<ServerHandler>,
    metrics: MetricsCollector,
    shutdown_timeout: Duration,
    stop: Signaled,
) -> ServeHandles {
    spawn_server(listener, handler, metrics, shutdown_timeout, stop)
}

/// Source of accepted connections.
trait Accept: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Accept for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

fn spawn_server<L: Accept>(
    listener: L,
    handler: Arc<ServerHandler>,
    metrics: MetricsCollector,
    shutdown_timeout: Duration,
    stop: Signaled,
) -> ServeHandles {
    let drained = Signal::new("Drained");
    let listener_stopped = Signal::new("ListenerStopped");
    let (connections_tx, connections_rx) = oneshot::channel();

    let mut tasks = JoinSet::new();
    tasks.spawn(drain(
        stop.clone(),
        connections_rx,
        shutdown_timeout,
        metrics.clone(),
        drained.clone(),
    ));
    tasks.spawn(accept_loop(
        listener,
        handler,
        metrics,
        stop,
        connections_tx,
        listener_stopped.clone(),
    ));

    ServeHandles {
        drained: drained.signaled(),
        listener_stopped: listener_stopped.signaled(),
        tasks,
    }
}

/// Accept connections until the stop trigger fires.
#[instrument(skip_all, fields(address = ?listener.local_addr().ok()))]
async fn accept_loop<L: Accept>(
    listener: L,
    handler: Arc<ServerHandler>,
    metrics: MetricsCollector,
    stop: Signaled,
    connections_tx: oneshot::Sender<JoinSet<()>>,
    listener_stopped: Signal,
) {
    let _stopped = listener_stopped.fire_on_drop();
    let mut connections = JoinSet::new();

    info!("accepting connections");

    let failure = loop {
        tokio::select! {
            biased;

            _ = stop.wait() => break None,

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, addr)) => {
                        configure_stream(&stream);
                        metrics.connection_opened();
                        connections.spawn(serve_connection(
                            stream,
                            addr,
                            Arc::clone(&handler),
                            metrics.clone(),
                            stop.clone(),
                        ));
                    }
                    Err(e) if is_connection_error(&e) => {
                        debug!(error = %e, "failed to accept connection");
                    }
                    Err(e) if is_resource_exhaustion(&e) => {
                        warn!(
                            error = %e,
                            backoff = ?ACCEPT_BACKOFF,
                            "out of resources accepting connections, backing off"
                        );
                        tokio::select! {
                            biased;

                            _ = stop.wait() => break None,
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                    Err(e) => break Some(e),
                }
            }
        }

        // Reap finished connections so the set does not grow unbounded.
        while connections.try_join_next().is_some() {}
    };

    drop(listener);
    let _ = connections_tx.send(connections);

    match failure {
        None => info!("stopped listening"),
        Some(e) if stop.is_signaled() => info!(error = %e, "stopped listening"),
        Some(e) => {
            error!(error = %e, "accept loop failed before shutdown was requested");
            panic!("stopped listening due to error: {e}");
        }
    }
}

/// Serve a single HTTP/1.1 connection, shutting it down gracefully on stop.
async fn serve_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    handler: Arc<ServerHandler>,
    metrics: MetricsCollector,
    stop: Signaled,
) {
    let _open = OpenConnection { metrics };

    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let handler = Arc::clone(&handler);
        async move { handler.handle(req).await }
    });

    let conn = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = stop.wait() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };

    match result {
        Ok(()) => debug!(client = %client_addr, "connection closed"),
        Err(e) => debug!(client = %client_addr, error = %e, "connection error"),
    }
}

/// Tracks an open connection in the metrics for as long as it lives.
struct OpenConnection {
    metrics: MetricsCollector,
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        self.metrics.connection_closed();
    }
}

/// Wait for the stop trigger, then for every connection to finish or the
/// shutdown timeout to pass.
async fn drain(
    stop: Signaled,
    connections_rx: oneshot::Receiver<JoinSet<()>>,
    shutdown_timeout: Duration,
    metrics: MetricsCollector,
    drained: Signal,
) {
    let _drained = drained.fire_on_drop();

    stop.wait().await;
    let deadline = Instant::now() + shutdown_timeout;

    let Ok(mut connections) = connections_rx.await else {
        return;
    };

    info!(
        open_connections = connections.len(),
        timeout = ?shutdown_timeout,
        "draining connections"
    );

    let finished = tokio::time::timeout_at(deadline, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if finished.is_err() {
        let remaining = connections.len();
        warn!(
            remaining,
            timeout = ?shutdown_timeout,
            "shutdown timeout elapsed, closing remaining connections"
        );
        metrics.connections_aborted(remaining as u64);
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }

    info!("connections drained");
}

fn configure_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY on client connection");
    }

    let keepalive = TcpKeepalive::new()
        .with_time(DEFAULT_KEEP_ALIVE_PERIOD)
        .with_interval(DEFAULT_KEEP_ALIVE_PERIOD);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to enable TCP keep-alive on client connection");
    }
}

/// Errors that only affect the connection being accepted.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Errors raised while the process or system is out of descriptors or
/// memory. Accepting can succeed again once connections close.
fn is_resource_exhaustion(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::OutOfMemory {
        return true;
    }

    #[cfg(unix)]
    {
        matches!(
            e.raw_os_error(),
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
        )
    }
    #[cfg(not(unix))]
    {
        false
    }
}
