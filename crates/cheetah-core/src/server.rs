//! The edge server: accept loop, connection accounting and drain-based shutdown.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cheetah_edge::{respond, EdgeRequest, ServeHandler};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::tls::TlsIdentityProvider;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("TLS listener requested without a TLS identity provider")]
    TlsUnavailable,
    #[error("listener task exited before it started accepting")]
    NotReady,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("listener task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Fixed per-connection timeouts.
#[derive(Debug, Clone)]
pub struct ServerTimeouts {
    /// Time allowed for a client to send a complete request head.
    pub header_read: Duration,
    /// Time allowed for the TLS handshake of a fresh connection.
    pub read: Duration,
    /// Time allowed for an HTTP/2 keep-alive ping to be acknowledged.
    pub write: Duration,
    /// Interval of HTTP/2 keep-alive pings on otherwise quiet connections.
    pub idle: Duration,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            header_read: Duration::from_secs(15),
            read: Duration::from_secs(30),
            write: Duration::from_secs(60),
            idle: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind: SocketAddr,
    pub plaintext: bool,
    pub timeouts: ServerTimeouts,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 443)),
            plaintext: false,
            timeouts: ServerTimeouts::default(),
        }
    }
}

impl ServerSettings {
    pub fn on_port(port: u16, plaintext: bool) -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], port)),
            plaintext,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DrainSettings {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection closed before the deadline.
    Drained,
    /// The deadline passed; these connections were cut off.
    TimedOut { remaining: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerPhase {
    Running,
    Draining,
    Closed,
}

struct Shared {
    handler: Arc<dyn ServeHandler>,
    builder: Builder<TokioExecutor>,
    /// Used for connections accepted while draining: one request, then close.
    draining_builder: Builder<TokioExecutor>,
    connections: Arc<AtomicUsize>,
    tls_handshake: Duration,
}

/// A running edge server. Dropping it without [`EdgeServer::stop`] leaves the
/// listener task running until the runtime shuts down.
pub struct EdgeServer {
    local_addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    phase: watch::Sender<ServerPhase>,
    accept_task: JoinHandle<()>,
}

impl EdgeServer {
    /// Bind the listener and start accepting on a background task.
    ///
    /// Returns once the accept task is running, or with the bind error.
    pub async fn start(
        settings: &ServerSettings,
        handler: Arc<dyn ServeHandler>,
        tls: Option<Arc<TlsIdentityProvider>>,
    ) -> Result<Self, ServerError> {
        let acceptor = if settings.plaintext {
            None
        } else {
            Some(tls.ok_or(ServerError::TlsUnavailable)?.acceptor())
        };

        let listener = TcpListener::bind(settings.bind)
            .await
            .map_err(|source| ServerError::Bind {
                addr: settings.bind,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let mut builder = Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(settings.timeouts.header_read);
        builder
            .http2()
            .timer(TokioTimer::new())
            .keep_alive_interval(settings.timeouts.idle)
            .keep_alive_timeout(settings.timeouts.write);
        let mut draining_builder = builder.clone();
        draining_builder.http1().keep_alive(false);

        let connections = Arc::new(AtomicUsize::new(0));
        let shared = Arc::new(Shared {
            handler,
            builder,
            draining_builder,
            connections: Arc::clone(&connections),
            tls_handshake: settings.timeouts.read,
        });

        let (phase, phase_rx) = watch::channel(ServerPhase::Running);
        let (ready_tx, ready_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(listener, acceptor, shared, phase_rx, ready_tx));
        ready_rx.await.map_err(|_| ServerError::NotReady)?;

        info!(
            target: "cheetah::server",
            address = %local_addr,
            tls = !settings.plaintext,
            "edge server listening"
        );
        Ok(Self {
            local_addr,
            connections,
            phase,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn open_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Stop keep-alive reuse, wait for open connections to finish, then close the
    /// listener and cut off whatever is left.
    pub async fn stop(self, drain: DrainSettings) -> Result<DrainOutcome, ServerError> {
        let _ = self.phase.send(ServerPhase::Draining);
        let deadline = Instant::now() + drain.timeout;

        let outcome = loop {
            let open = self.open_connections();
            if open == 0 {
                break DrainOutcome::Drained;
            }
            let now = Instant::now();
            if now >= deadline {
                break DrainOutcome::TimedOut { remaining: open };
            }
            let remaining = deadline - now;
            info!(
                target: "cheetah::server",
                open,
                remaining_secs = remaining.as_secs(),
                "waiting for connections to close"
            );
            sleep(drain.interval.min(remaining)).await;
        };

        let _ = self.phase.send(ServerPhase::Closed);
        self.accept_task.await?;

        match outcome {
            DrainOutcome::Drained => info!(target: "cheetah::server", "all connections drained"),
            DrainOutcome::TimedOut { remaining } => {
                warn!(target: "cheetah::server", remaining, "drain timed out; closing remaining connections")
            }
        }
        Ok(outcome)
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    mut phase: watch::Receiver<ServerPhase>,
    ready: oneshot::Sender<()>,
) {
    let _ = ready.send(());
    loop {
        tokio::select! {
            biased;
            changed = phase.changed() => {
                if changed.is_err() || *phase.borrow() == ServerPhase::Closed {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let guard = ConnectionGuard::open(Arc::clone(&shared.connections), peer);
                    tokio::spawn(handle_stream(
                        stream,
                        peer,
                        acceptor.clone(),
                        Arc::clone(&shared),
                        phase.clone(),
                        guard,
                    ));
                }
                Err(err) => {
                    warn!(target: "cheetah::server", error = %err, "tcp accept failed");
                    sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    debug!(target: "cheetah::server", "listener closed");
}

async fn handle_stream(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    phase: watch::Receiver<ServerPhase>,
    _guard: ConnectionGuard,
) {
    let Some(acceptor) = acceptor else {
        serve_connection(stream, peer, shared, phase).await;
        return;
    };

    match timeout(shared.tls_handshake, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => serve_connection(tls, peer, shared, phase).await,
        Ok(Err(err)) => debug!(target: "cheetah::server", %peer, error = %err, "tls handshake failed"),
        Err(_) => debug!(target: "cheetah::server", %peer, "tls handshake timed out"),
    }
}

async fn serve_connection<I>(
    io: I,
    peer: SocketAddr,
    shared: Arc<Shared>,
    mut phase: watch::Receiver<ServerPhase>,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handler = Arc::clone(&shared.handler);
    let service = service_fn(move |request: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        async move {
            let (parts, _body) = request.into_parts();
            let request = EdgeRequest::from_http_parts(parts.method, &parts.uri, parts.headers, peer);
            let response = respond(handler.as_ref(), request).await;
            Ok::<_, Infallible>(response.into_hyper())
        }
    });

    let builder = match *phase.borrow_and_update() {
        ServerPhase::Running => &shared.builder,
        ServerPhase::Draining => &shared.draining_builder,
        ServerPhase::Closed => return,
    };
    let connection = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(connection);

    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(err) = result {
                    debug!(target: "cheetah::server", %peer, error = %err, "connection ended with error");
                }
                break;
            }
            changed = phase.changed() => {
                if changed.is_err() {
                    let _ = connection.as_mut().await;
                    break;
                }
                let current = *phase.borrow();
                match current {
                    ServerPhase::Running => {}
                    ServerPhase::Draining => connection.as_mut().graceful_shutdown(),
                    ServerPhase::Closed => {
                        debug!(target: "cheetah::server", %peer, "closing connection at shutdown");
                        break;
                    }
                }
            }
        }
    }
}

/// Counts a connection as open for as long as it lives.
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
    peer: SocketAddr,
}

impl ConnectionGuard {
    fn open(counter: Arc<AtomicUsize>, peer: SocketAddr) -> Self {
        let open = counter.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(target: "cheetah::server", %peer, open, "connection opened");
        Self { counter, peer }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let open = self.counter.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(target: "cheetah::server", peer = %self.peer, open, "connection closed");
    }
}
