pub mod admin;
pub mod bootstrap;
pub mod lifecycle;
pub mod runtime;

pub use admin::AdminState;
pub use lifecycle::{LifecycleController, Phase};

use crate::config::ServerConfig;
use crate::error::BalancerError;
use crate::proxy::{self, ProxyState};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::io;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Run the proxy listener until `shutdown` is cancelled, then drain.
///
/// Draining stops accepting, lets in-flight requests finish and closes idle
/// keep-alive connections. Connections still open after `shutdown_grace` are
/// aborted and reported as `ShutdownTimeout`. An accept error that is neither
/// per-connection nor resource exhaustion ends the server with `Err`.
pub async fn run_proxy_server(
    listener: TcpListener,
    state: ProxyState,
    config: ServerConfig,
    shutdown: CancellationToken,
) -> Result<(), BalancerError> {
    let local = listener
        .local_addr()
        .map_err(|e| BalancerError::ListenerBind(e.to_string()))?;
    info!("server: proxy listening, addr={}", local);

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .keep_alive(true)
        .timer(TokioTimer::new())
        .header_read_timeout(config.read_timeout());
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(Some(Duration::from_secs(20)));

    let idle_timeout = config.idle_timeout();
    // Cancelled by `shutdown`, or locally when the listener fails.
    let close_conns = shutdown.child_token();
    let mut conns = JoinSet::new();
    // Atomic counter for reading active connection count (metrics crate gauges are write-only).
    let active_conns = Arc::new(AtomicI64::new(0));

    let accept_result = loop {
        // Reap finished connection tasks.
        while conns.try_join_next().is_some() {}

        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.cancelled() => {
                info!("server: proxy: stop accepting new connections, draining...");
                break Ok(());
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!("lb_connections_total", "status" => "accepted").increment(1);
                v
            }
            Err(e) => {
                metrics::counter!("lb_connections_total", "status" => "error").increment(1);
                match AcceptError::classify(&e) {
                    AcceptError::Connection => {
                        debug!("server: proxy: accept failed, error={}", e);
                        continue;
                    }
                    AcceptError::Exhausted => {
                        error!(
                            "server: proxy: accept failed, backing off {:?}, error={}",
                            ACCEPT_BACKOFF, e
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                            _ = shutdown.cancelled() => break Ok(()),
                        }
                    }
                    AcceptError::Fatal => {
                        error!("server: proxy: listener failed, error={}", e);
                        break Err(BalancerError::Internal(format!("proxy listener: {}", e)));
                    }
                }
            }
        };

        metrics::gauge!("lb_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let activity = Arc::new(ConnActivity::new());
        let svc = {
            let state = state.clone();
            let activity = activity.clone();
            service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                let busy = activity.begin();
                async move {
                    let resp = proxy::handle_request(req, state, peer_addr).await;
                    drop(busy);
                    resp
                }
            })
        };

        let conn = builder
            .serve_connection_with_upgrades(TokioIo::new(stream), svc)
            .into_owned();
        let close = close_conns.clone();
        let active_conns = active_conns.clone();

        conns.spawn(async move {
            let mut conn = std::pin::pin!(conn);
            let mut closing = false;
            let result = loop {
                tokio::select! {
                    res = conn.as_mut() => break res,
                    _ = close.cancelled(), if !closing => {
                        closing = true;
                        conn.as_mut().graceful_shutdown();
                    }
                    _ = activity.idle(idle_timeout), if !closing => {
                        debug!("server: proxy: closing idle connection, peer={}", peer_addr);
                        closing = true;
                        conn.as_mut().graceful_shutdown();
                    }
                }
            };
            if let Err(e) = result {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: proxy: connection error, peer={}, error={}",
                        peer_addr, e
                    );
                }
            }
            metrics::gauge!("lb_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    };

    drop(listener);
    close_conns.cancel();

    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!(
            "server: proxy: waiting for {} active connections to drain",
            active
        );
    }

    let grace = config.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        while conns.join_next().await.is_some() {}
    })
    .await;

    match drained {
        Ok(()) => {
            info!("server: proxy: all connections drained");
            accept_result
        }
        Err(_) => {
            let remaining = active_conns.load(Ordering::Relaxed).max(0) as usize;
            warn!(
                "server: proxy: drain timeout ({:?}), {} connections still active",
                grace, remaining
            );
            conns.shutdown().await;
            accept_result.and(Err(BalancerError::ShutdownTimeout(remaining)))
        }
    }
}

/// Pause after the process runs out of descriptors or buffers.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, PartialEq, Eq)]
enum AcceptError {
    /// The peer went away before the accept completed.
    Connection,
    /// Out of descriptors or kernel memory; clears as connections close.
    Exhausted,
    Fatal,
}

impl AcceptError {
    fn classify(e: &io::Error) -> Self {
        use io::ErrorKind::*;
        match e.kind() {
            ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock
            | TimedOut => AcceptError::Connection,
            OutOfMemory => AcceptError::Exhausted,
            _ => classify_os(e).unwrap_or(AcceptError::Fatal),
        }
    }
}

/// accept(2) also reports network errors of the pending connection; those
/// are per-connection like `ECONNABORTED`.
#[cfg(unix)]
fn classify_os(e: &io::Error) -> Option<AcceptError> {
    match e.raw_os_error()? {
        libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => Some(AcceptError::Exhausted),
        libc::EPROTO
        | libc::EPERM
        | libc::ENETDOWN
        | libc::ENETUNREACH
        | libc::EHOSTDOWN
        | libc::EHOSTUNREACH
        | libc::ENOPROTOOPT
        | libc::EOPNOTSUPP => Some(AcceptError::Connection),
        _ => None,
    }
}

#[cfg(not(unix))]
fn classify_os(_: &io::Error) -> Option<AcceptError> {
    None
}

/// Request activity on one downstream connection, for the idle timer.
struct ConnActivity {
    born: Instant,
    last_ms: AtomicU64,
    in_flight: AtomicUsize,
}

/// Marks a request in progress until dropped.
struct Busy(Arc<ConnActivity>);

impl Drop for Busy {
    fn drop(&mut self) {
        self.0.touch();
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConnActivity {
    fn new() -> Self {
        Self {
            born: Instant::now(),
            last_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn begin(self: &Arc<Self>) -> Busy {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.touch();
        Busy(self.clone())
    }

    fn touch(&self) {
        let ms = self.born.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Release);
    }

    /// Resolves once no request has been active for `timeout`.
    async fn idle(&self, timeout: Duration) {
        loop {
            let last = self.born + Duration::from_millis(self.last_ms.load(Ordering::Acquire));
            let deadline = last + timeout;
            if Instant::now() >= deadline && self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            let wake = if Instant::now() >= deadline {
                // A request is still running; look again one timeout later.
                Instant::now() + timeout
            } else {
                deadline
            };
            tokio::time::sleep_until(wake.into()).await;
        }
    }
}

/// Serve health, readiness, membership and metrics until `shutdown` fires.
pub async fn run_admin_server(
    listener: TcpListener,
    state: AdminState,
    shutdown: CancellationToken,
) -> Result<(), BalancerError> {
    let local = listener
        .local_addr()
        .map_err(|e| BalancerError::ListenerBind(e.to_string()))?;
    info!("server: admin listening, addr={}", local);

    let mut conns = JoinSet::new();

    loop {
        while conns.try_join_next().is_some() {}

        let (stream, _) = tokio::select! {
            result = listener.accept() => match result {
                Ok(v) => v,
                Err(e) => {
                    error!("server: admin: accept failed, error={}", e);
                    if AcceptError::classify(&e) != AcceptError::Connection {
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };
        let state = state.clone();

        conns.spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }

    conns.shutdown().await;
    info!("server: admin stopped");
    Ok(())
}
