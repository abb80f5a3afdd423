//! Shared fixtures: in-process backends, a scripted Consul, and a helper
//! that runs a balancer on an ephemeral port.
#![allow(dead_code)]

use bytes::Bytes;
use http::header::{HeaderName, CONTENT_TYPE};
use http::{HeaderValue, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchyard::config::BalancerConfig;
use switchyard::discovery::ServiceWatcher;
use switchyard::server::{LifecycleController, Phase};
use switchyard::BalancerError;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long `/slow` holds its response.
pub const SLOW_RESPONSE: Duration = Duration::from_millis(400);

const ECHOED_HEADERS: &[&str] = &[
    "host",
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-forwarded-host",
    "connection",
];

/// A backend that answers every path with its name, serves `/healthz`
/// according to a toggle, and echoes selected request headers back as
/// `echo-<name>` response headers.
pub struct TestBackend {
    pub name: &'static str,
    pub addr: SocketAddr,
    healthy: Arc<AtomicBool>,
    hits: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl TestBackend {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Non-health requests served so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn spawn_backend(name: &'static str) -> TestBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let healthy = Arc::new(AtomicBool::new(true));
    let hits = Arc::new(AtomicUsize::new(0));
    let shutdown = CancellationToken::new();

    let (h, c, token) = (healthy.clone(), hits.clone(), shutdown.clone());
    tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                r = listener.accept() => match r {
                    Ok((s, _)) => s,
                    Err(_) => continue,
                },
                _ = token.cancelled() => return,
            };
            let (healthy, hits) = (h.clone(), c.clone());
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    let (healthy, hits) = (healthy.clone(), hits.clone());
                    async move { Ok::<_, Infallible>(backend_response(name, req, &healthy, &hits).await) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    TestBackend {
        name,
        addr,
        healthy,
        hits,
        shutdown,
    }
}

async fn backend_response(
    name: &'static str,
    req: Request<Incoming>,
    healthy: &AtomicBool,
    hits: &AtomicUsize,
) -> Response<Full<Bytes>> {
    if req.uri().path() == "/healthz" {
        let mut resp = Response::new(Full::new(Bytes::from_static(b"ok")));
        if !healthy.load(Ordering::SeqCst) {
            *resp.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        }
        return resp;
    }

    hits.fetch_add(1, Ordering::SeqCst);
    if req.uri().path() == "/slow" {
        tokio::time::sleep(SLOW_RESPONSE).await;
    }

    let mut resp = Response::new(Full::new(Bytes::from_static(name.as_bytes())));
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    for h in ECHOED_HEADERS {
        if let Some(v) = req.headers().get(*h) {
            let echo = HeaderName::from_bytes(format!("echo-{}", h).as_bytes()).unwrap();
            headers.insert(echo, v.clone());
        }
    }
    let pq = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default();
    headers.insert("echo-path", HeaderValue::from_str(&pq).unwrap());
    resp
}

/// A port nothing listens on.
pub async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Serves `/v1/health/service/<name>` from a scripted member list, honouring
/// Consul's blocking-query contract (`index` + `wait`).
pub struct FakeConsul {
    pub addr: SocketAddr,
    state: Arc<watch::Sender<(u64, Vec<SocketAddr>)>>,
    failing: Arc<AtomicBool>,
    queries: Arc<Mutex<Vec<ConsulQuery>>>,
    shutdown: CancellationToken,
}

/// One answered query: the `index=` it carried and whether it got a 500.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsulQuery {
    pub index: u64,
    pub failed: bool,
}

impl FakeConsul {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Publish a new member list and bump the index.
    pub fn set(&self, members: &[SocketAddr]) {
        self.state.send_modify(|(index, list)| {
            *index += 1;
            *list = members.to_vec();
        });
    }

    pub fn index(&self) -> u64 {
        self.state.borrow().0
    }

    /// While set, every query is answered with 500 once its wait is over.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
        // Release blocked queries so they observe the switch.
        self.state.send_modify(|_| {});
    }

    pub fn queries(&self) -> Vec<ConsulQuery> {
        self.queries.lock().clone()
    }
}

impl Drop for FakeConsul {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn spawn_fake_consul(initial: &[SocketAddr]) -> FakeConsul {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (state, _) = watch::channel((1u64, initial.to_vec()));
    let state = Arc::new(state);
    let failing = Arc::new(AtomicBool::new(false));
    let queries: Arc<Mutex<Vec<ConsulQuery>>> = Arc::default();
    let shutdown = CancellationToken::new();

    let (tx, token) = (state.clone(), shutdown.clone());
    let (fail, log) = (failing.clone(), queries.clone());
    tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                r = listener.accept() => match r {
                    Ok((s, _)) => s,
                    Err(_) => continue,
                },
                _ = token.cancelled() => return,
            };
            let (tx, fail, log) = (tx.clone(), fail.clone(), log.clone());
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    let rx = tx.subscribe();
                    let (fail, log) = (fail.clone(), log.clone());
                    async move { Ok::<_, Infallible>(consul_response(req, rx, &fail, &log).await) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    FakeConsul {
        addr,
        state,
        failing,
        queries,
        shutdown,
    }
}

async fn consul_response(
    req: Request<Incoming>,
    mut rx: watch::Receiver<(u64, Vec<SocketAddr>)>,
    failing: &AtomicBool,
    log: &Mutex<Vec<ConsulQuery>>,
) -> Response<Full<Bytes>> {
    let mut wait_index = 0u64;
    let mut wait = Duration::from_secs(1);
    for pair in req.uri().query().unwrap_or("").split('&') {
        match pair.split_once('=') {
            Some(("index", v)) => wait_index = v.parse().unwrap_or(0),
            Some(("wait", v)) => {
                let secs = v.trim_end_matches('s').parse().unwrap_or(1);
                wait = Duration::from_secs(secs).min(Duration::from_secs(2));
            }
            _ => {}
        }
    }

    let current = rx.borrow_and_update().0;
    if wait_index != 0 && wait_index >= current {
        let _ = tokio::time::timeout(wait, rx.changed()).await;
    }

    let failed = failing.load(Ordering::SeqCst);
    log.lock().push(ConsulQuery {
        index: wait_index,
        failed,
    });
    if failed {
        let mut resp = Response::new(Full::new(Bytes::from_static(b"rpc error")));
        *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return resp;
    }

    let (index, members) = rx.borrow().clone();
    let entries: Vec<serde_json::Value> = members
        .iter()
        .map(|m| {
            serde_json::json!({
                "Node": {"Node": "node-1", "Address": "127.0.0.1"},
                "Service": {
                    "ID": format!("backend-{}", m.port()),
                    "Service": "backend",
                    "Address": m.ip().to_string(),
                    "Port": m.port(),
                    "Meta": null,
                },
                "Checks": [],
            })
        })
        .collect();

    let mut resp = Response::new(Full::new(Bytes::from(
        serde_json::to_vec(&entries).unwrap(),
    )));
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp.headers_mut()
        .insert("x-consul-index", HeaderValue::from(index));
    resp
}

/// Config for tests: loopback, no admin, no active checks, short deadlines.
pub fn base_config() -> BalancerConfig {
    let mut cfg = BalancerConfig::default();
    cfg.server.listen = "127.0.0.1:0".into();
    cfg.server.write_timeout = 2.0;
    cfg.server.shutdown_grace = 2.0;
    cfg.admin.listen = String::new();
    cfg.health_check.enabled = Some(false);
    cfg.consul.wait_secs = 1;
    cfg.consul.retry_backoff_ms = 100;
    cfg
}

pub fn static_config(backends: &[String]) -> BalancerConfig {
    let mut cfg = base_config();
    cfg.discovery.mode = Some("static".into());
    cfg.discovery.backends = backends.to_vec();
    cfg
}

pub struct RunningBalancer {
    pub addr: SocketAddr,
    pub controller: Arc<LifecycleController>,
    pub parent: CancellationToken,
    pub handle: JoinHandle<Result<(), BalancerError>>,
}

impl RunningBalancer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Cancel the parent token and wait for the controller to return.
    pub async fn stop(self) -> Result<(), BalancerError> {
        self.parent.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("controller did not stop within 5s")
            .expect("controller task panicked")
    }
}

pub async fn start_balancer(
    config: BalancerConfig,
    watcher: Arc<dyn ServiceWatcher>,
) -> RunningBalancer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let controller = Arc::new(LifecycleController::new(config, watcher));
    let mut phase = controller.subscribe_phase();
    let parent = CancellationToken::new();

    let handle = tokio::spawn({
        let controller = controller.clone();
        let parent = parent.clone();
        async move { controller.start_with_listener(listener, parent).await }
    });

    tokio::time::timeout(
        Duration::from_secs(5),
        phase.wait_for(|p| *p == Phase::Running),
    )
    .await
    .expect("balancer did not reach Running")
    .expect("phase channel closed");

    RunningBalancer {
        addr,
        controller,
        parent,
        handle,
    }
}

/// Poll `cond` every 20ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// GET `url` and return (status, body).
pub async fn get(client: &reqwest::Client, url: &str) -> (u16, String) {
    let resp = client.get(url).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.text().await.unwrap())
}
