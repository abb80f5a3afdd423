use crate::config::ServerConfig;
use crate::proxy::context::BoxBody;
use crate::upstream::RoundRobinSelector;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;

pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

/// How the `Host` header reaches the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassHost {
    /// Forward the client's `Host` unchanged.
    #[default]
    Pass,
    /// Rewrite `Host` to the selected backend's authority.
    Node,
}

impl PassHost {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pass" => Some(PassHost::Pass),
            "node" => Some(PassHost::Node),
            _ => None,
        }
    }
}

/// Everything a request handler needs; cheap to clone per connection.
#[derive(Clone)]
pub struct ProxyState {
    pub selector: Arc<RoundRobinSelector>,
    pub client: UpstreamClient,
    pub pass_host: PassHost,
    /// Deadline for the upstream response head.
    pub write_timeout: Duration,
}

impl ProxyState {
    pub fn new(selector: Arc<RoundRobinSelector>, server: &ServerConfig) -> Self {
        Self {
            selector,
            client: build_upstream_client(server.idle_timeout(), server.read_timeout()),
            pass_host: PassHost::parse(&server.pass_host).unwrap_or_default(),
            write_timeout: server.write_timeout(),
        }
    }
}

/// Pooled client for both `http://` and `https://` backends (rustls, webpki
/// roots). HTTP/2 is only negotiated over TLS via ALPN.
pub fn build_upstream_client(idle_timeout: Duration, connect_timeout: Duration) -> UpstreamClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(idle_timeout));
    http.set_connect_timeout(Some(connect_timeout));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(idle_timeout)
        .build(https)
}
