use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request bookkeeping for metrics and the access log.
pub struct RequestContext {
    pub host: String,
    pub uri_path: String,
    pub method: String,
    pub upstream_addr: String,
    pub client_ip: IpAddr,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl RequestContext {
    pub fn new(host: String, uri_path: String, method: String, client_ip: IpAddr) -> Self {
        Self {
            host,
            uri_path,
            method,
            upstream_addr: String::new(),
            client_ip,
            start: Instant::now(),
            upstream_start: None,
        }
    }

    /// Plain-text error response produced by the balancer itself.
    pub fn error_response(&self, status: StatusCode, msg: &'static str) -> hyper::Response<BoxBody> {
        self.finalize_metrics(status.as_u16());
        self.log_access(status.as_u16());

        let mut resp = hyper::Response::new(full_body(msg));
        *resp.status_mut() = status;
        resp.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        resp
    }

    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "lb_http_requests_total",
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "lb_http_request_duration_seconds",
            "method" => self.method.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "lb_upstream_request_duration_seconds",
                "upstream" => self.upstream_addr.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }
    }

    /// Structured access log, one line per request at info level.
    pub fn log_access(&self, status: u16) {
        let total_ms = self.start.elapsed().as_millis();
        let upstream_ms = self
            .upstream_start
            .map(|s| s.elapsed().as_millis())
            .unwrap_or(0);

        tracing::info!(
            client_ip = %self.client_ip,
            method = %self.method,
            host = %self.host,
            path = %self.uri_path,
            status = status,
            upstream = %self.upstream_addr,
            latency_ms = %total_ms,
            upstream_ms = %upstream_ms,
            "access"
        );
    }
}
