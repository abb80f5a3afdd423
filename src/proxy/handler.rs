use crate::error::BalancerError;
use crate::proxy::context::{BoxBody, RequestContext};
use crate::proxy::state::{PassHost, ProxyState};
use http::header::{CONNECTION, HOST, TRANSFER_ENCODING};
use http::uri::Authority;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, warn};

/// Forward one request to the next healthy backend.
///
/// 1. SELECT:   round-robin over healthy members, 503 when none
/// 2. REWRITE:  target URI, forwarded headers, hop-by-hop removal, Host policy
/// 3. UPSTREAM: stream the request, wait up to `write_timeout` for the head
/// 4. LOG:      metrics and access log
///
/// Upstream failures never touch the backend's health flag; only the active
/// checker does.
pub async fn handle_request(
    req: Request<Incoming>,
    state: ProxyState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(Authority::as_str))
        .unwrap_or("")
        .to_string();
    let uri_path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();

    let mut ctx = RequestContext::new(host, uri_path, method, peer_addr.ip());

    let backend = match state.selector.next() {
        Ok(b) => b,
        Err(e) => {
            metrics::counter!("lb_no_backend_total").increment(1);
            warn!("proxy: {}, path={}", e, ctx.uri_path);
            return Ok(ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, "no backends available"));
        }
    };
    ctx.upstream_addr.push_str(backend.address());

    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let target = match backend.target_uri(path_and_query) {
        Ok(uri) => uri,
        Err(e) => {
            warn!(
                "proxy: failed to build upstream uri, upstream={}, error={}",
                ctx.upstream_addr, e
            );
            return Ok(ctx.error_response(StatusCode::BAD_GATEWAY, "bad gateway"));
        }
    };

    let mut headers = parts.headers;
    remove_hop_headers(&mut headers);
    inject_forwarded_headers(&mut headers, peer_addr, &ctx.host);
    apply_host_header(&mut headers, state.pass_host, backend.authority());

    let mut upstream_req = Request::new(body.boxed());
    *upstream_req.method_mut() = parts.method;
    *upstream_req.uri_mut() = target;
    *upstream_req.headers_mut() = headers;

    ctx.upstream_start = Some(Instant::now());
    let result = tokio::time::timeout(state.write_timeout, state.client.request(upstream_req)).await;

    match result {
        Ok(Ok(resp)) => {
            let final_resp = build_downstream_response(resp);
            let status = final_resp.status().as_u16();
            debug!(
                "proxy: upstream responded, upstream={}, status={}",
                ctx.upstream_addr, status
            );
            ctx.finalize_metrics(status);
            ctx.log_access(status);
            Ok(final_resp)
        }
        Ok(Err(e)) => {
            metrics::counter!("lb_upstream_errors_total", "reason" => "io").increment(1);
            Ok(bad_gateway(&ctx, BalancerError::UpstreamIo(e.to_string())))
        }
        Err(_) => {
            metrics::counter!("lb_upstream_errors_total", "reason" => "timeout").increment(1);
            let err = BalancerError::UpstreamIo(format!(
                "no response head within {:?}",
                state.write_timeout
            ));
            Ok(bad_gateway(&ctx, err))
        }
    }
}

fn bad_gateway(ctx: &RequestContext, err: BalancerError) -> Response<BoxBody> {
    warn!("proxy: {}, upstream={}", err, ctx.upstream_addr);
    ctx.error_response(StatusCode::BAD_GATEWAY, "bad gateway")
}

fn apply_host_header(headers: &mut HeaderMap, pass_host: PassHost, authority: &Authority) {
    match pass_host {
        PassHost::Node => {
            if let Ok(v) = HeaderValue::from_str(authority.as_str()) {
                headers.insert(HOST, v);
            }
        }
        PassHost::Pass => {}
    }
}

fn build_downstream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (mut parts, body) = upstream_resp.into_parts();
    remove_hop_headers(&mut parts.headers);
    Response::from_parts(parts, body.boxed())
}

/// Strip hop-by-hop headers, including any named in `Connection`.
fn remove_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for h in &listed {
        headers.remove(h);
    }

    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("proxy-connection"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailer"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// Inject standard `X-Forwarded-*` and `X-Real-IP` headers so backends can
/// identify the original client and protocol.
///
/// - `X-Forwarded-For`: the peer IP is appended to any existing list.
/// - `X-Forwarded-Proto`: an incoming value is kept, otherwise `http`. TLS is
///   terminated in front of the balancer if at all.
/// - `X-Forwarded-Host`: the inbound `Host`.
/// - `X-Real-IP`: always the immediate peer.
fn inject_forwarded_headers(headers: &mut HeaderMap, peer_addr: SocketAddr, original_host: &str) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = peer_addr.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + peer_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(&peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}
