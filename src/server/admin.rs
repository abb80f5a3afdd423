use crate::metrics::Metrics;
use crate::proxy::context::{full_body, BoxBody};
use crate::upstream::BackendRegistry;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use hyper::{Request, Response};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<BackendRegistry>,
    pub metrics: Option<Metrics>,
}

#[derive(Serialize)]
struct BackendView<'a> {
    address: &'a str,
    healthy: bool,
    /// RFC 3339, `null` if never checked.
    last_checked: Option<String>,
}

pub fn handle_admin<B>(
    req: Request<B>,
    state: AdminState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let resp = match req.uri().path() {
        "/health" | "/healthz" => json(StatusCode::OK, r#"{"status":"ok"}"#.to_string()),

        "/ready" | "/readyz" => {
            let total = state.registry.count();
            let healthy = state.registry.healthy_count();
            let (status, label) = if healthy > 0 {
                (StatusCode::OK, "ready")
            } else {
                (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
            };
            json(
                status,
                format!(
                    r#"{{"status":"{}","backends":{},"healthy_backends":{}}}"#,
                    label, total, healthy
                ),
            )
        }

        "/backends" => {
            let snapshot = state.registry.snapshot();
            let views: Vec<BackendView<'_>> = snapshot
                .iter()
                .map(|b| BackendView {
                    address: b.address(),
                    healthy: b.is_healthy(),
                    last_checked: b
                        .last_checked()
                        .map(|t| humantime::format_rfc3339_millis(t).to_string()),
                })
                .collect();
            json(
                StatusCode::OK,
                serde_json::to_string_pretty(&views).unwrap_or_default(),
            )
        }

        "/metrics" => match &state.metrics {
            Some(m) => {
                let mut resp = Response::new(full_body(m.render()));
                resp.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
                );
                resp
            }
            None => json(StatusCode::NOT_FOUND, r#"{"error":"metrics disabled"}"#.to_string()),
        },

        _ => json(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#.to_string()),
    };
    Ok(resp)
}

fn json(status: StatusCode, body: String) -> Response<BoxBody> {
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn state(addrs: &[&str]) -> AdminState {
        let registry = Arc::new(BackendRegistry::new());
        let urls: Vec<String> = addrs.iter().map(|s| s.to_string()).collect();
        registry.replace(&urls);
        AdminState {
            registry,
            metrics: None,
        }
    }

    fn get(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    async fn body_string(resp: Response<BoxBody>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let resp = handle_admin(get("/healthz"), state(&[])).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_readyz_tracks_healthy_backends() {
        let s = state(&["http://a:1"]);
        let resp = handle_admin(get("/readyz"), s.clone()).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        s.registry.snapshot()[0].set_healthy(false);
        let resp = handle_admin(get("/readyz"), s).unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_string(resp).await.contains(r#""healthy_backends":0"#));
    }

    #[tokio::test]
    async fn test_backends_lists_members() {
        let s = state(&["http://a:1", "http://b:1"]);
        s.registry.snapshot()[1].set_healthy(false);

        let resp = handle_admin(get("/backends"), s).unwrap();
        let v: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        let list = v.as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["address"], "http://a:1");
        assert_eq!(list[0]["healthy"], true);
        assert!(list[0]["last_checked"].is_null());
        assert_eq!(list[1]["healthy"], false);
        assert!(list[1]["last_checked"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn test_metrics_and_unknown_path() {
        let resp = handle_admin(get("/metrics"), state(&[])).unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let mut s = state(&[]);
        s.metrics = Some(Metrics::detached().unwrap());
        let resp = handle_admin(get("/metrics"), s).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = handle_admin(get("/nope"), state(&[])).unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
