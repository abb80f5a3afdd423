use super::backend::Backend;
use super::registry::BackendRegistry;
use crate::config::ActiveHealthCheck;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Run a single round of active health checks across the current members.
///
/// The caller is responsible for looping / scheduling.
pub async fn run_health_checks(
    registry: &BackendRegistry,
    client: &reqwest::Client,
    active: &ActiveHealthCheck,
) {
    let members = registry.snapshot();
    if members.is_empty() {
        return;
    }

    stream::iter(members.iter().cloned())
        .map(|backend| {
            let client = client.clone();
            async move {
                check_one_backend(&client, &backend, active).await;
            }
        })
        .buffer_unordered(active.concurrency.max(1))
        .collect::<()>()
        .await;

    metrics::gauge!("lb_backends", "state" => "healthy").set(registry.healthy_count() as f64);
}

/// Poll every `interval` until `shutdown` is cancelled.
pub async fn run_health_check_loop(
    registry: Arc<BackendRegistry>,
    active: ActiveHealthCheck,
    shutdown: CancellationToken,
) {
    let client = match build_health_check_client(active.timeout()) {
        Ok(c) => c,
        Err(e) => {
            warn!("health: failed to build client, checks disabled, error={}", e);
            return;
        }
    };
    info!(
        "health: active checks started, path={}, interval={:?}",
        active.path,
        active.interval()
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(active.interval()) => {}
            _ = shutdown.cancelled() => {
                debug!("health: active checks stopped");
                return;
            }
        }
        run_health_checks(&registry, &client, &active).await;
    }
}

/// Build a shared HTTP client for health checks.
pub fn build_health_check_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .no_proxy()
        .build()
}

async fn check_one_backend(client: &reqwest::Client, backend: &Backend, active: &ActiveHealthCheck) {
    let url = backend.health_url(&active.path);

    let healthy = match client.get(&url).send().await {
        Ok(resp) => resp.status() == reqwest::StatusCode::OK,
        Err(_) => false,
    };

    let was_healthy = backend.set_healthy(healthy);
    metrics::counter!(
        "lb_health_check_total",
        "result" => if healthy { "healthy" } else { "unhealthy" },
    )
    .increment(1);

    if was_healthy != healthy {
        if healthy {
            info!("health: backend recovered, backend={}", backend.address());
        } else {
            warn!("health: backend marked unhealthy, backend={}", backend.address());
        }
    }
    debug!(
        "health: check finished, backend={}, healthy={}",
        backend.address(),
        healthy
    );
}
