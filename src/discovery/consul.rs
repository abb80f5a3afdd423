use super::client::{ConsulClient, ConsulServiceNode};
use super::{ServiceWatcher, SnapshotHandler, WatcherState};
use crate::config::ConsulConfig;
use crate::error::BalancerError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables for one watch loop, resolved from `ConsulConfig`.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub wait: Duration,
    pub retry_backoff: Duration,
    pub scheme: String,
    pub address_aliases: HashMap<String, String>,
}

impl From<&ConsulConfig> for WatchOptions {
    fn from(cfg: &ConsulConfig) -> Self {
        Self {
            wait: cfg.wait(),
            retry_backoff: cfg.retry_backoff(),
            scheme: cfg.scheme.clone(),
            address_aliases: cfg.address_aliases.clone(),
        }
    }
}

/// Long-polls Consul's health endpoint and delivers the passing instances.
pub struct ConsulServiceWatcher {
    client: ConsulClient,
    options: Arc<WatchOptions>,
    state: Arc<Mutex<WatcherState>>,
    cancel: CancellationToken,
}

impl ConsulServiceWatcher {
    pub fn new(client: ConsulClient, options: WatchOptions) -> Self {
        Self {
            client,
            options: Arc::new(options),
            state: Arc::new(Mutex::new(WatcherState::NotStarted)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(cfg: &ConsulConfig) -> Result<Self, BalancerError> {
        let client = ConsulClient::new(
            &cfg.address,
            cfg.token.clone(),
            cfg.datacenter.clone(),
            cfg.wait(),
        )?;
        Ok(Self::new(client, WatchOptions::from(cfg)))
    }
}

impl ServiceWatcher for ConsulServiceWatcher {
    fn start(&self, service_name: &str, on_snapshot: SnapshotHandler) -> Result<(), BalancerError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BalancerError::Internal(format!("consul watcher needs a runtime: {}", e)))?;

        let mut state = self.state.lock();
        if *state != WatcherState::NotStarted {
            return Err(BalancerError::WatcherAlreadyStarted);
        }
        *state = WatcherState::Running;

        info!(
            "discovery: consul: watch started, service={}, consul={}",
            service_name,
            self.client.base_url()
        );

        runtime.spawn(watch_loop(
            self.client.clone(),
            service_name.to_string(),
            self.options.clone(),
            self.state.clone(),
            self.cancel.clone(),
            on_snapshot,
        ));
        Ok(())
    }

    fn stop(&self) -> Result<(), BalancerError> {
        let mut state = self.state.lock();
        if *state != WatcherState::Running {
            return Err(BalancerError::WatcherNotStarted);
        }
        *state = WatcherState::Stopped;
        self.cancel.cancel();
        info!("discovery: consul: watch stopped");
        Ok(())
    }
}

async fn watch_loop(
    client: ConsulClient,
    service_name: String,
    options: Arc<WatchOptions>,
    state: Arc<Mutex<WatcherState>>,
    cancel: CancellationToken,
    on_snapshot: SnapshotHandler,
) {
    let mut index = 0u64;

    loop {
        let result = tokio::select! {
            r = client.query_healthy_service(&service_name, index, options.wait) => r,
            _ = cancel.cancelled() => return,
        };

        match result {
            Ok(res) => {
                index = next_index(index, res.last_index);
                let snapshot = build_snapshot(&res.nodes, &options);
                debug!(
                    "discovery: consul: query returned, service={}, instances={}, index={}",
                    service_name,
                    snapshot.len(),
                    index
                );

                {
                    let state = state.lock();
                    if *state != WatcherState::Running {
                        return;
                    }
                    on_snapshot(snapshot);
                }
                metrics::counter!("lb_consul_poll_total", "result" => "success").increment(1);

                // Without an index Consul answers immediately; pace the loop.
                if res.last_index == 0 && sleep_or_cancel(options.retry_backoff, &cancel).await {
                    return;
                }
            }
            Err(e) => {
                metrics::counter!("lb_consul_poll_total", "result" => "error").increment(1);
                warn!(
                    "discovery: consul: query failed, retrying, service={}, backoff={:?}, error={}",
                    service_name, options.retry_backoff, e
                );
                if sleep_or_cancel(options.retry_backoff, &cancel).await {
                    return;
                }
            }
        }
    }
}

/// Returns `true` if cancelled before `duration` elapsed.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancel.cancelled() => true,
    }
}

/// An index that moves backwards means Consul's state was reset; start over.
fn next_index(current: u64, returned: u64) -> u64 {
    if returned < current {
        0
    } else {
        returned
    }
}

fn build_snapshot(nodes: &[ConsulServiceNode], options: &WatchOptions) -> Vec<String> {
    nodes
        .iter()
        .map(|n| {
            let url = instance_url(&options.scheme, &n.address, n.port, &options.address_aliases);
            debug!("discovery: consul: instance, id={}, url={}", n.service_id, url);
            url
        })
        .collect()
}

fn instance_url(
    scheme: &str,
    address: &str,
    port: u16,
    aliases: &HashMap<String, String>,
) -> String {
    let host = aliases.get(address).map(String::as_str).unwrap_or(address);
    if host.contains(':') && !host.starts_with('[') {
        format!("{}://[{}]:{}", scheme, host, port)
    } else {
        format!("{}://{}:{}", scheme, host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aliases() -> HashMap<String, String> {
        HashMap::from([("host.docker.internal".to_string(), "localhost".to_string())])
    }

    fn options() -> WatchOptions {
        WatchOptions {
            wait: Duration::from_secs(1),
            retry_backoff: Duration::from_millis(50),
            scheme: "http".into(),
            address_aliases: aliases(),
        }
    }

    fn unreachable_watcher() -> ConsulServiceWatcher {
        // Port 9 (discard) on loopback; nothing answers, so the loop only retries.
        let client =
            ConsulClient::new("http://127.0.0.1:9", None, None, Duration::from_secs(1)).unwrap();
        ConsulServiceWatcher::new(client, options())
    }

    fn noop_handler() -> SnapshotHandler {
        Arc::new(|_: Vec<String>| {})
    }

    #[test]
    fn test_next_index() {
        assert_eq!(next_index(0, 0), 0);
        assert_eq!(next_index(0, 42), 42);
        assert_eq!(next_index(42, 42), 42);
        assert_eq!(next_index(42, 50), 50);
        assert_eq!(next_index(50, 7), 0);
    }

    #[test]
    fn test_instance_url_alias_whole_host_only() {
        let a = aliases();
        assert_eq!(
            instance_url("http", "host.docker.internal", 8081, &a),
            "http://localhost:8081"
        );
        assert_eq!(
            instance_url("http", "my.host.docker.internal", 8081, &a),
            "http://my.host.docker.internal:8081"
        );
        assert_eq!(instance_url("https", "10.0.0.5", 443, &a), "https://10.0.0.5:443");
    }

    #[test]
    fn test_instance_url_ipv6() {
        assert_eq!(
            instance_url("http", "::1", 8080, &HashMap::new()),
            "http://[::1]:8080"
        );
    }

    #[test]
    fn test_build_snapshot_keeps_registry_order() {
        let nodes = vec![
            ConsulServiceNode {
                service_id: "b".into(),
                address: "10.0.0.2".into(),
                port: 80,
            },
            ConsulServiceNode {
                service_id: "a".into(),
                address: "host.docker.internal".into(),
                port: 81,
            },
        ];
        assert_eq!(
            build_snapshot(&nodes, &options()),
            vec!["http://10.0.0.2:80", "http://localhost:81"]
        );
    }

    #[test]
    fn test_stop_before_start() {
        let w = unreachable_watcher();
        assert!(matches!(w.stop(), Err(BalancerError::WatcherNotStarted)));
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let w = unreachable_watcher();
        assert!(matches!(
            w.start("backend", noop_handler()),
            Err(BalancerError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_state_machine() {
        let w = unreachable_watcher();
        w.start("backend", noop_handler()).unwrap();
        assert!(matches!(
            w.start("backend", noop_handler()),
            Err(BalancerError::WatcherAlreadyStarted)
        ));
        w.stop().unwrap();
        assert!(matches!(w.stop(), Err(BalancerError::WatcherNotStarted)));
        assert!(matches!(
            w.start("backend", noop_handler()),
            Err(BalancerError::WatcherAlreadyStarted)
        ));
    }
}
