use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Deserialize a `T` that implements `Default`, treating JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Longest accepted timeout or interval, in seconds.
pub const MAX_TIMEOUT_SECS: f64 = 86_400.0;

/// Consul caps blocking queries at ten minutes.
pub const MAX_CONSUL_WAIT_SECS: u64 = 600;

/// Seconds to `Duration`, clamped to `[0, MAX_TIMEOUT_SECS]`.
fn secs(value: f64) -> Duration {
    if value.is_nan() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(value.clamp(0.0, MAX_TIMEOUT_SECS))
}

/// Top-level load balancer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalancerConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub consul: ConsulConfig,

    /// Active `/healthz` polling, on by default in static mode only.
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Seconds allowed for a client to send request headers.
    #[serde(default = "default_rw_timeout")]
    pub read_timeout: f64,

    /// Seconds allowed for the upstream to produce a response head.
    #[serde(default = "default_rw_timeout")]
    pub write_timeout: f64,

    /// Seconds a client keep-alive connection may sit between requests before
    /// the proxy closes it. Also bounds idle pooled upstream connections.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: f64,

    /// Seconds in-flight connections get to finish after shutdown starts.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: f64,

    /// "pass": forward the client's Host header. "node": rewrite to the backend authority.
    #[serde(default = "default_pass_host")]
    pub pass_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            read_timeout: default_rw_timeout(),
            write_timeout: default_rw_timeout(),
            idle_timeout: default_idle_timeout(),
            shutdown_grace: default_shutdown_grace(),
            pass_host: default_pass_host(),
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        secs(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        secs(self.write_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        secs(self.idle_timeout)
    }

    pub fn shutdown_grace(&self) -> Duration {
        secs(self.shutdown_grace)
    }

    /// Replace the port of `listen`, keeping the bind host.
    pub fn set_port(&mut self, port: u16) {
        let host = match self.listen.rsplit_once(':') {
            Some((host, _)) => host.to_string(),
            None => "0.0.0.0".to_string(),
        };
        self.listen = format!("{}:{}", host, port);
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_rw_timeout() -> f64 {
    15.0
}

fn default_idle_timeout() -> f64 {
    60.0
}

fn default_shutdown_grace() -> f64 {
    5.0
}

fn default_pass_host() -> String {
    "pass".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// "consul" or "static". Unset: static when `BACKEND_SERVERS` is present.
    #[serde(default)]
    pub mode: Option<String>,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Static membership, used in static mode.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub backends: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: None,
            service_name: default_service_name(),
            backends: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn is_static(&self) -> bool {
        match self.mode.as_deref() {
            Some(mode) => mode == "static",
            None => !self.backends.is_empty(),
        }
    }
}

fn default_service_name() -> String {
    "backend".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    #[serde(default = "default_consul_addr")]
    pub address: String,

    #[serde(default)]
    pub datacenter: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    /// Blocking query wait bound (seconds).
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,

    /// Pause after a failed query before retrying with the same index.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Scheme used to build backend URLs from discovered instances.
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Whole-host rewrites applied to discovered addresses.
    #[serde(default = "default_address_aliases")]
    pub address_aliases: HashMap<String, String>,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_consul_addr(),
            datacenter: None,
            token: None,
            wait_secs: default_wait_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            scheme: default_scheme(),
            address_aliases: default_address_aliases(),
        }
    }
}

impl ConsulConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs.min(MAX_CONSUL_WAIT_SECS))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn default_consul_addr() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_wait_secs() -> u64 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_address_aliases() -> HashMap<String, String> {
    HashMap::from([("host.docker.internal".to_string(), "localhost".to_string())])
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: Option<bool>,

    #[serde(default)]
    pub active: ActiveHealthCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveHealthCheck {
    /// Seconds between probe rounds.
    #[serde(default = "default_hc_interval")]
    pub interval: f64,

    #[serde(default = "default_hc_path")]
    pub path: String,

    /// Per-probe timeout (seconds).
    #[serde(default = "default_hc_timeout")]
    pub timeout: f64,

    /// Prevents probe storms with large pools.
    #[serde(default = "default_hc_concurrency")]
    pub concurrency: usize,
}

impl Default for ActiveHealthCheck {
    fn default() -> Self {
        Self {
            interval: default_hc_interval(),
            path: default_hc_path(),
            timeout: default_hc_timeout(),
            concurrency: default_hc_concurrency(),
        }
    }
}

impl ActiveHealthCheck {
    pub fn interval(&self) -> Duration {
        secs(self.interval)
    }

    pub fn timeout(&self) -> Duration {
        secs(self.timeout)
    }
}

fn default_hc_interval() -> f64 {
    5.0
}

fn default_hc_path() -> String {
    "/healthz".to_string()
}

fn default_hc_timeout() -> f64 {
    1.0
}

fn default_hc_concurrency() -> usize {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Empty string disables the admin server.
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
        }
    }
}

fn default_admin_listen() -> String {
    "0.0.0.0:9091".to_string()
}
