pub mod types;


pub use types::*;

use crate::upstream::Backend;
use anyhow::Result;
use std::path::Path;

/// Comma-separated backend URLs; selects static membership.
pub const BACKEND_SERVERS_ENV: &str = "BACKEND_SERVERS";

impl BalancerConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults are
    /// used so the balancer starts with zero configuration for local development.
    ///
    /// Not validated here: command-line overrides still apply on top, so the
    /// caller runs `validate()` once everything is merged.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: BalancerConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            BalancerConfig::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());

        let mode = if config.discovery.is_static() {
            "static"
        } else {
            "consul"
        };
        tracing::info!(
            listen = %config.server.listen,
            mode = mode,
            service = %config.discovery.service_name,
            "loaded balancer configuration"
        );
        Ok(config)
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production
    /// and a map in tests.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup(BACKEND_SERVERS_ENV) {
            self.discovery.backends = parse_backend_list(&v);
        }
        if let Some(v) = lookup("SWITCHYARD_DISCOVERY_MODE") {
            self.discovery.mode = Some(v);
        }
        if let Some(v) = lookup("SWITCHYARD_SERVICE_NAME") {
            self.discovery.service_name = v;
        }

        // Consul
        if let Some(v) = lookup("SWITCHYARD_CONSUL_ADDRESS") {
            self.consul.address = v;
        }
        if let Some(v) = lookup("SWITCHYARD_CONSUL_DATACENTER") {
            self.consul.datacenter = Some(v);
        }
        if let Some(v) = lookup("SWITCHYARD_CONSUL_TOKEN") {
            self.consul.token = Some(v);
        }
        if let Some(v) = lookup("SWITCHYARD_CONSUL_WAIT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.consul.wait_secs = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.discovery.mode.as_deref() {
            None | Some("consul") | Some("static") => {}
            Some(other) => anyhow::bail!("unknown discovery mode '{}'", other),
        }

        if self.discovery.is_static() {
            if self.discovery.backends.is_empty() {
                anyhow::bail!(
                    "static discovery requires at least one backend (set {})",
                    BACKEND_SERVERS_ENV
                );
            }
            for addr in &self.discovery.backends {
                Backend::new(addr).map_err(|e| anyhow::anyhow!("discovery.backends: {}", e))?;
            }
        } else {
            if self.discovery.service_name.is_empty() {
                anyhow::bail!("consul discovery requires a service name");
            }
            if self.consul.address.is_empty() {
                anyhow::bail!("consul discovery requires consul.address");
            }
            if self.consul.wait_secs == 0 || self.consul.wait_secs > MAX_CONSUL_WAIT_SECS {
                anyhow::bail!(
                    "consul.wait_secs must be between 1 and {}, got {}",
                    MAX_CONSUL_WAIT_SECS,
                    self.consul.wait_secs
                );
            }
        }

        let server = &self.server;
        for (name, value) in [
            ("read_timeout", server.read_timeout),
            ("write_timeout", server.write_timeout),
            ("idle_timeout", server.idle_timeout),
            ("shutdown_grace", server.shutdown_grace),
            ("health_check.active.interval", self.health_check.active.interval),
            ("health_check.active.timeout", self.health_check.active.timeout),
        ] {
            if !(value.is_finite() && value > 0.0 && value <= MAX_TIMEOUT_SECS) {
                anyhow::bail!(
                    "{} must be between 0 and {} seconds, got {}",
                    name,
                    MAX_TIMEOUT_SECS,
                    value
                );
            }
        }

        if server.pass_host != "pass" && server.pass_host != "node" {
            anyhow::bail!(
                "server.pass_host must be 'pass' or 'node', got '{}'",
                server.pass_host
            );
        }

        if self.health_check.active.concurrency == 0 {
            anyhow::bail!("health_check.active.concurrency must be at least 1");
        }

        Ok(())
    }

    /// Active health checks default on with static membership, where nothing
    /// else observes backend health.
    pub fn health_check_enabled(&self) -> bool {
        self.health_check
            .enabled
            .unwrap_or_else(|| self.discovery.is_static())
    }
}

/// Split a comma-separated backend list, dropping blanks.
pub fn parse_backend_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
