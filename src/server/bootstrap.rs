use crate::config::BalancerConfig;
use crate::discovery::{ConsulServiceWatcher, ServiceWatcher, StaticServiceWatcher};
use crate::metrics::Metrics;
use crate::server::runtime::WorkerThreads;
use crate::server::LifecycleController;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`. `None` keeps the config/env value.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    pub listen: Option<String>,
    pub port: Option<u16>,
    pub admin_listen: Option<String>,
    pub service_name: Option<String>,
    pub workers: WorkerThreads,
}

impl BootstrapArgs {
    /// Command-line flags win over file and environment.
    fn apply(&self, config: &mut BalancerConfig) {
        if let Some(listen) = &self.listen {
            config.server.listen = listen.clone();
        }
        if let Some(port) = self.port {
            config.server.set_port(port);
        }
        if let Some(admin) = &self.admin_listen {
            config.admin.listen = admin.clone();
        }
        if let Some(name) = &self.service_name {
            config.discovery.service_name = name.clone();
        }
    }
}

/// Balancer lifecycle: init → configure → watch → serve → drain.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();
    tracing::info!(
        "runtime: worker threads sized, threads={}, source={}",
        args.workers.threads,
        args.workers.source
    );

    let mut config = BalancerConfig::load(&args.config_path)?;
    args.apply(&mut config);
    config.validate()?;

    let metrics = Metrics::install()?;
    let watcher = build_watcher(&config)?;

    let controller = LifecycleController::new(config, watcher).with_metrics(metrics);
    controller.start(CancellationToken::new()).await?;
    Ok(())
}

/// Static list when backends are configured (or the mode says so), Consul otherwise.
pub fn build_watcher(config: &BalancerConfig) -> Result<Arc<dyn ServiceWatcher>> {
    if config.discovery.is_static() {
        tracing::info!(
            "discovery: static membership, backends={}",
            config.discovery.backends.len()
        );
        Ok(Arc::new(StaticServiceWatcher::new(
            config.discovery.backends.clone(),
        )))
    } else {
        tracing::info!(
            "discovery: consul membership, consul={}, service={}",
            config.consul.address,
            config.discovery.service_name
        );
        Ok(Arc::new(ConsulServiceWatcher::from_config(&config.consul)?))
    }
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}
