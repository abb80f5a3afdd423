use super::admin::AdminState;
use crate::config::BalancerConfig;
use crate::discovery::{ServiceWatcher, SnapshotHandler};
use crate::error::BalancerError;
use crate::metrics::Metrics;
use crate::proxy::ProxyState;
use crate::upstream::{self, BackendRegistry, RoundRobinSelector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Running,
    Draining,
    Stopped,
}

/// Owns the listener, the watcher and the shared registry for one run.
///
/// Startup order: watcher → signal waiter → health checks / admin → Running.
/// On shutdown the watcher is stopped first, then the listener drains for at
/// most `server.shutdown_grace`, then background tasks are cancelled.
pub struct LifecycleController {
    config: BalancerConfig,
    watcher: Arc<dyn ServiceWatcher>,
    registry: Arc<BackendRegistry>,
    selector: Arc<RoundRobinSelector>,
    metrics: Option<Metrics>,
    phase: watch::Sender<Phase>,
    started: AtomicBool,
}

impl LifecycleController {
    pub fn new(config: BalancerConfig, watcher: Arc<dyn ServiceWatcher>) -> Self {
        let registry = Arc::new(BackendRegistry::new());
        let selector = Arc::new(RoundRobinSelector::new(registry.clone()));
        let (phase, _) = watch::channel(Phase::Initializing);
        Self {
            config,
            watcher,
            registry,
            selector,
            metrics: None,
            phase,
            started: AtomicBool::new(false),
        }
    }

    /// Expose `/metrics` on the admin server through this handle.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn selector(&self) -> &Arc<RoundRobinSelector> {
        &self.selector
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Bind the configured listen address and run until shutdown.
    pub async fn start(&self, parent: CancellationToken) -> Result<(), BalancerError> {
        let listen = self.config.server.listen.clone();
        let listener = match TcpListener::bind(&listen).await {
            Ok(l) => l,
            Err(e) => {
                self.phase.send_replace(Phase::Stopped);
                return Err(BalancerError::ListenerBind(format!("{}: {}", listen, e)));
            }
        };
        self.start_with_listener(listener, parent).await
    }

    /// Run on an already-bound listener until a signal arrives, `parent` is
    /// cancelled, or the listener fails.
    pub async fn start_with_listener(
        &self,
        listener: TcpListener,
        parent: CancellationToken,
    ) -> Result<(), BalancerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(BalancerError::Internal("controller already started".into()));
        }

        match self.run(listener, parent).await {
            Ok(()) => {
                info!("server: shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("server: stopped with error, error={}", e);
                Err(e)
            }
        }
    }

    async fn run(&self, listener: TcpListener, parent: CancellationToken) -> Result<(), BalancerError> {
        let service_name = self.config.discovery.service_name.clone();
        let registry = self.registry.clone();
        let on_snapshot: SnapshotHandler = Arc::new(move |snapshot: Vec<String>| {
            registry.replace(&snapshot);
        });

        if let Err(e) = self.watcher.start(&service_name, on_snapshot) {
            self.phase.send_replace(Phase::Stopped);
            return Err(e);
        }

        let shutdown = parent.child_token();
        let signals = match ShutdownSignals::install() {
            Ok(s) => s,
            Err(e) => {
                self.stop_watcher();
                self.phase.send_replace(Phase::Stopped);
                return Err(e);
            }
        };

        let background = CancellationToken::new();
        let mut tasks = JoinSet::new();

        tasks.spawn(signals.wait(shutdown.clone()));

        if self.config.health_check_enabled() {
            tasks.spawn(upstream::run_health_check_loop(
                self.registry.clone(),
                self.config.health_check.active.clone(),
                background.clone(),
            ));
        } else {
            info!("health: active checks disabled");
        }

        if let Err(e) = self.spawn_admin(&mut tasks, &background).await {
            self.stop_watcher();
            shutdown.cancel();
            background.cancel();
            while tasks.join_next().await.is_some() {}
            self.phase.send_replace(Phase::Stopped);
            return Err(e);
        }

        let state = ProxyState::new(self.selector.clone(), &self.config.server);
        let drain = CancellationToken::new();
        let mut server = tokio::spawn(super::run_proxy_server(
            listener,
            state,
            self.config.server.clone(),
            drain.clone(),
        ));

        self.phase.send_replace(Phase::Running);
        info!(
            "server: balancer running, service={}, backends={}",
            service_name,
            self.registry.count()
        );

        let early = tokio::select! {
            res = &mut server => Some(res),
            _ = shutdown.cancelled() => None,
        };

        self.phase.send_replace(Phase::Draining);
        self.stop_watcher();
        drain.cancel();

        let served = match early {
            Some(res) => res,
            None => server.await,
        };
        let result = served
            .map_err(|e| BalancerError::Internal(format!("proxy task failed: {}", e)))
            .and_then(|r| r);

        shutdown.cancel();
        background.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("server: background task failed, error={}", e);
            }
        }

        self.phase.send_replace(Phase::Stopped);
        result
    }

    async fn spawn_admin(
        &self,
        tasks: &mut JoinSet<()>,
        background: &CancellationToken,
    ) -> Result<(), BalancerError> {
        let listen = self.config.admin.listen.trim();
        if listen.is_empty() {
            info!("server: admin disabled");
            return Ok(());
        }

        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| BalancerError::ListenerBind(format!("{}: {}", listen, e)))?;
        let state = AdminState {
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
        };
        let token = background.clone();
        tasks.spawn(async move {
            if let Err(e) = super::run_admin_server(listener, state, token).await {
                error!("server: admin failed, error={}", e);
            }
        });
        Ok(())
    }

    fn stop_watcher(&self) {
        if let Err(e) = self.watcher.stop() {
            warn!("discovery: stop failed, error={}", e);
        }
    }
}

/// SIGINT / SIGTERM streams, registered before the controller reports Running
/// so a signal sent right after that is never missed.
struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    #[cfg(unix)]
    fn install() -> Result<Self, BalancerError> {
        use tokio::signal::unix::{signal, SignalKind};
        let to_err = |e: std::io::Error| BalancerError::Internal(format!("signal handler: {}", e));
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).map_err(to_err)?,
            terminate: signal(SignalKind::terminate()).map_err(to_err)?,
        })
    }

    #[cfg(not(unix))]
    fn install() -> Result<Self, BalancerError> {
        Ok(Self {})
    }

    /// Resolve on the first signal or on `shutdown`, then cancel `shutdown`.
    #[cfg(unix)]
    async fn wait(mut self, shutdown: CancellationToken) {
        tokio::select! {
            _ = self.interrupt.recv() => info!("server: received SIGINT, shutting down"),
            _ = self.terminate.recv() => info!("server: received SIGTERM, shutting down"),
            _ = shutdown.cancelled() => info!("server: shutdown requested"),
        }
        shutdown.cancel();
    }

    #[cfg(not(unix))]
    async fn wait(self, shutdown: CancellationToken) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("server: received ctrl-c, shutting down"),
            _ = shutdown.cancelled() => info!("server: shutdown requested"),
        }
        shutdown.cancel();
    }
}
