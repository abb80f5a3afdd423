pub mod client;
pub mod consul;
pub mod static_list;

use crate::error::BalancerError;
use std::sync::Arc;

pub use client::{ConsulClient, ConsulServiceNode, HealthQueryResult};
pub use consul::ConsulServiceWatcher;
pub use static_list::StaticServiceWatcher;

/// Receives every membership snapshot a watcher produces, in delivery order.
pub type SnapshotHandler = Arc<dyn Fn(Vec<String>) + Send + Sync>;

/// Source of backend membership.
///
/// Implementations call the handler serially from a single producer. Once
/// `stop` has returned the handler is never invoked again. A watcher is
/// single-use: `start` after `stop` fails with `WatcherAlreadyStarted`.
pub trait ServiceWatcher: Send + Sync {
    fn start(&self, service_name: &str, on_snapshot: SnapshotHandler) -> Result<(), BalancerError>;

    fn stop(&self) -> Result<(), BalancerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatcherState {
    NotStarted,
    Running,
    Stopped,
}
