use super::{ServiceWatcher, SnapshotHandler, WatcherState};
use crate::error::BalancerError;
use parking_lot::Mutex;
use tracing::info;

/// Fixed membership, delivered once on start.
pub struct StaticServiceWatcher {
    backends: Vec<String>,
    state: Mutex<WatcherState>,
}

impl StaticServiceWatcher {
    pub fn new(backends: Vec<String>) -> Self {
        Self {
            backends,
            state: Mutex::new(WatcherState::NotStarted),
        }
    }
}

impl ServiceWatcher for StaticServiceWatcher {
    fn start(&self, service_name: &str, on_snapshot: SnapshotHandler) -> Result<(), BalancerError> {
        let mut state = self.state.lock();
        if *state != WatcherState::NotStarted {
            return Err(BalancerError::WatcherAlreadyStarted);
        }
        *state = WatcherState::Running;
        info!(
            "discovery: static: delivering backend list, service={}, count={}",
            service_name,
            self.backends.len()
        );
        on_snapshot(self.backends.clone());
        Ok(())
    }

    fn stop(&self) -> Result<(), BalancerError> {
        let mut state = self.state.lock();
        if *state != WatcherState::Running {
            return Err(BalancerError::WatcherNotStarted);
        }
        *state = WatcherState::Stopped;
        Ok(())
    }
}
