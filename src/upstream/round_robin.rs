use super::backend::Backend;
use super::registry::BackendRegistry;
use crate::error::BalancerError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Unweighted round-robin over the healthy members of a registry.
///
/// The cursor is global and never reset: when the healthy set changes size,
/// the next pick is simply `cursor % new_len`.
pub struct RoundRobinSelector {
    registry: Arc<BackendRegistry>,
    cursor: AtomicU64,
}

impl RoundRobinSelector {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            cursor: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn next(&self) -> Result<Arc<Backend>, BalancerError> {
        let snapshot = self.registry.snapshot();
        let healthy: Vec<&Arc<Backend>> = snapshot.iter().filter(|b| b.is_healthy()).collect();

        if healthy.is_empty() {
            debug!(
                "selector: no healthy backend, total_backends={}",
                snapshot.len()
            );
            return Err(BalancerError::NoBackendsAvailable);
        }

        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        let idx = (n % healthy.len() as u64) as usize;
        let chosen = healthy[idx];
        debug!(
            "selector: selected backend={}, cursor={}, index={}",
            chosen.address(),
            n,
            idx
        );
        Ok(Arc::clone(chosen))
    }

    /// Number of selections made so far.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }
}
