use super::backend::Backend;
use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Immutable member list installed by one `replace` call.
pub type BackendList = Vec<Arc<Backend>>;

/// Current backend membership.
///
/// Single writer (the service watcher callback), many lock-free readers.
/// Every `replace` builds a fresh list and installs it with one pointer swap,
/// so a reader sees either the previous or the new membership, never a mix.
pub struct BackendRegistry {
    members: ArcSwap<BackendList>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self {
            members: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new membership snapshot and return the member count.
    ///
    /// Entries that fail to parse are dropped with a warning, duplicates keep
    /// their first position. Addresses already present keep their descriptor
    /// (and therefore their health state); new addresses start healthy.
    pub fn replace(&self, snapshot: &[String]) -> usize {
        let current = self.members.load();
        let existing: HashMap<&str, &Arc<Backend>> =
            current.iter().map(|b| (b.address(), b)).collect();

        let mut seen: HashSet<&str> = HashSet::with_capacity(snapshot.len());
        let mut next: BackendList = Vec::with_capacity(snapshot.len());

        for raw in snapshot {
            let addr = raw.trim();
            if !seen.insert(addr) {
                warn!("registry: duplicate backend dropped, addr={}", addr);
                continue;
            }

            if let Some(backend) = existing.get(addr) {
                next.push(Arc::clone(*backend));
                continue;
            }

            match Backend::new(addr) {
                Ok(backend) => next.push(Arc::new(backend)),
                Err(e) => warn!("registry: {}, entry dropped", e),
            }
        }

        let count = next.len();
        self.members.store(Arc::new(next));

        info!("registry: updated backend list, count={}", count);
        metrics::gauge!("lb_backends", "state" => "total").set(count as f64);
        count
    }

    /// A stable view of the current members for the duration of one selection.
    pub fn snapshot(&self) -> Arc<BackendList> {
        self.members.load_full()
    }

    pub fn count(&self) -> usize {
        self.members.load().len()
    }

    pub fn healthy_count(&self) -> usize {
        self.members.load().iter().filter(|b| b.is_healthy()).count()
    }
}
