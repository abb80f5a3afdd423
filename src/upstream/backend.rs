use crate::error::BalancerError;
use http::uri::{Authority, Scheme};
use http::Uri;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A single backend: immutable target address plus mutable health state.
///
/// Descriptors are shared (`Arc<Backend>`) between registry snapshots and
/// in-flight requests. Only the atomics change after construction.
#[derive(Debug)]
pub struct Backend {
    /// Original base URL, as delivered by the watcher.
    address: String,
    scheme: Scheme,
    authority: Authority,
    /// Path prefix of the base URL without a trailing slash ("" for none).
    base_path: String,
    healthy: AtomicBool,
    /// Unix millis of the last health observation, 0 = never.
    last_checked_ms: AtomicU64,
}

impl Backend {
    /// Parse an absolute `http://` or `https://` base URL.
    pub fn new(address: &str) -> Result<Self, BalancerError> {
        let invalid = || BalancerError::InvalidBackendAddress(address.to_string());

        let uri: Uri = address.trim().parse().map_err(|_| invalid())?;
        let scheme = uri.scheme().cloned().ok_or_else(invalid)?;
        if scheme != Scheme::HTTP && scheme != Scheme::HTTPS {
            return Err(invalid());
        }
        let authority = uri.authority().cloned().ok_or_else(invalid)?;
        if authority.host().is_empty() {
            return Err(invalid());
        }
        if uri.query().is_some() {
            return Err(invalid());
        }

        let base_path = uri.path().trim_end_matches('/').to_string();

        Ok(Self {
            address: address.trim().to_string(),
            scheme,
            authority,
            base_path,
            healthy: AtomicBool::new(true),
            last_checked_ms: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Record a health observation. Returns the previous flag.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_checked_ms.store(now, Ordering::Relaxed);
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    pub fn last_checked(&self) -> Option<SystemTime> {
        match self.last_checked_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }

    /// Build the upstream URI for a request path-and-query, joining the
    /// backend's path prefix with exactly one slash.
    pub fn target_uri(&self, path_and_query: &str) -> Result<Uri, http::Error> {
        let mut pq = String::with_capacity(self.base_path.len() + path_and_query.len() + 1);
        pq.push_str(&self.base_path);
        if !path_and_query.starts_with('/') {
            pq.push('/');
        }
        pq.push_str(path_and_query);

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(pq)
            .build()
    }

    /// URL of the health endpoint for this backend.
    pub fn health_url(&self, path: &str) -> String {
        let mut url = String::with_capacity(self.address.len() + path.len());
        url.push_str(self.scheme.as_str());
        url.push_str("://");
        url.push_str(self.authority.as_str());
        url.push_str(&self.base_path);
        if !path.starts_with('/') {
            url.push('/');
        }
        url.push_str(path);
        url
    }
}
