use std::fmt;

#[derive(Debug)]
pub enum BalancerError {
    InvalidBackendAddress(String),
    NoBackendsAvailable,
    UpstreamIo(String),
    RegistryTransient(String),
    WatcherAlreadyStarted,
    WatcherNotStarted,
    ListenerBind(String),
    /// Grace period elapsed with this many connections still open.
    ShutdownTimeout(usize),
    Config(String),
    Internal(String),
}

impl fmt::Display for BalancerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancerError::InvalidBackendAddress(addr) => {
                write!(f, "invalid backend address: {}", addr)
            }
            BalancerError::NoBackendsAvailable => write!(f, "no backends available"),
            BalancerError::UpstreamIo(msg) => write!(f, "upstream io error: {}", msg),
            BalancerError::RegistryTransient(msg) => write!(f, "registry error: {}", msg),
            BalancerError::WatcherAlreadyStarted => write!(f, "service watcher already started"),
            BalancerError::WatcherNotStarted => write!(f, "service watcher not started"),
            BalancerError::ListenerBind(msg) => write!(f, "listener bind failed: {}", msg),
            BalancerError::ShutdownTimeout(remaining) => write!(
                f,
                "shutdown grace period elapsed with {} connections still active",
                remaining
            ),
            BalancerError::Config(msg) => write!(f, "config error: {}", msg),
            BalancerError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for BalancerError {}

impl From<reqwest::Error> for BalancerError {
    fn from(e: reqwest::Error) -> Self {
        BalancerError::RegistryTransient(e.to_string())
    }
}
