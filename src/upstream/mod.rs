pub mod backend;
pub mod health;
pub mod registry;
pub mod round_robin;

pub use backend::Backend;
pub use health::{build_health_check_client, run_health_check_loop, run_health_checks};
pub use registry::{BackendList, BackendRegistry};
pub use round_robin::RoundRobinSelector;
