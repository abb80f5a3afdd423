pub mod context;
mod handler;
pub mod state;

pub use context::BoxBody;
pub use handler::handle_request;
pub use state::{build_upstream_client, PassHost, ProxyState, UpstreamClient};
