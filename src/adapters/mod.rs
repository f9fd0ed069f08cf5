pub mod http_client;
pub mod http_handler;
pub mod middleware;

/// Re-export commonly used types from adapters
pub use http_client::UpstreamClient;
pub use http_handler::{AppHandler, build_router};
pub use middleware::*;
