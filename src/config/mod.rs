pub mod models;
pub mod validation;

pub use models::{ServerConfig, TlsConfig};
pub use validation::{ServerConfigValidator, ValidationError};
