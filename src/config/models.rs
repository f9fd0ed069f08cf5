//! Configuration data structures for Axle.
//!
//! These types are assembled from CLI flags and environment overrides by
//! the binary and validated before the listener is bound. They stay
//! serde-friendly so embedders can build them from any source.
use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Top-level server configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// The address to listen on
    pub listen_addr: String,
    /// Upstream base URL; when set, every request is forwarded there
    pub upstream: Option<String>,
    /// Optional TLS configuration for the inbound listener
    pub tls: Option<TlsConfig>,
    /// How long in-flight requests may finish after shutdown begins
    pub shutdown_grace_period: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            upstream: None,
            tls: None,
            shutdown_grace_period: Duration::from_secs(60),
        }
    }
}

/// TLS certificate/key file paths for the inbound listener.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TlsConfig {
    /// PEM file with the certificate chain
    pub cert_path: PathBuf,
    /// PEM file with the PKCS#8 private key
    pub key_path: PathBuf,
}
