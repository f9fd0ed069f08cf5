use std::net::SocketAddr;

use url::Url;

use crate::config::models::{ServerConfig, TlsConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types. All of them are fatal configuration errors:
/// the server fails closed before accepting any connection.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid upstream URL '{url}': {reason}")]
    InvalidUpstream { url: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        Self::validate_listen_address(&config.listen_addr)?;

        if let Some(upstream) = &config.upstream {
            Self::validate_upstream(upstream)?;
        }

        if let Some(tls) = &config.tls {
            Self::validate_tls_config(tls)?;
        }

        Ok(())
    }

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        address
            .parse::<SocketAddr>()
            .map(|_| ())
            .map_err(|err| ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: err.to_string(),
            })
    }

    fn validate_upstream(upstream: &str) -> ValidationResult<()> {
        let invalid = |reason: String| ValidationError::InvalidUpstream {
            url: upstream.to_string(),
            reason,
        };

        let url = Url::parse(upstream).map_err(|err| invalid(err.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(invalid(format!("unsupported scheme '{other}'"))),
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }
        Ok(())
    }

    fn validate_tls_config(tls: &TlsConfig) -> ValidationResult<()> {
        if !tls.cert_path.is_file() {
            return Err(ValidationError::InvalidTls {
                message: format!("certificate file not found: {}", tls.cert_path.display()),
            });
        }
        if !tls.key_path.is_file() {
            return Err(ValidationError::InvalidTls {
                message: format!("key file not found: {}", tls.key_path.display()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(ServerConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn bad_listen_address_is_rejected() {
        let config = ServerConfig {
            listen_addr: "not-an-address".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            ServerConfigValidator::validate(&config),
            Err(ValidationError::InvalidListenAddress { .. })
        ));
    }

    #[test]
    fn upstream_must_be_http_or_https() {
        let config = ServerConfig {
            upstream: Some("ftp://files.example.com".to_string()),
            ..ServerConfig::default()
        };
        assert!(matches!(
            ServerConfigValidator::validate(&config),
            Err(ValidationError::InvalidUpstream { .. })
        ));

        let config = ServerConfig {
            upstream: Some("http://backend:9000".to_string()),
            ..ServerConfig::default()
        };
        assert!(ServerConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn tls_paths_must_exist() {
        let cert = tempfile::NamedTempFile::new().unwrap();
        let config = ServerConfig {
            tls: Some(TlsConfig {
                cert_path: cert.path().to_path_buf(),
                key_path: "/definitely/not/here.pem".into(),
            }),
            ..ServerConfig::default()
        };
        assert!(matches!(
            ServerConfigValidator::validate(&config),
            Err(ValidationError::InvalidTls { .. })
        ));

        let key = tempfile::NamedTempFile::new().unwrap();
        let config = ServerConfig {
            tls: Some(TlsConfig {
                cert_path: cert.path().to_path_buf(),
                key_path: key.path().to_path_buf(),
            }),
            ..ServerConfig::default()
        };
        assert!(ServerConfigValidator::validate(&config).is_ok());
    }
}
