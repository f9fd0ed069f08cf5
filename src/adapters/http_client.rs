use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, header};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult, TransportPolicy};

/// Upstream HTTP client adapter using Hyper with Rustls.
///
/// Two clients are built up front, one per [`TransportPolicy`]:
/// * a pinned client whose connector only advertises `http/1.1`, so ALPN
///   can never negotiate a multiplexed stream, as required for protocol
///   upgrades, which own their connection end to end
/// * a negotiated client left at default capability (HTTP/1.1 + HTTP/2)
///
/// Both are configured explicitly rather than derived from a shared
/// default, so each transport's negotiation policy is visible here.
pub struct UpstreamClient {
    pinned_http11: Client<HttpsConnector<HttpConnector>, AxumBody>,
    negotiated: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl UpstreamClient {
    /// Create a new upstream client adapter.
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::info!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let pinned_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config.clone())
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector.clone());

        let negotiated_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_all_versions()
            .wrap_connector(http_connector);

        let pinned_http11 =
            Client::builder(TokioExecutor::new()).build::<_, AxumBody>(pinned_connector);
        let negotiated =
            Client::builder(TokioExecutor::new()).build::<_, AxumBody>(negotiated_connector);

        tracing::info!("Created upstream clients (pinned HTTP/1.1 and negotiated)");
        Ok(Self {
            pinned_http11,
            negotiated,
        })
    }
}

#[async_trait::async_trait]
impl HttpClient for UpstreamClient {
    async fn send_request(
        &self,
        req: Request<AxumBody>,
        policy: TransportPolicy,
    ) -> HttpClientResult<Response<AxumBody>> {
        let client = match policy {
            TransportPolicy::PinnedHttp11 => &self.pinned_http11,
            TransportPolicy::Negotiated => &self.negotiated,
        };

        if req.uri().host().is_none() {
            tracing::error!("Outgoing URI has no host: {}", req.uri());
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        }

        let method_for_error_log = req.method().clone();
        let uri_for_error_log = req.uri().clone();

        match client.request(req).await {
            Ok(response) => {
                // Convert the Hyper response body back to an Axum body.
                // Transfer-Encoding is dropped because the body is decoded
                // while streaming and the server re-frames it.
                let (mut parts, hyper_body) = response.into_parts();
                parts.headers.remove(header::TRANSFER_ENCODING);
                let axum_body = AxumBody::new(hyper_body);

                Ok(Response::from_parts(parts, axum_body))
            }
            Err(e) => {
                tracing::error!(
                    "Error making request to upstream ({} {}): {}",
                    method_for_error_log,
                    uri_for_error_log,
                    e
                );
                Err(HttpClientError::ConnectionError(format!(
                    "Request to {method_for_error_log} {uri_for_error_log} failed: {e}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upstream_client_creation() {
        let client = UpstreamClient::new();
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_relative_uri_is_rejected() {
        let client = UpstreamClient::new().unwrap();
        let req = Request::builder()
            .uri("/no-host")
            .body(AxumBody::empty())
            .unwrap();

        let result = client
            .send_request(req, TransportPolicy::Negotiated)
            .await;
        assert!(matches!(result, Err(HttpClientError::InvalidRequest(_))));
    }
}
