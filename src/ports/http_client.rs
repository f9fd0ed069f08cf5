use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for upstream exchanges
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when the connection to the upstream fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when the outbound request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for upstream exchanges
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Negotiation policy for a single upstream exchange.
///
/// Upgrade requests need one persistent point-to-point connection, so
/// multiplexed-stream negotiation must be off for them. Both policies are
/// pre-built per client instance; selection happens per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPolicy {
    /// Pinned to HTTP/1.1; ALPN never offers h2.
    PinnedHttp11,
    /// Default capability; ALPN may negotiate h2.
    Negotiated,
}

/// HttpClient defines the port (interface) for sending requests upstream
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send a request to the upstream over the given transport policy.
    ///
    /// The response body is streamed, not buffered, and 101 responses keep
    /// their upgrade extension so the caller can take over the connection.
    async fn send_request(
        &self,
        req: Request<AxumBody>,
        policy: TransportPolicy,
    ) -> HttpClientResult<Response<AxumBody>>;
}
