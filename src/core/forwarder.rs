//! Single-upstream reverse-proxy forwarding.
//!
//! The forwarder rewrites each inbound request onto one configured
//! upstream and relays the response back as a streamed pass-through. Two
//! transport policies exist per instance: upgrade requests (HTTP/1.1 with
//! an `Upgrade` header) go over a connection pinned to HTTP/1.1, because
//! protocol switches need one persistent point-to-point connection;
//! everything else uses the default negotiating transport.
use std::{net::SocketAddr, sync::Arc};

use axum::{body::Body, extract::ConnectInfo};
use http::{
    HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri, Version, header,
};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use url::Url;

use crate::{
    core::{
        error_response::{accept_header, error_response},
        request_id::RequestId,
    },
    ports::http_client::{HttpClient, TransportPolicy},
};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Error constructing a [`Forwarder`]. Configuration errors fail closed:
/// the server never starts with a malformed upstream.
#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("invalid upstream URL '{url}': {reason}")]
    InvalidUpstream { url: String, reason: String },
}

/// Forwards every request to one configured upstream.
pub struct Forwarder {
    scheme: String,
    authority: String,
    /// Upstream path, used as a prefix for inbound paths.
    base_path: String,
    /// Protocol the inbound listener actually speaks, for X-Forwarded-Proto.
    forwarded_proto: &'static str,
    client: Arc<dyn HttpClient>,
}

impl Forwarder {
    pub fn new(
        upstream: &str,
        client: Arc<dyn HttpClient>,
        inbound_tls: bool,
    ) -> Result<Self, ForwarderError> {
        let invalid = |reason: String| ForwarderError::InvalidUpstream {
            url: upstream.to_string(),
            reason,
        };

        let url = Url::parse(upstream).map_err(|err| invalid(err.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(invalid(format!("unsupported scheme '{other}'"))),
        }
        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host".to_string()))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        Ok(Self {
            scheme: url.scheme().to_string(),
            authority,
            base_path: url.path().trim_end_matches('/').to_string(),
            forwarded_proto: if inbound_tls { "https" } else { "http" },
            client,
        })
    }

    /// Whether the request asks for a protocol switch.
    ///
    /// Upgrade is only supported by HTTP/1.1.
    pub fn upgrade_intent<B>(req: &Request<B>) -> bool {
        req.version() == Version::HTTP_11 && req.headers().contains_key(header::UPGRADE)
    }

    /// Forward one request and relay the upstream's answer.
    ///
    /// Failures are answered in place through the negotiated error body;
    /// they never escape to the server loop.
    pub async fn forward(&self, mut req: Request<Body>) -> Response<Body> {
        let request_id = RequestId::from_extensions(req.extensions());
        let accept = accept_header(req.headers()).map(str::to_owned);

        let upgrade = Self::upgrade_intent(&req);
        let downstream_upgrade = if upgrade {
            req.extensions_mut().remove::<OnUpgrade>()
        } else {
            None
        };
        let policy = if upgrade {
            TransportPolicy::PinnedHttp11
        } else {
            TransportPolicy::Negotiated
        };

        if let Err(err) = self.rewrite(&mut req, upgrade) {
            tracing::error!(err = %err, "failed to rewrite outbound request");
            return error_response(
                accept.as_deref(),
                request_id,
                StatusCode::INTERNAL_SERVER_ERROR,
                None,
            );
        }

        match self.client.send_request(req, policy).await {
            Ok(mut response) => {
                if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                    let Some(downstream) = downstream_upgrade else {
                        tracing::warn!("upstream switched protocols without an upgrade request");
                        return error_response(
                            accept.as_deref(),
                            request_id,
                            StatusCode::BAD_GATEWAY,
                            Some("unexpected protocol switch from upstream"),
                        );
                    };
                    let upstream = hyper::upgrade::on(&mut response);
                    tokio::spawn(tunnel(downstream, upstream));

                    // relay the 101 head; the switched connection carries
                    // the rest
                    let (parts, _) = response.into_parts();
                    return Response::from_parts(parts, Body::empty());
                }
                response
            }
            Err(err) => {
                tracing::error!(err = %err, "upstream request failed");
                error_response(
                    accept.as_deref(),
                    request_id,
                    StatusCode::BAD_GATEWAY,
                    Some(&format!("upstream request failed: {err}")),
                )
            }
        }
    }

    /// Point the request at the upstream and fix up forwarding headers.
    fn rewrite(&self, req: &mut Request<Body>, upgrade: bool) -> Result<(), RewriteError> {
        let client_addr = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);

        let inbound_host = req
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .or_else(|| req.uri().authority().map(|authority| authority.to_string()));

        let mut target = format!("{}://{}{}", self.scheme, self.authority, self.base_path);
        target.push_str(req.uri().path());
        if let Some(query) = req.uri().query() {
            target.push('?');
            target.push_str(query);
        }
        *req.uri_mut() = target.parse::<Uri>()?;

        let upgrade_value = req.headers().get(header::UPGRADE).cloned();
        strip_hop_by_hop(req.headers_mut());
        if upgrade && let Some(value) = upgrade_value {
            req.headers_mut().insert(header::UPGRADE, value);
            req.headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        }

        // Append to a received forwarding chain instead of replacing it,
        // so chained proxies stay visible. Only meaningful when the
        // inbound hop is trusted; that is a deployment concern.
        if let Some(addr) = client_addr {
            let client_ip = addr.ip().to_string();
            let chain = match req
                .headers()
                .get(&X_FORWARDED_FOR)
                .and_then(|value| value.to_str().ok())
            {
                Some(prior) if !prior.is_empty() => format!("{prior}, {client_ip}"),
                _ => client_ip,
            };
            req.headers_mut()
                .insert(X_FORWARDED_FOR, HeaderValue::from_str(&chain)?);
        }
        req.headers_mut().insert(
            X_FORWARDED_PROTO,
            HeaderValue::from_static(self.forwarded_proto),
        );
        if let Some(host) = &inbound_host {
            req.headers_mut()
                .insert(X_FORWARDED_HOST, HeaderValue::from_str(host)?);
            // virtual-hosting upstreams must see the original hostname
            req.headers_mut()
                .insert(header::HOST, HeaderValue::from_str(host)?);
        }

        *req.version_mut() = Version::HTTP_11;
        Ok(())
    }
}

#[derive(Debug, Error)]
enum RewriteError {
    #[error("invalid outbound URI: {0}")]
    Uri(#[from] http::uri::InvalidUri),
    #[error("invalid forwarding header value: {0}")]
    Header(#[from] http::header::InvalidHeaderValue),
}

/// Remove hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }

    for name in [
        header::CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-connection"),
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }
}

/// Splice the two upgraded connections together until either side closes.
async fn tunnel(downstream: OnUpgrade, upstream: OnUpgrade) {
    let upstream = match upstream.await {
        Ok(io) => io,
        Err(err) => {
            tracing::error!(err = %err, "upstream upgrade failed");
            return;
        }
    };
    let downstream = match downstream.await {
        Ok(io) => io,
        Err(err) => {
            tracing::error!(err = %err, "client upgrade failed");
            return;
        }
    };

    let mut upstream = TokioIo::new(upstream);
    let mut downstream = TokioIo::new(downstream);
    match tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await {
        Ok((from_client, from_upstream)) => {
            tracing::debug!(from_client, from_upstream, "upgrade tunnel closed");
        }
        Err(err) => {
            tracing::debug!(err = %err, "upgrade tunnel closed with error");
        }
    }
}
