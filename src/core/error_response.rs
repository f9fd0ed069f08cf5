//! Content-negotiated error bodies.
//!
//! Handlers and the forwarder report per-request failures through
//! [`error_response`]. The body shape follows the client's `Accept`
//! header: exactly `application/json` gets a JSON object, everything else
//! gets plain text. The request id is echoed for correlation when set.
use axum::body::Body;
use http::{HeaderMap, Request, Response, StatusCode, header};
use serde::Serialize;

use crate::core::request_id::RequestId;

#[derive(Serialize)]
struct ErrorBody<'a> {
    #[serde(skip_serializing_if = "String::is_empty")]
    request_id: String,
    error: &'a str,
}

/// Build an error response negotiated against the `Accept` header value.
///
/// With no message the canonical reason phrase of the status is used. The
/// JSON path falls back to a generic plain-text 500 if encoding fails; the
/// response is always written.
pub fn error_response(
    accept: Option<&str>,
    request_id: RequestId,
    status: StatusCode,
    message: Option<&str>,
) -> Response<Body> {
    let message = match message {
        Some(message) => message.to_string(),
        None => status
            .canonical_reason()
            .unwrap_or("Internal Server Error")
            .to_string(),
    };

    match accept {
        Some("application/json") => {
            let body = ErrorBody {
                request_id: request_id.to_string(),
                error: &message,
            };
            match serde_json::to_vec(&body) {
                Ok(encoded) => json_error(status, encoded),
                Err(err) => {
                    tracing::error!(err = %err, "failed to format error");
                    plain_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal Server Error".to_string(),
                    )
                }
            }
        }
        _ => {
            let mut message = message;
            if !request_id.is_zero() {
                message.push_str(" (request ID: ");
                message.push_str(&request_id.to_string());
                message.push(')');
            }
            plain_error(status, message)
        }
    }
}

/// Convenience wrapper extracting the `Accept` header and request id from
/// the request itself.
pub fn error_response_for<B>(
    req: &Request<B>,
    status: StatusCode,
    message: Option<&str>,
) -> Response<Body> {
    error_response(
        accept_header(req.headers()),
        RequestId::from_extensions(req.extensions()),
        status,
        message,
    )
}

/// The `Accept` header as a string, if present and valid UTF-8.
pub fn accept_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
}

fn json_error(status: StatusCode, encoded: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(encoded))
        .unwrap_or_else(|_| fallback_response())
}

fn plain_error(status: StatusCode, mut message: String) -> Response<Body> {
    message.push('\n');
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .body(Body::from(message))
        .unwrap_or_else(|_| fallback_response())
}

fn fallback_response() -> Response<Body> {
    let mut response = Response::new(Body::from("Internal Server Error\n"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
