//! Router assembly for the relay.
//!
//! Every path goes to one handler: either the reverse-proxy forwarder
//! (when an upstream is configured) or the built-in demo handler. The
//! middleware chain is identical in both modes: request-id assignment
//! outermost, then access logging.
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, Request},
    middleware,
    response::{IntoResponse, Response},
    routing::any,
};
use http::StatusCode;
use serde::Deserialize;

use crate::{
    adapters::middleware::{access_log_middleware, request_id_middleware},
    core::{error_response::error_response_for, forwarder::Forwarder},
};

/// What the relay does with requests that reach it.
#[derive(Clone)]
pub enum AppHandler {
    /// Forward everything to the configured upstream.
    Forward(Arc<Forwarder>),
    /// Built-in demo handler, used when no upstream is configured.
    Demo,
}

/// Assemble the full middleware chain around the chosen handler.
pub fn build_router(handler: AppHandler) -> Router {
    let route = any(move |req: Request| {
        let handler = handler.clone();
        async move {
            match handler {
                AppHandler::Forward(forwarder) => forwarder.forward(req).await,
                AppHandler::Demo => demo_handler(req).await,
            }
        }
    });

    Router::new()
        .route("/", route.clone())
        .route("/{*path}", route)
        .layer(middleware::from_fn(access_log_middleware))
        .layer(middleware::from_fn(request_id_middleware))
}

#[derive(Debug, Deserialize)]
struct DemoQuery {
    duration: Option<String>,
    error: Option<String>,
}

/// Built-in handler for exercising the pipeline without an upstream.
///
/// `?duration=2s` simulates a long request; the sleep unwinds promptly
/// when the client goes away. `?error` exercises the negotiated error
/// path.
async fn demo_handler(req: Request) -> Response {
    let Query(query) = match Query::<DemoQuery>::try_from_uri(req.uri()) {
        Ok(query) => query,
        Err(err) => {
            return error_response_for(&req, StatusCode::BAD_REQUEST, Some(&err.to_string()));
        }
    };

    if let Some(duration) = &query.duration {
        match humantime::parse_duration(duration) {
            Ok(duration) => {
                tracing::info!(duration = ?duration, "process request");
                tokio::time::sleep(duration).await;
            }
            Err(err) => {
                return error_response_for(&req, StatusCode::BAD_REQUEST, Some(&err.to_string()));
            }
        }
    }

    if query.error.is_some() {
        return error_response_for(
            &req,
            StatusCode::INTERNAL_SERVER_ERROR,
            Some("this is a test error"),
        );
    }

    let body = "ok\n";
    tracing::info!(bytes = body.len(), "write ok");
    body.into_response()
}
