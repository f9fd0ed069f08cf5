//! Request-scoped middleware: identity assignment and access logging.
//!
//! The request-id layer runs outermost so every later stage (and every log
//! record inside the request span) can correlate. The access-log layer
//! substitutes an observed body for the real one and emits one structured
//! record per request, after the response outcome is known and never twice.
use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    middleware::Next,
    response::Response,
};
use http::header;
use http_body::Body as _;
use tracing::Instrument;

use crate::core::{
    observer::{Completion, ObservedBody, ResponseObserver},
    request_id::RequestId,
};

/// Assign a fresh request id into the request's extensions and open the
/// request span. Generation failure is degraded, not fatal: the request
/// proceeds with the zero id.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = match RequestId::generate() {
        Ok(id) => id,
        Err(err) => {
            tracing::error!(err = %err, "failed to generate request id");
            RequestId::default()
        }
    };
    req.extensions_mut().insert(id);

    let span = tracing::info_span!("request", request_id = %id);
    next.run(req).instrument(span).await
}

/// Wrap the downstream handler with outcome observation and emit one
/// access-log record per request.
///
/// The record is emitted when the response body finishes streaming (or
/// immediately, for bodies that are already at end-of-stream). If the
/// request is canceled before the handler produced a response, the guard's
/// drop emits the 499 record instead.
pub async fn access_log_middleware(req: Request, next: Next) -> Response {
    let fields = RequestFields::from_request(&req);
    let started = Instant::now();
    let observer = ResponseObserver::new();
    let guard = LogGuard::new(fields, started, observer.clone());

    let response = next.run(req).await;

    observer.latch_status(response.status());

    let (parts, body) = response.into_parts();
    if body.is_end_stream() {
        // nothing left to stream; the outcome is already known
        guard.complete(Completion::Finished);
        return Response::from_parts(parts, body);
    }

    let body = Body::new(ObservedBody::with_completion(
        body,
        observer,
        move |completion| guard.complete(completion),
    ));
    Response::from_parts(parts, body)
}

/// Request-side fields of one access-log record, snapshotted up front.
#[derive(Debug, Clone)]
struct RequestFields {
    client: String,
    method: String,
    uri: String,
    proto: String,
    host: String,
    content_length: u64,
    request_id: RequestId,
}

impl RequestFields {
    fn from_request(req: &Request) -> Self {
        let client = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .or_else(|| req.uri().authority().map(|authority| authority.to_string()))
            .unwrap_or_default();
        let content_length = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);

        Self {
            client,
            method: req.method().to_string(),
            uri: req.uri().to_string(),
            proto: format!("{:?}", req.version()),
            host,
            content_length,
            request_id: RequestId::from_extensions(req.extensions()),
        }
    }
}

/// Client closed the connection before a response existed.
const CANCELED_STATUS: u16 = 499;

/// Emits the access-log record for one request, exactly once.
///
/// Armed before the handler runs. Emission happens through
/// [`LogGuard::complete`] on the streaming path; if the guard is dropped
/// without completing (the request future was dropped before a response
/// was produced), `Drop` emits the cancellation record.
struct LogGuard {
    fields: RequestFields,
    started: Instant,
    observer: Arc<ResponseObserver>,
    emitted: bool,
}

impl LogGuard {
    fn new(fields: RequestFields, started: Instant, observer: Arc<ResponseObserver>) -> Self {
        Self {
            fields,
            started,
            observer,
            emitted: false,
        }
    }

    fn complete(mut self, completion: Completion) {
        let code = self.observer.status().as_u16();
        match completion {
            Completion::Finished => self.emit(code, None),
            Completion::Errored => self.emit(code, Some("response body failed")),
            Completion::Aborted => self.emit(code, Some("response aborted before completion")),
        }
    }

    fn emit(&mut self, code: u16, err: Option<&str>) {
        if self.emitted {
            return;
        }
        self.emitted = true;

        let duration = self.started.elapsed();
        let bytes = self.observer.bytes_written();
        let fields = &self.fields;
        match err {
            Some(err) => {
                tracing::info!(
                    target: "access_log",
                    client = %fields.client,
                    method = %fields.method,
                    uri = %fields.uri,
                    proto = %fields.proto,
                    host = %fields.host,
                    content_length = fields.content_length,
                    request_id = %fields.request_id,
                    err,
                    code,
                    duration = ?duration,
                    bytes,
                    "access_log"
                );
            }
            None => {
                tracing::info!(
                    target: "access_log",
                    client = %fields.client,
                    method = %fields.method,
                    uri = %fields.uri,
                    proto = %fields.proto,
                    host = %fields.host,
                    content_length = fields.content_length,
                    request_id = %fields.request_id,
                    code,
                    duration = ?duration,
                    bytes,
                    "access_log"
                );
            }
        }
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        self.emit(CANCELED_STATUS, Some("request canceled"));
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode},
        middleware,
        routing::get,
    };
    use http::header;
    use http_body_util::BodyExt;
    use tower::ServiceExt; // for oneshot
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;

    #[derive(Clone, Default)]
    struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

    impl CaptureWriter {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CaptureWriter {
        type Writer = CaptureWriter;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn test_fields() -> RequestFields {
        RequestFields {
            client: "127.0.0.1:5000".to_string(),
            method: "GET".to_string(),
            uri: "/".to_string(),
            proto: "HTTP/1.1".to_string(),
            host: "localhost".to_string(),
            content_length: 0,
            request_id: RequestId::default(),
        }
    }

    fn with_captured_logs(f: impl FnOnce()) -> String {
        let capture = CaptureWriter::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        capture.contents()
    }

    #[test]
    fn dropped_guard_logs_499() {
        let out = with_captured_logs(|| {
            let observer = ResponseObserver::new();
            // a status the handler attempted is irrelevant once canceled
            observer.latch_status(StatusCode::NOT_FOUND);
            drop(LogGuard::new(test_fields(), Instant::now(), observer));
        });

        assert!(out.contains("code=499"), "got: {out}");
        assert!(out.contains("request canceled"), "got: {out}");
    }

    #[test]
    fn completed_guard_logs_latched_status_exactly_once() {
        let out = with_captured_logs(|| {
            let observer = ResponseObserver::new();
            observer.latch_status(StatusCode::CREATED);
            observer.record_write(12);
            let guard = LogGuard::new(test_fields(), Instant::now(), observer);
            guard.complete(Completion::Finished);
            // guard is consumed; its drop must not emit a second record
        });

        assert_eq!(out.matches("code=").count(), 1, "got: {out}");
        assert!(out.contains("code=201"), "got: {out}");
        assert!(out.contains("bytes=12"), "got: {out}");
    }

    #[test]
    fn aborted_body_logs_latched_status_with_error() {
        let out = with_captured_logs(|| {
            let observer = ResponseObserver::new();
            observer.latch_status(StatusCode::OK);
            let guard = LogGuard::new(test_fields(), Instant::now(), observer);
            guard.complete(Completion::Aborted);
        });

        assert!(out.contains("code=200"), "got: {out}");
        assert!(out.contains("response aborted"), "got: {out}");
    }

    fn logged_router() -> Router {
        Router::new()
            .route(
                "/",
                get(|| async {
                    axum::response::Response::builder()
                        .status(StatusCode::CREATED)
                        .body(Body::from("hello"))
                        .unwrap()
                }),
            )
            .route(
                "/id",
                get(|req: Request<Body>| async move {
                    RequestId::from_extensions(req.extensions()).to_string()
                }),
            )
            .layer(middleware::from_fn(access_log_middleware))
            .layer(middleware::from_fn(request_id_middleware))
    }

    #[tokio::test]
    async fn response_passes_through_unchanged() {
        let response = logged_router()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn handler_sees_a_nonzero_request_id() {
        let response = logged_router()
            .oneshot(
                Request::builder()
                    .uri("/id")
                    .header(header::HOST, "localhost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let id = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(id.len(), 22);
    }
}
