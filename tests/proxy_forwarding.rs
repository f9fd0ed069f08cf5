// End-to-end forwarding against a real upstream listener.
use std::{net::SocketAddr, sync::Arc};

use axle::{
    adapters::{AppHandler, build_router},
    core::Forwarder,
    ports::http_client::HttpClient,
};
use axum::{Json, Router, body::Body, extract::ConnectInfo, routing::any};
use http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt; // for oneshot

/// Upstream that reflects what it received back as JSON.
async fn spawn_upstream() -> SocketAddr {
    async fn echo(req: Request<Body>) -> Json<Value> {
        let (parts, body) = req.into_parts();
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let forwarded_for = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();

        Json(json!({
            "method": parts.method.to_string(),
            "uri": parts.uri.to_string(),
            "host": host,
            "x_forwarded_for": forwarded_for,
            "body": String::from_utf8_lossy(&body),
        }))
    }

    let app = Router::new()
        .route("/", any(echo))
        .route("/{*path}", any(echo));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn relay_to(upstream: &str) -> Router {
    let client: Arc<dyn HttpClient> =
        Arc::new(axle::adapters::UpstreamClient::new().unwrap());
    let forwarder = Forwarder::new(upstream, client, false).unwrap();
    build_router(AppHandler::Forward(Arc::new(forwarder)))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn forwards_request_and_relays_response() {
    let upstream = spawn_upstream().await;
    let relay = relay_to(&format!("http://{upstream}"));

    let response = relay
        .oneshot(
            Request::builder()
                .uri("/hello/world?q=1")
                .header(header::HOST, "front.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let echoed = body_json(response).await;
    assert_eq!(echoed["method"], "GET");
    assert_eq!(echoed["uri"], "/hello/world?q=1");
    // the upstream sees the inbound hostname, not its own
    assert_eq!(echoed["host"], "front.example.com");
}

#[tokio::test(flavor = "multi_thread")]
async fn request_body_streams_through() {
    let upstream = spawn_upstream().await;
    let relay = relay_to(&format!("http://{upstream}"));

    let response = relay
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/ingest")
                .header(header::HOST, "front.example.com")
                .body(Body::from("hello upstream"))
                .unwrap(),
        )
        .await
        .unwrap();

    let echoed = body_json(response).await;
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["body"], "hello upstream");
}

#[tokio::test(flavor = "multi_thread")]
async fn forwarding_chain_grows_by_one_hop() {
    let upstream = spawn_upstream().await;
    let relay = relay_to(&format!("http://{upstream}"));

    let mut req = Request::builder()
        .uri("/")
        .header(header::HOST, "front.example.com")
        .header("x-forwarded-for", "203.0.113.7")
        .body(Body::empty())
        .unwrap();
    req.extensions_mut().insert(ConnectInfo(
        "10.1.2.3:40000".parse::<SocketAddr>().unwrap(),
    ));

    let response = relay.oneshot(req).await.unwrap();
    let echoed = body_json(response).await;
    assert_eq!(echoed["x_forwarded_for"], "203.0.113.7, 10.1.2.3");
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_upstream_answers_bad_gateway() {
    // bind then drop, so the port refuses connections
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let relay = relay_to(&format!("http://{dead}"));
    let response = relay
        .oneshot(
            Request::builder()
                .uri("/")
                .header(header::HOST, "front.example.com")
                .header(header::ACCEPT, "application/json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert!(
        body["error"]
            .as_str()
            .unwrap()
            .contains("upstream request failed")
    );
}
