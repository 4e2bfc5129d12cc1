//! Shared helpers for integration tests.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::Request;
use axum::response::IntoResponse;
use axum::{Json, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;

use gantry::apidef::ApiDescriptor;
use gantry::middleware::{GatewayRequest, GatewayResponse};

/// Start an upstream that echoes method and path as JSON.
pub async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = Router::new().fallback(echo);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

async fn echo(req: Request<Body>) -> impl IntoResponse {
    Json(serde_json::json!({
        "method": req.method().as_str(),
        "path": req.uri().path(),
        "query": req.uri().query(),
        "authorization": req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok()),
    }))
}

/// A minimal keyless HTTP descriptor.
pub fn keyless_api(api_id: &str, listen_path: &str, target: &str) -> ApiDescriptor {
    let mut api = ApiDescriptor::default();
    api.api_id = api_id.into();
    api.name = format!("{api_id} api");
    api.org_id = "org1".into();
    api.active = true;
    api.auth.use_keyless = true;
    api.proxy.listen_path = listen_path.into();
    api.proxy.target_url = target.into();
    api.version_data.not_versioned = true;
    api
}

/// Same shape, but requiring token auth.
pub fn protected_api(api_id: &str, listen_path: &str, target: &str) -> ApiDescriptor {
    let mut api = keyless_api(api_id, listen_path, target);
    api.auth.use_keyless = false;
    api.auth.use_standard_auth = true;
    api
}

/// Build a request addressed to the gateway.
pub fn request(method: &str, host: &str, path_and_query: &str) -> GatewayRequest {
    axum::http::Request::builder()
        .method(method)
        .uri(format!("http://{host}{path_and_query}"))
        .header("host", host)
        .body(Body::empty())
        .unwrap()
}

/// Collect a response body as JSON.
pub async fn body_json(resp: GatewayResponse) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Collect a response body as text.
pub async fn body_text(resp: GatewayResponse) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
