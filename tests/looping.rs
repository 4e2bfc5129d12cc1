//! Internal-scheme looping end to end.

mod common;

use gantry::config::default_config;
use gantry::gateway::Gateway;
use gantry::router::Transport;

use common::{body_json, body_text, keyless_api, request, start_echo_backend};

#[tokio::test]
async fn test_internal_api_reachable_only_through_looping() {
    let upstream = start_echo_backend().await;
    let gw = Gateway::new(default_config());

    let mut inner = keyless_api("inner", "/inner", &format!("http://{upstream}"));
    inner.name = "Inner Service".into();
    inner.internal = true;

    let edge = keyless_api("edge", "/edge", "gantry://InnerService");

    gw.load_apps(vec![inner, edge]);

    let mux = gw.mux();
    assert!(
        mux.resolve(8080, Transport::Http, "gw.local", "/inner/x").is_none(),
        "internal APIs are not registered"
    );

    // The edge API's internal target resolves by canonical looping name.
    let handler = mux
        .resolve(8080, Transport::Http, "gw.local", "/edge/hello")
        .unwrap();
    let resp = handler.serve(request("GET", "gw.local", "/edge/hello")).await;
    assert_eq!(resp.status(), 200);
    let body = body_json(resp).await;
    assert_eq!(body["path"], "/edge/hello");
}

#[tokio::test]
async fn test_internal_target_miss_fails_with_500() {
    let gw = Gateway::new(default_config());
    gw.load_apps(vec![keyless_api("bad", "/bad", "gantry://nowhere")]);

    let handler = gw
        .mux()
        .resolve(8080, Transport::Http, "gw.local", "/bad/x")
        .unwrap();
    let resp = handler.serve(request("GET", "gw.local", "/bad/x")).await;
    assert_eq!(resp.status(), 500);
    let body = body_text(resp).await;
    assert!(body.contains("Couldn't detect target"), "got: {body}");
}

#[tokio::test]
async fn test_self_loop_hits_the_depth_cap() {
    let gw = Gateway::new(default_config());
    gw.load_apps(vec![keyless_api("loop", "/loop", "gantry://self")]);

    let handler = gw
        .mux()
        .resolve(8080, Transport::Http, "gw.local", "/loop/x")
        .unwrap();
    let resp = handler.serve(request("GET", "gw.local", "/loop/x")).await;
    assert_eq!(resp.status(), 500);
    let body = body_text(resp).await;
    assert!(
        body.contains("Loop level too deep. Found more than 5 loops in single request"),
        "got: {body}"
    );
}

#[tokio::test]
async fn test_loop_limit_query_overrides_the_cap() {
    let gw = Gateway::new(default_config());
    gw.load_apps(vec![keyless_api("loop", "/loop", "gantry://self")]);

    let handler = gw
        .mux()
        .resolve(8080, Transport::Http, "gw.local", "/loop/x")
        .unwrap();
    let resp = handler
        .serve(request("GET", "gw.local", "/loop/x?loop_limit=2"))
        .await;
    assert_eq!(resp.status(), 500);
    let body = body_text(resp).await;
    assert!(
        body.contains("Found more than 2 loops in single request"),
        "got: {body}"
    );
}

#[tokio::test]
async fn test_loop_url_dispatches_by_name_with_method_override() {
    let upstream = start_echo_backend().await;
    let gw = Gateway::new(default_config());

    let mut inner = keyless_api("inner", "/inner", &format!("http://{upstream}"));
    inner.name = "Inner Service".into();
    let edge = keyless_api("edge", "/edge", &format!("http://{upstream}"));

    gw.load_apps(vec![inner, edge]);

    // Drive the edge chain directly with an internal-scheme URL, the way
    // a rewrite stage would re-enter it.
    let handler = gw.registry().handle("edge").unwrap().handler.clone().unwrap();
    let req = axum::http::Request::builder()
        .method("GET")
        .uri("gantry://InnerService/ping?method=POST")
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = handler.serve(req).await;
    assert_eq!(resp.status(), 200);
    let body = body_json(resp).await;
    assert_eq!(body["method"], "POST", "method query overrides the verb");
    assert_eq!(body["path"], "/ping");
}

#[tokio::test]
async fn test_unresolvable_loop_host_fails_with_500() {
    let upstream = start_echo_backend().await;
    let gw = Gateway::new(default_config());
    gw.load_apps(vec![keyless_api("edge", "/edge", &format!("http://{upstream}"))]);

    let handler = gw.registry().handle("edge").unwrap().handler.clone().unwrap();
    let req = axum::http::Request::builder()
        .method("GET")
        .uri("gantry://ghost/x")
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = handler.serve(req).await;
    assert_eq!(resp.status(), 500);
    let body = body_text(resp).await;
    assert!(body.contains("Can't detect loop target"), "got: {body}");
}

#[tokio::test]
async fn test_loop_by_api_id() {
    let upstream = start_echo_backend().await;
    let gw = Gateway::new(default_config());

    let inner = keyless_api("inner-id", "/inner", &format!("http://{upstream}"));
    let edge = keyless_api("edge", "/edge", &format!("http://{upstream}"));
    gw.load_apps(vec![inner, edge]);

    let handler = gw.registry().handle("edge").unwrap().handler.clone().unwrap();
    let req = axum::http::Request::builder()
        .method("GET")
        .uri("gantry://inner-id/by-id")
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = handler.serve(req).await;
    assert_eq!(resp.status(), 200);
    let body = body_json(resp).await;
    assert_eq!(body["path"], "/by-id");
}
