//! Loader end-to-end behaviour: collisions, reuse, routing, unloads.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gantry::apidef::{ApiDescriptor, VersionInfo, TLS12};
use gantry::config::default_config;
use gantry::gateway::{Gateway, UnloadHook};
use gantry::router::Transport;

use common::{body_json, keyless_api, protected_api, request, start_echo_backend};

struct CountingUnloadHook {
    count: AtomicUsize,
    unloaded: Mutex<Vec<String>>,
}

impl CountingUnloadHook {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(0),
            unloaded: Mutex::new(Vec::new()),
        })
    }
}

impl UnloadHook for CountingUnloadHook {
    fn api_unloaded(&self, api: &ApiDescriptor) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.unloaded.lock().unwrap().push(api.api_id.clone());
    }
}

fn listen_path(gw: &Gateway, api_id: &str) -> String {
    gw.registry()
        .descriptor(api_id)
        .map(|api| api.proxy.listen_path.clone())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_collision_keeps_exactly_one_original_path() {
    let gw = Gateway::new(default_config());
    gw.load_apps(vec![
        keyless_api("a", "/x", "http://127.0.0.1:1"),
        keyless_api("b", "/x", "http://127.0.0.1:1"),
    ]);

    let path_a = listen_path(&gw, "a");
    let path_b = listen_path(&gw, "b");

    assert_ne!(path_a, path_b, "collision must be arbitrated");
    let originals = [&path_a, &path_b]
        .iter()
        .filter(|p| p.as_str() == "/x")
        .count();
    assert_eq!(originals, 1, "exactly one API keeps /x");
    assert!(path_a == "/x-a" || path_b == "/x-b");
}

#[tokio::test]
async fn test_collision_assignment_is_stable_across_reloads() {
    let hook = CountingUnloadHook::new();
    let gw = Gateway::new(default_config());
    gw.add_unload_hook(hook.clone());

    let specs = vec![
        keyless_api("a", "/x", "http://127.0.0.1:1"),
        keyless_api("b", "/x", "http://127.0.0.1:1"),
    ];

    gw.load_apps(specs.clone());
    let first = (listen_path(&gw, "a"), listen_path(&gw, "b"));

    gw.load_apps(specs);
    let second = (listen_path(&gw, "a"), listen_path(&gw, "b"));

    assert_eq!(first, second, "same inputs, same assignment");
    assert_eq!(
        hook.count.load(Ordering::SeqCst),
        0,
        "identical reload unloads nothing"
    );
}

#[tokio::test]
async fn test_suffix_cascade_produces_distinct_paths() {
    let gw = Gateway::new(default_config());
    gw.load_apps(vec![
        keyless_api("a", "/x", "http://127.0.0.1:1"),
        keyless_api("b", "/x", "http://127.0.0.1:1"),
        keyless_api("c", "/x-a", "http://127.0.0.1:1"),
    ]);

    let paths = vec![
        listen_path(&gw, "a"),
        listen_path(&gw, "b"),
        listen_path(&gw, "c"),
    ];

    for (i, p) in paths.iter().enumerate() {
        for q in paths.iter().skip(i + 1) {
            assert_ne!(p, q, "paths must be pairwise distinct: {paths:?}");
        }
    }
    assert!(paths.contains(&"/x".to_string()), "one claimant keeps /x");
}

#[tokio::test]
async fn test_unchanged_descriptor_reuses_chain_object() {
    let gw = Gateway::new(default_config());
    let specs = vec![keyless_api("a", "/svc", "http://127.0.0.1:1")];

    gw.load_apps(specs.clone());
    let first = gw.registry().handle("a").unwrap();

    gw.load_apps(specs);
    let second = gw.registry().handle("a").unwrap();
    assert!(
        Arc::ptr_eq(&first, &second),
        "unchanged descriptor keeps its compiled chain"
    );

    let mut changed = keyless_api("a", "/svc", "http://127.0.0.1:1");
    changed.name = "renamed".into();
    gw.load_apps(vec![changed]);
    let third = gw.registry().handle("a").unwrap();
    assert!(!Arc::ptr_eq(&second, &third), "changed descriptor recompiles");
}

#[tokio::test]
async fn test_changed_and_removed_descriptors_unload() {
    let hook = CountingUnloadHook::new();
    let gw = Gateway::new(default_config());
    gw.add_unload_hook(hook.clone());

    gw.load_apps(vec![
        keyless_api("a", "/a", "http://127.0.0.1:1"),
        keyless_api("b", "/b", "http://127.0.0.1:1"),
    ]);
    assert_eq!(hook.count.load(Ordering::SeqCst), 0);

    // a changes, b disappears.
    let mut changed = keyless_api("a", "/a", "http://127.0.0.1:1");
    changed.name = "changed".into();
    gw.load_apps(vec![changed]);

    let unloaded = hook.unloaded.lock().unwrap().clone();
    assert_eq!(hook.count.load(Ordering::SeqCst), 2);
    assert!(unloaded.contains(&"a".to_string()));
    assert!(unloaded.contains(&"b".to_string()));
    assert!(gw.registry().descriptor("b").is_none());
}

#[tokio::test]
async fn test_keyless_api_is_open_and_proxies_without_auth() {
    let upstream = start_echo_backend().await;
    let gw = Gateway::new(default_config());
    gw.load_apps(vec![keyless_api(
        "open",
        "/open",
        &format!("http://{upstream}"),
    )]);

    let handle = gw.registry().handle("open").unwrap();
    assert!(handle.open);
    assert!(
        handle.rate_limit_handler.is_none(),
        "open chain carries no rate-limit side-chain"
    );

    let mux = gw.mux();
    let handler = mux
        .resolve(8080, Transport::Http, "gw.local", "/open/anything")
        .unwrap();
    let resp = handler.serve(request("GET", "gw.local", "/open/anything")).await;
    assert_eq!(resp.status(), 200);
    let body = body_json(resp).await;
    assert_eq!(body["path"], "/open/anything");
    assert_eq!(body["authorization"], serde_json::Value::Null);

    // No synthetic endpoint: the path falls through to the upstream.
    let handler = mux
        .resolve(8080, Transport::Http, "gw.local", "/open/gantry/rate-limits/")
        .unwrap();
    let resp = handler
        .serve(request("GET", "gw.local", "/open/gantry/rate-limits/"))
        .await;
    let body = body_json(resp).await;
    assert_eq!(body["path"], "/open/gantry/rate-limits/");
}

#[tokio::test]
async fn test_protected_api_serves_live_rate_limits() {
    let upstream = start_echo_backend().await;
    let gw = Gateway::new(default_config());
    gw.load_apps(vec![protected_api(
        "locked",
        "/locked",
        &format!("http://{upstream}"),
    )]);

    let mux = gw.mux();

    // Main chain requires credentials.
    let handler = mux
        .resolve(8080, Transport::Http, "gw.local", "/locked/items")
        .unwrap();
    let resp = handler.serve(request("GET", "gw.local", "/locked/items")).await;
    assert_eq!(resp.status(), 401);

    // Side-chain requires them too, then reports the counters.
    let handler = mux
        .resolve(8080, Transport::Http, "gw.local", "/locked/gantry/rate-limits/")
        .unwrap();
    let resp = handler
        .serve(request("GET", "gw.local", "/locked/gantry/rate-limits/"))
        .await;
    assert_eq!(resp.status(), 401);

    let mut req = request("GET", "gw.local", "/locked/gantry/rate-limits/");
    req.headers_mut()
        .insert("authorization", "Bearer any-key".parse().unwrap());
    let handler = mux
        .resolve(8080, Transport::Http, "gw.local", "/locked/gantry/rate-limits/")
        .unwrap();
    let resp = handler.serve(req).await;
    assert_eq!(resp.status(), 200);
    let body = body_json(resp).await;
    assert!(body["rate_limit"].is_object());
    assert!(body["quota"].is_object());
}

#[tokio::test]
async fn test_strict_routes_gate() {
    let upstream = start_echo_backend().await;
    let mut config = default_config();
    config.http_server_options.enable_strict_routes = true;
    let gw = Gateway::new(config);
    gw.load_apps(vec![keyless_api(
        "foo",
        "/foo",
        &format!("http://{upstream}"),
    )]);

    let mux = gw.mux();
    let serve = |path: &'static str| {
        let mux = mux.clone();
        async move {
            let req = request("GET", "gw.local", path);
            match mux.resolve(8080, Transport::Http, "gw.local", path) {
                Some(handler) => handler.serve(req).await.status().as_u16(),
                None => 404,
            }
        }
    };

    assert_eq!(serve("/foo").await, 200);
    assert_eq!(serve("/foo/x").await, 200);
    assert_eq!(serve("/foo/").await, 200);
    assert_eq!(serve("/foobar").await, 404);
}

#[tokio::test]
async fn test_tls_versions_are_normalised() {
    let gw = Gateway::new(default_config());

    let mut api = keyless_api("tls", "/tls", "http://127.0.0.1:1");
    api.proxy.transport.ssl_min_version = 0x0301;
    api.proxy.transport.ssl_max_version = 0x0999;
    let mut api2 = keyless_api("tls2", "/tls2", "http://127.0.0.1:1");
    api2.proxy.transport.ssl_min_version = 0x0302;
    api2.proxy.transport.ssl_max_version = 0x0301;

    gw.load_apps(vec![api, api2]);

    let loaded = gw.registry().descriptor("tls").unwrap();
    assert_eq!(loaded.proxy.transport.ssl_max_version, TLS12);
    assert!(loaded.proxy.transport.ssl_min_version <= loaded.proxy.transport.ssl_max_version);

    let loaded = gw.registry().descriptor("tls2").unwrap();
    assert_eq!(loaded.proxy.transport.ssl_max_version, TLS12);
    assert!(loaded.proxy.transport.ssl_min_version <= loaded.proxy.transport.ssl_max_version);
}

#[tokio::test]
async fn test_tag_headers_are_lowercased() {
    let gw = Gateway::new(default_config());
    let mut api = keyless_api("tags", "/tags", "http://127.0.0.1:1");
    api.tag_headers = vec!["X-Team".into(), "X-REGION".into()];
    gw.load_apps(vec![api]);

    let loaded = gw.registry().descriptor("tags").unwrap();
    assert_eq!(loaded.tag_headers, vec!["x-team", "x-region"]);
}

#[tokio::test]
async fn test_empty_set_leaves_only_control_routes() {
    let gw = Gateway::new(default_config());
    gw.load_apps(Vec::new());

    let mux = gw.mux();
    let control = mux
        .resolve(8080, Transport::Http, "gw.local", "/hello")
        .expect("control route must be premounted");
    let resp = control.serve(request("GET", "gw.local", "/hello")).await;
    assert_eq!(resp.status(), 200);

    assert!(mux.resolve(8080, Transport::Http, "gw.local", "/anything").is_none());
}

#[tokio::test]
async fn test_domainless_api_reachable_from_any_host() {
    let upstream = start_echo_backend().await;
    let gw = Gateway::new(default_config());
    gw.load_apps(vec![keyless_api(
        "any",
        "/any",
        &format!("http://{upstream}"),
    )]);

    let mux = gw.mux();
    for host in ["one.example.com", "two.example.com:8080", ""] {
        assert!(
            mux.resolve(8080, Transport::Http, host, "/any/x").is_some(),
            "host {host:?} must reach the domainless API"
        );
    }
}

#[tokio::test]
async fn test_custom_domain_scoping() {
    let upstream = start_echo_backend().await;
    let mut config = default_config();
    config.enable_custom_domains = true;
    let gw = Gateway::new(config);

    let mut scoped = keyless_api("scoped", "/svc", &format!("http://{upstream}"));
    scoped.domain = "api.example.com".into();
    gw.load_apps(vec![scoped]);

    let mux = gw.mux();
    assert!(mux
        .resolve(8080, Transport::Http, "api.example.com", "/svc/x")
        .is_some());
    assert!(mux
        .resolve(8080, Transport::Http, "other.example.com", "/svc/x")
        .is_none());
}

#[tokio::test]
async fn test_internal_api_not_registered() {
    let gw = Gateway::new(default_config());
    let mut api = keyless_api("hidden", "/hidden", "http://127.0.0.1:1");
    api.internal = true;
    gw.load_apps(vec![api]);

    let handle = gw.registry().handle("hidden").unwrap();
    assert!(handle.skip);
    assert!(handle.handler.is_some(), "internal APIs stay loopable");

    assert!(gw
        .mux()
        .resolve(8080, Transport::Http, "gw.local", "/hidden/x")
        .is_none());
}

#[tokio::test]
async fn test_invalid_descriptor_skipped_without_oscillation() {
    let hook = CountingUnloadHook::new();
    let gw = Gateway::new(default_config());
    gw.add_unload_hook(hook.clone());

    let invalid = keyless_api("bad", "", "http://127.0.0.1:1");
    gw.load_apps(vec![invalid.clone()]);

    let handle = gw.registry().handle("bad").unwrap();
    assert!(handle.skip);
    assert!(handle.handler.is_none());
    assert!(gw.registry().descriptor("bad").is_some(), "stays in the set");

    gw.load_apps(vec![invalid]);
    assert_eq!(hook.count.load(Ordering::SeqCst), 0, "no reload oscillation");
}

#[tokio::test]
async fn test_version_override_selects_multi_target() {
    let upstream_default = start_echo_backend().await;
    let upstream_v2 = start_echo_backend().await;

    let gw = Gateway::new(default_config());
    let mut api = keyless_api("ver", "/ver", &format!("http://{upstream_default}"));
    api.version_data.not_versioned = false;
    api.version_data
        .versions
        .insert("v1".into(), VersionInfo::default());
    api.version_data.versions.insert(
        "v2".into(),
        VersionInfo {
            override_target: format!("http://{upstream_v2}/v2base"),
        },
    );
    gw.load_apps(vec![api]);

    let mux = gw.mux();
    let handler = mux
        .resolve(8080, Transport::Http, "gw.local", "/ver/items")
        .unwrap();

    // Untagged requests go to the default target.
    let resp = handler.serve(request("GET", "gw.local", "/ver/items")).await;
    let body = body_json(resp).await;
    assert_eq!(body["path"], "/ver/items");

    // The overriding version is routed to the override URL.
    let mut req = request("GET", "gw.local", "/ver/items");
    req.headers_mut()
        .insert("x-api-version", "v2".parse().unwrap());
    let resp = handler.serve(req).await;
    let body = body_json(resp).await;
    assert_eq!(body["path"], "/v2base/ver/items");
}

#[tokio::test]
async fn test_api_reachable_under_id_prefix() {
    let upstream = start_echo_backend().await;
    let gw = Gateway::new(default_config());
    gw.load_apps(vec![keyless_api(
        "byid",
        "/byid-path",
        &format!("http://{upstream}"),
    )]);

    let mux = gw.mux();
    assert!(mux
        .resolve(8080, Transport::Http, "gw.local", "/byid/whatever")
        .is_some());
}

#[tokio::test]
async fn test_custom_listen_port() {
    let upstream = start_echo_backend().await;
    let gw = Gateway::new(default_config());
    let mut api = keyless_api("alt", "/alt", &format!("http://{upstream}"));
    api.listen_port = Some(9099);
    gw.load_apps(vec![api]);

    let mux = gw.mux();
    assert!(mux.resolve(8080, Transport::Http, "gw.local", "/alt/x").is_none());
    assert!(mux.resolve(9099, Transport::Http, "gw.local", "/alt/x").is_some());
}

#[tokio::test]
async fn test_tcp_descriptor_hands_off() {
    let gw = Gateway::new(default_config());
    let mut api = keyless_api("stream", "", "tcp://127.0.0.1:7000");
    api.protocol = gantry::apidef::Protocol::Tcp;
    gw.load_apps(vec![api]);

    let mux = gw.mux();
    assert_eq!(mux.tcp_services().len(), 1);
    assert_eq!(mux.tcp_services()[0].api_id, "stream");
}
