//! Upstream dispatch: the terminal sink of every chain.
//!
//! # Responsibilities
//! - Rewrite the request URI onto the upstream target
//! - Forward via the shared HTTP client
//! - Select the per-version target when overrides are declared
//!
//! # Design Decisions
//! - One client per gateway, cloned into each sink (connection pooling)
//! - Multi-target proxying is a thin map over single-target proxies

use async_trait::async_trait;
use axum::body::Body;
use axum::http::uri::{Authority, PathAndQuery, Scheme, Uri};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use url::Url;

use crate::apidef::ApiDescriptor;
use crate::middleware::context::{self, VersionTag};
use crate::middleware::{error_response, GatewayRequest, GatewayResponse, RequestHandler};

/// Shared upstream HTTP client.
pub type UpstreamClient = Client<HttpConnector, Body>;

pub fn upstream_client() -> UpstreamClient {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

/// Rotates through candidate upstream hosts.
#[derive(Debug)]
pub struct HostList {
    hosts: Vec<String>,
    cursor: AtomicUsize,
}

impl HostList {
    pub fn new(hosts: Vec<String>) -> Self {
        Self {
            hosts,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn next_host(&self) -> Option<&str> {
        if self.hosts.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
        Some(&self.hosts[idx])
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Single-target reverse proxy.
pub struct ReverseProxy {
    target: Url,
    client: UpstreamClient,
    /// Rotation list when load balancing is enabled.
    hosts: Option<HostList>,
}

impl ReverseProxy {
    pub fn new(target: Url, client: UpstreamClient, hosts: Option<HostList>) -> Self {
        Self {
            target,
            client,
            hosts,
        }
    }

    /// The configured upstream target.
    pub fn target(&self) -> &Url {
        &self.target
    }

    fn rewrite_uri(&self, req: &GatewayRequest) -> Result<Uri, String> {
        let scheme = match self.target.scheme() {
            "https" => Scheme::HTTPS,
            _ => Scheme::HTTP,
        };

        let authority = match self.hosts.as_ref().and_then(|h| h.next_host()) {
            Some(host) => Authority::from_str(host),
            None => {
                let host = self.target.host_str().unwrap_or_default();
                let authority = match self.target.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                };
                Authority::from_str(&authority)
            }
        }
        .map_err(|e| format!("invalid upstream authority: {e}"))?;

        let path = join_target_path(self.target.path(), req.uri().path());
        let pq = match req.uri().query() {
            Some(q) => format!("{path}?{q}"),
            None => path,
        };
        let path_and_query =
            PathAndQuery::from_str(&pq).map_err(|e| format!("invalid upstream path: {e}"))?;

        Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| format!("URI rewrite failed: {e}"))
    }
}

#[async_trait]
impl RequestHandler for ReverseProxy {
    async fn serve(&self, mut req: GatewayRequest) -> GatewayResponse {
        let uri = match self.rewrite_uri(&req) {
            Ok(uri) => uri,
            Err(err) => {
                tracing::error!(error = %err, "URI rewrite failed");
                return (StatusCode::INTERNAL_SERVER_ERROR, "URI rewrite failed").into_response();
            }
        };
        *req.uri_mut() = uri;

        match self.client.request(req).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                Response::from_parts(parts, Body::new(body))
            }
            Err(e) => {
                tracing::error!(error = %e, "Upstream request failed");
                (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response()
            }
        }
    }
}

/// Proxy selecting its target by the request's resolved version.
pub struct MultiTargetProxy {
    default: ReverseProxy,
    by_version: HashMap<String, ReverseProxy>,
}

impl MultiTargetProxy {
    /// Build from the descriptor's version matrix. Versions without an
    /// override share the default target.
    pub fn new(api: &ApiDescriptor, target: Url, client: UpstreamClient) -> Self {
        let mut by_version = HashMap::new();
        for (name, info) in &api.version_data.versions {
            if info.override_target.is_empty() {
                continue;
            }
            match Url::parse(&info.override_target) {
                Ok(url) => {
                    by_version.insert(
                        name.clone(),
                        ReverseProxy::new(url, client.clone(), None),
                    );
                }
                Err(e) => {
                    tracing::error!(
                        version = %name,
                        target = %info.override_target,
                        error = %e,
                        "Ignoring unparseable override target"
                    );
                }
            }
        }

        Self {
            default: ReverseProxy::new(target, client, None),
            by_version,
        }
    }

    pub fn version_targets(&self) -> usize {
        self.by_version.len()
    }
}

#[async_trait]
impl RequestHandler for MultiTargetProxy {
    async fn serve(&self, req: GatewayRequest) -> GatewayResponse {
        let proxy = context::get::<VersionTag>(&req)
            .and_then(|tag| self.by_version.get(&tag.0))
            .unwrap_or(&self.default);
        proxy.serve(req).await
    }
}

/// Records the request outcome and forwards to the proxy.
pub struct SuccessHandler {
    pub api: Arc<ApiDescriptor>,
    pub proxy: Arc<dyn RequestHandler>,
}

#[async_trait]
impl RequestHandler for SuccessHandler {
    async fn serve(&self, req: GatewayRequest) -> GatewayResponse {
        let tags: Vec<String> = self
            .api
            .tag_headers
            .iter()
            .filter_map(|name| {
                req.headers()
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .map(|v| format!("{name}-{v}"))
            })
            .collect();

        if !tags.is_empty() {
            tracing::debug!(api_id = %self.api.api_id, ?tags, "Tagged request");
        }

        let response = self.proxy.serve(req).await;
        crate::observability::metrics::record_api_request(
            &self.api.api_id,
            response.status().as_u16(),
        );
        response
    }
}

/// Join the configured target path with the inbound request path.
fn join_target_path(target: &str, request: &str) -> String {
    let target = target.trim_end_matches('/');
    if target.is_empty() {
        return request.to_string();
    }
    if request == "/" || request.is_empty() {
        return target.to_string();
    }
    format!("{target}{request}")
}

/// Strip the listen path prefix when the API asks for it.
pub fn sanitize_proxy_path(api: &ApiDescriptor, req: &mut GatewayRequest) {
    if !api.proxy.strip_listen_path {
        return;
    }
    let path = req.uri().path();
    let listen = api.proxy.listen_path.trim_end_matches('/');
    if listen.is_empty() || !path.starts_with(listen) {
        return;
    }
    let remainder = &path[listen.len()..];
    let stripped = if remainder.is_empty() { "/" } else { remainder };

    let pq = match req.uri().query() {
        Some(q) => format!("{stripped}?{q}"),
        None => stripped.to_string(),
    };
    let mut parts = req.uri().clone().into_parts();
    match PathAndQuery::from_str(&pq) {
        Ok(v) => parts.path_and_query = Some(v),
        Err(_) => return,
    }
    if let Ok(uri) = Uri::from_parts(parts) {
        *req.uri_mut() = uri;
    }
}

/// 500 helper shared by the loop dispatcher paths.
pub fn internal_error(message: &str) -> GatewayResponse {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
}
