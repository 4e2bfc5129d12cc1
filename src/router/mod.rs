//! Route registry and dispatch.
//!
//! # Responsibilities
//! - Hold the `(port, transport) → router` table built by each reload
//! - Scope routes by hostname and listen-path prefix
//! - Gate prefix matches when strict routes are enabled
//! - Order descriptors so longer paths register first
//!
//! # Design Decisions
//! - Immutable after construction; the loader builds a fresh registry and
//!   swaps it in wholesale (thread-safe without locks)
//! - O(n) prefix scan in registration order; the sort guarantees
//!   `/foo-bar` is seen before `/foo`

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use std::collections::HashMap;
use std::sync::Arc;

use crate::apidef::{ApiDescriptor, Protocol};
use crate::middleware::{GatewayRequest, GatewayResponse, RequestHandler};

/// Listener family a router serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Http,
    Tcp,
}

impl From<Protocol> for Transport {
    fn from(p: Protocol) -> Self {
        if p.is_http() {
            Transport::Http
        } else {
            Transport::Tcp
        }
    }
}

/// Routes registered under one listen-path prefix.
pub struct RouteEntry {
    prefix: String,
    /// Exact sub-paths (rate-limits endpoint, playground, batch) checked
    /// before the catch-all.
    exact: Vec<(String, Arc<dyn RequestHandler>)>,
    catch_all: Option<Arc<dyn RequestHandler>>,
}

impl RouteEntry {
    fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }

    pub fn handle_exact(&mut self, path: String, handler: Arc<dyn RequestHandler>) {
        self.exact.push((path, handler));
    }

    pub fn set_catch_all(&mut self, handler: Arc<dyn RequestHandler>) {
        self.catch_all = Some(handler);
    }
}

/// Ordered prefix routes for one host scope.
#[derive(Default)]
pub struct SubRouter {
    routes: Vec<RouteEntry>,
}

impl SubRouter {
    /// Open a new prefix entry; routes keep registration order.
    pub fn path_prefix(&mut self, prefix: &str) -> &mut RouteEntry {
        self.routes.push(RouteEntry {
            prefix: prefix.to_string(),
            exact: Vec::new(),
            catch_all: None,
        });
        let idx = self.routes.len() - 1;
        &mut self.routes[idx]
    }

    fn resolve(&self, path: &str) -> Option<Arc<dyn RequestHandler>> {
        for entry in &self.routes {
            if !entry.matches(path) {
                continue;
            }
            for (exact, handler) in &entry.exact {
                if path == exact {
                    return Some(handler.clone());
                }
            }
            if let Some(handler) = &entry.catch_all {
                return Some(handler.clone());
            }
        }
        None
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

/// Router for a single `(port, transport)` pair.
#[derive(Default)]
pub struct PortRouter {
    hosts: HashMap<String, SubRouter>,
    fallback: SubRouter,
}

impl PortRouter {
    /// Host-scoped sub-router, created on first use.
    pub fn host(&mut self, hostname: &str) -> &mut SubRouter {
        self.hosts.entry(hostname.to_string()).or_default()
    }

    pub fn any_host(&mut self) -> &mut SubRouter {
        &mut self.fallback
    }

    fn resolve(&self, host: &str, path: &str) -> Option<Arc<dyn RequestHandler>> {
        if let Some(scoped) = self.hosts.get(host) {
            if let Some(handler) = scoped.resolve(path) {
                return Some(handler);
            }
        }
        self.fallback.resolve(path)
    }
}

/// The full routing table for one reload generation.
#[derive(Default)]
pub struct ProxyMux {
    routers: HashMap<(u16, Transport), PortRouter>,
    track_404: bool,
    tcp_services: Vec<Arc<ApiDescriptor>>,
}

impl ProxyMux {
    pub fn new(track_404: bool) -> Self {
        Self {
            track_404,
            ..Self::default()
        }
    }

    /// Router for this port/transport, initialised lazily.
    pub fn router(&mut self, port: u16, transport: Transport) -> &mut PortRouter {
        self.routers.entry((port, transport)).or_default()
    }

    /// Resolve a request to its handler.
    pub fn resolve(
        &self,
        port: u16,
        transport: Transport,
        host: &str,
        path: &str,
    ) -> Option<Arc<dyn RequestHandler>> {
        let host = host.split(':').next().unwrap_or_default();
        self.routers
            .get(&(port, transport))
            .and_then(|router| router.resolve(host, path))
    }

    /// TCP/TLS descriptors handed off to the stream proxy.
    pub fn add_tcp_service(&mut self, api: Arc<ApiDescriptor>) {
        tracing::info!(api_id = %api.api_id, protocol = ?api.protocol, "Registered TCP service");
        self.tcp_services.push(api);
    }

    pub fn tcp_services(&self) -> &[Arc<ApiDescriptor>] {
        &self.tcp_services
    }

    /// Ports carrying at least one HTTP router.
    pub fn http_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .routers
            .keys()
            .filter(|(_, t)| *t == Transport::Http)
            .map(|(p, _)| *p)
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    /// Terminal response for requests no route claimed.
    pub fn handle_404(&self, host: &str, path: &str) -> GatewayResponse {
        if self.track_404 {
            tracing::info!(host = %host, path = %path, "Not found");
        }
        (StatusCode::NOT_FOUND, "Not Found").into_response()
    }
}

/// Prefix gate: only `<prefix>` itself or `<prefix>/...` may pass.
struct ExplicitRouteHandler {
    prefix: String,
    handler: Arc<dyn RequestHandler>,
}

#[async_trait]
impl RequestHandler for ExplicitRouteHandler {
    async fn serve(&self, req: GatewayRequest) -> GatewayResponse {
        let path = req.uri().path();
        if path == self.prefix || path.starts_with(&format!("{}/", self.prefix)) {
            return self.handler.serve(req).await;
        }
        (StatusCode::NOT_FOUND, "Not Found").into_response()
    }
}

/// Wrap `handler` in the strict-prefix gate when the feature is on.
///
/// Trailing-slash prefixes and parameterised prefixes keep the router's
/// native prefix matching.
pub fn explicit_route_subpaths(
    prefix: &str,
    handler: Arc<dyn RequestHandler>,
    enabled: bool,
) -> Arc<dyn RequestHandler> {
    if !enabled {
        return handler;
    }
    if prefix.ends_with('/') {
        return handler;
    }
    if prefix.contains('{') && prefix.contains('}') {
        return handler;
    }

    Arc::new(ExplicitRouteHandler {
        prefix: prefix.to_string(),
        handler,
    })
}

/// Effective listen-path length: static characters plus slash count,
/// `{...}` segments contributing only their slash.
pub fn listen_path_length(listen_path: &str) -> usize {
    if !listen_path.contains('{') {
        return listen_path.len();
    }

    let mut length = listen_path.matches('/').count();
    for segment in listen_path.split('/') {
        if segment.len() > 2 && segment.starts_with('{') && segment.ends_with('}') {
            continue;
        }
        length += segment.len();
    }
    length
}

/// Sort descriptors for registration: empty-domain descriptors last, then
/// longer effective listen paths first so `/foo` doesn't shadow `/foo-bar`.
pub fn sort_by_listen_path(apis: &mut [ApiDescriptor]) {
    apis.sort_by(|a, b| {
        let a_no_domain = a.domain.is_empty();
        let b_no_domain = b.domain.is_empty();
        if a_no_domain != b_no_domain {
            return a_no_domain.cmp(&b_no_domain);
        }
        listen_path_length(&b.proxy.listen_path).cmp(&listen_path_length(&a.proxy.listen_path))
    });
}
