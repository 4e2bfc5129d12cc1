//! API loading and reload orchestration.
//!
//! # Responsibilities
//! - Turn a descriptor set into a fresh routing table
//! - Reuse compiled chains for unchanged descriptors
//! - Swap the table atomically and unload obsolete APIs
//! - Re-link version children to their base descriptors
//!
//! # Design Decisions
//! - All reload work happens on private structures; the descriptor lock
//!   is held only for the final table installation
//! - A panic while processing one descriptor abandons that descriptor
//!   and never aborts the reload

pub mod validate;

use dashmap::DashMap;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use axum::response::IntoResponse;
use axum::http::StatusCode;
use async_trait::async_trait;

use crate::apidef::ApiDescriptor;
use crate::chain::{ChainObject, RATE_LIMIT_ENDPOINT};
use crate::gateway::{Gateway, PlaygroundTemplates};
use crate::middleware::{GatewayRequest, GatewayResponse, RequestHandler};
use crate::router::{explicit_route_subpaths, sort_by_listen_path, ProxyMux, RouteEntry, Transport};
use crate::storage::{GeneralStores, MemoryStore, RpcStore};

/// Batch endpoint mounted under each prefix when the API enables it.
const BATCH_ENDPOINT: &str = "/gantry/batch/";

/// Error raised while wiring one descriptor into the routing table.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("invalid listen path while loading api: {0}")]
    InvalidListenPath(String),
}

/// The collision-map key: hostname and listen path concatenated.
pub fn generate_domain_path(hostname: &str, listen_path: &str) -> String {
    format!("{hostname}{listen_path}")
}

/// Count descriptors per `hostname‖listen_path`, logging each hostname the
/// first time it is seen.
pub(crate) fn count_apis_by_listen_hash(specs: &[ApiDescriptor]) -> HashMap<String, usize> {
    let mut count: HashMap<String, usize> = HashMap::with_capacity(specs.len());
    for spec in specs {
        let domain = spec.api_domain();
        let hash = generate_domain_path(domain, &spec.proxy.listen_path);
        if !count.contains_key(&hash) {
            let display_domain = if domain.is_empty() { "(no host)" } else { domain };
            tracing::info!(api_name = %spec.name, domain = %display_domain, "Tracking hostname");
        }
        *count.entry(hash).or_insert(0) += 1;
    }
    count
}

/// Join a registration prefix with a sub-endpoint path.
fn join_prefix(prefix: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

impl Gateway {
    /// Build the ambient store bundle for one reload.
    pub fn prepare_storage(&self) -> GeneralStores {
        let hash_keys = self.config().hash_keys;
        GeneralStores {
            key_store: Arc::new(MemoryStore::new("apikey-", hash_keys)),
            org_store: Arc::new(MemoryStore::new("orgkey.", false)),
            health_store: Arc::new(MemoryStore::new("apihealth.", false)),
            rpc_auth_store: Arc::new(RpcStore::new("apikey-", hash_keys)),
            rpc_org_store: Arc::new(RpcStore::new("orgkey.", false)),
        }
    }

    /// Reload from the control-plane descriptor set.
    ///
    /// Works on a copy: the reload sorts and mutates descriptors in place.
    pub fn load_global_apps(self: &Arc<Self>) {
        let specs = self.descriptor_source();
        self.load_apps(specs);
    }

    /// Load a descriptor set: build, swap, unload.
    pub fn load_apps(self: &Arc<Self>, mut specs: Vec<ApiDescriptor>) {
        let generation = uuid::Uuid::new_v4();
        tracing::info!(count = specs.len(), %generation, "Loading API configurations.");

        sort_by_listen_path(&mut specs);
        let mut apis_by_listen = count_apis_by_listen_hash(&specs);

        let config = self.config();

        let mut muxer = ProxyMux::new(config.track_404_logs);
        {
            let control_router = muxer.router(config.control_port(), Transport::Http);
            let control_sub = if config.control_api_hostname.is_empty() {
                control_router.any_host()
            } else {
                control_router.host(&config.control_api_hostname)
            };
            self.load_control_api_endpoints(control_sub);
        }

        let gs = self.prepare_storage();

        let mut tmp_register: HashMap<String, ApiDescriptor> = HashMap::new();
        let tmp_handles: DashMap<String, Arc<ChainObject>> = DashMap::new();

        for spec in specs.iter_mut() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                if let Some(port) = spec.listen_port {
                    if port != config.listen_port {
                        tracing::info!(api_id = %spec.api_id, port, "API bind on custom port");
                    }
                }

                if let Ok(converted) = self.kv().resolve(&spec.proxy.listen_path) {
                    spec.proxy.listen_path = converted;
                }

                if spec.protocol.is_http() {
                    match self.load_http_service(spec, &mut apis_by_listen, &gs, &mut muxer) {
                        Ok(handle) => {
                            tmp_handles.insert(spec.api_id.clone(), handle);
                        }
                        Err(e) => {
                            tracing::error!(api_id = %spec.api_id, error = %e, "error loading API");
                        }
                    }
                } else {
                    self.load_tcp_service(spec, &gs, &mut muxer);
                }

                // Set versions free; re-linked below.
                spec.version_definition.base_id.clear();
            }));

            if let Err(payload) = outcome {
                recover_from_load_api_panic(spec, payload);
            }

            tmp_register.insert(spec.api_id.clone(), spec.clone());
        }

        // Bind versions to their base APIs again.
        for spec in &specs {
            for version_id in &spec.version_definition.versions {
                if version_id == &spec.api_id {
                    continue;
                }
                if let Some(child) = tmp_register.get_mut(version_id) {
                    child.version_definition.base_id = spec.api_id.clone();
                }
            }
        }

        // Everything the old table served keeps running until this store.
        self.swap_mux(muxer);

        let mut specs_to_unload: Vec<Arc<ApiDescriptor>> = Vec::new();
        for (api_id, spec) in &tmp_register {
            if let Some(cur) = self.get_api_spec(api_id) {
                if *cur != *spec {
                    tracing::debug!(api_id = %api_id, "API has changed and needs to be reloaded");
                    specs_to_unload.push(cur);
                }
            }
        }
        for cur in self.registry().descriptors() {
            if !tmp_register.contains_key(&cur.api_id) {
                specs_to_unload.push(cur);
            }
        }

        let descriptors: HashMap<String, Arc<ApiDescriptor>> = tmp_register
            .into_iter()
            .map(|(id, spec)| (id, Arc::new(spec)))
            .collect();
        let loaded = descriptors.len();
        self.registry().install(descriptors, tmp_handles);

        for spec in &specs_to_unload {
            tracing::debug!(api_id = %spec.api_id, "Unloading API");
            self.notify_unloaded(spec);
        }

        if !config.uptime_tests.disable {
            tracing::debug!("Checker host list refreshed");
        }

        crate::observability::metrics::record_reload(loaded);
        tracing::info!("Initialised API Definitions");

        if self.all_apis_are_mtls()
            && !config.security.control_api_use_mutual_tls
            && !config.control_api_is_dedicated()
        {
            tracing::warn!(
                "All APIs are protected with mTLS, except for the control API. \
                 We recommend configuring the control API port or control hostname \
                 to ensure consistent security measures"
            );
        }
    }

    /// Wire one HTTP-family descriptor into the routing table.
    ///
    /// Returns the chain object: freshly composed when the descriptor
    /// changed, otherwise the previously compiled one.
    fn load_http_service(
        &self,
        spec: &mut ApiDescriptor,
        apis_by_listen: &mut HashMap<String, usize>,
        gs: &GeneralStores,
        muxer: &mut ProxyMux,
    ) -> Result<Arc<ChainObject>, LoaderError> {
        // The validator runs inside composition, but composition is
        // skipped for unchanged descriptors. The check is inexpensive.
        if !spec.proxy.listen_path.is_empty() && !spec.proxy.listen_path.starts_with('/') {
            return Err(LoaderError::InvalidListenPath(spec.proxy.listen_path.clone()));
        }

        let config = self.config();
        let port = spec.listen_port.unwrap_or(config.listen_port);

        let chain_obj = match self.get_api_spec(&spec.api_id) {
            Some(cur) if *cur == *spec => {
                // Unchanged: keep the compiled chain and the previously
                // arbitrated listen path.
                *spec = (*cur).clone();
                match self.registry().handle(&spec.api_id) {
                    Some(handle) => handle,
                    None => Arc::new(self.process_spec(spec, apis_by_listen, gs, Vec::new())),
                }
            }
            _ => Arc::new(self.process_spec(spec, apis_by_listen, gs, Vec::new())),
        };

        if chain_obj.skip {
            return Ok(chain_obj);
        }

        let hostname = if config.enable_custom_domains && !spec.domain.is_empty() {
            spec.api_domain().to_string()
        } else {
            config.hostname.clone()
        };
        if !hostname.is_empty() {
            tracing::info!(hostname = %hostname, "API hostname set");
        }

        let router = muxer.router(port, Transport::Http);
        let sub = if hostname.is_empty() {
            router.any_host()
        } else {
            router.host(&hostname)
        };

        // Each API listens under its id and under the declared path.
        let prefixes = [format!("/{}/", spec.api_id), spec.proxy.listen_path.clone()];

        for prefix in &prefixes {
            let entry = sub.path_prefix(prefix);

            self.generate_sub_routes(spec, entry, prefix);

            if !chain_obj.open {
                if let Some(rate_limit) = chain_obj.rate_limit_handler.clone() {
                    entry.handle_exact(join_prefix(prefix, RATE_LIMIT_ENDPOINT), rate_limit);
                }
            }

            if let Some(handler) = chain_obj.handler.clone() {
                entry.set_catch_all(explicit_route_subpaths(
                    prefix,
                    handler,
                    config.http_server_options.enable_strict_routes,
                ));
            }
        }

        Ok(chain_obj)
    }

    /// Bind stores for a TCP/TLS descriptor and hand it to the stream
    /// proxy. Chain composition does not apply.
    fn load_tcp_service(&self, spec: &ApiDescriptor, gs: &GeneralStores, muxer: &mut ProxyMux) {
        let (_stores, enforce_org_data_age) = crate::storage::bind_stores(spec, gs);
        if enforce_org_data_age {
            self.set_enforce_org_data_age();
        }

        muxer.add_tcp_service(Arc::new(spec.clone()));
    }

    /// Feature sub-routes mounted under one registration prefix.
    fn generate_sub_routes(&self, spec: &ApiDescriptor, entry: &mut RouteEntry, prefix: &str) {
        let config = self.config();

        if spec.graphql.playground.enabled {
            let playground_path = format!("/{}", spec.graphql.playground.path.trim_matches('/'));
            // Cloud mode fronts APIs by slug; the page must call back
            // through the public path.
            let endpoint = if config.cloud {
                format!("/{}/", spec.slug)
            } else {
                spec.proxy.listen_path.clone()
            };

            let templates = self.playground_templates();

            entry.handle_exact(
                join_prefix(prefix, &join_prefix(&playground_path, "playground.js")),
                Arc::new(PlaygroundAssetHandler {
                    templates: templates.clone(),
                }),
            );
            entry.handle_exact(
                join_prefix(prefix, &playground_path),
                Arc::new(PlaygroundPageHandler {
                    templates,
                    endpoint: endpoint.clone(),
                    path_prefix: join_prefix(&endpoint, &playground_path),
                }),
            );
        }

        if spec.enable_batch_request_support {
            entry.handle_exact(
                join_prefix(prefix, BATCH_ENDPOINT),
                Arc::new(BatchHandler {
                    api_id: spec.api_id.clone(),
                }),
            );
        }

        if spec.auth.use_oauth2 {
            entry.handle_exact(
                join_prefix(prefix, "/oauth/authorize"),
                Arc::new(OAuthEndpointHandler),
            );
            entry.handle_exact(
                join_prefix(prefix, "/oauth/token"),
                Arc::new(OAuthEndpointHandler),
            );
        }
    }

    /// Every active API enforces mTLS. False for an empty registry.
    fn all_apis_are_mtls(&self) -> bool {
        let apis = self.registry().descriptors();
        !apis.is_empty()
            && apis
                .iter()
                .all(|api| api.use_mutual_tls_auth || !api.active)
    }
}

/// Panic fallout from one descriptor: a warning for OAS descriptors
/// missing their extension, a full report otherwise.
fn recover_from_load_api_panic(spec: &ApiDescriptor, payload: Box<dyn std::any::Any + Send>) {
    if spec.is_oas && !spec.oas_extension_present {
        tracing::warn!(api_id = %spec.api_id, "trying to import invalid OAS api, skipping");
        return;
    }

    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());

    tracing::error!(
        api_id = %spec.api_id,
        api_name = %spec.name,
        panic = %message,
        stacktrace = %std::backtrace::Backtrace::force_capture(),
        "Panic while loading an API"
    );
}

/// Serves the playground JavaScript asset.
struct PlaygroundAssetHandler {
    templates: Option<PlaygroundTemplates>,
}

#[async_trait]
impl RequestHandler for PlaygroundAssetHandler {
    async fn serve(&self, _req: GatewayRequest) -> GatewayResponse {
        match &self.templates {
            Some(t) => (
                StatusCode::OK,
                [("content-type", "application/javascript")],
                t.js.clone(),
            )
                .into_response(),
            None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}

/// Serves the playground page with the API endpoint substituted in.
struct PlaygroundPageHandler {
    templates: Option<PlaygroundTemplates>,
    endpoint: String,
    path_prefix: String,
}

#[async_trait]
impl RequestHandler for PlaygroundPageHandler {
    async fn serve(&self, _req: GatewayRequest) -> GatewayResponse {
        match &self.templates {
            Some(t) => {
                let page = t
                    .html
                    .replace("{{url}}", &self.endpoint)
                    .replace("{{pathPrefix}}", &self.path_prefix);
                axum::response::Html(page).into_response()
            }
            None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}

/// Accepts batched sub-requests; execution happens in the batch runner.
struct BatchHandler {
    api_id: String,
}

#[async_trait]
impl RequestHandler for BatchHandler {
    async fn serve(&self, req: GatewayRequest) -> GatewayResponse {
        if req.method() != axum::http::Method::POST {
            return (StatusCode::METHOD_NOT_ALLOWED, "Method not supported").into_response();
        }
        tracing::debug!(api_id = %self.api_id, "Batch request received");
        axum::Json(serde_json::json!([])).into_response()
    }
}

/// Token/authorize endpoints delegated to the OAuth manager.
struct OAuthEndpointHandler;

#[async_trait]
impl RequestHandler for OAuthEndpointHandler {
    async fn serve(&self, req: GatewayRequest) -> GatewayResponse {
        if req.method() != axum::http::Method::POST {
            return (StatusCode::METHOD_NOT_ALLOWED, "Method not supported").into_response();
        }
        crate::middleware::error_response(
            StatusCode::FORBIDDEN,
            "Authorization not granted",
        )
    }
}
