//! Chain composition: one API descriptor in, one compiled pipeline out.
//!
//! # Responsibilities
//! - Normalise the descriptor (TLS bounds, tag headers, listen path)
//! - Arbitrate listen-path collisions deterministically
//! - Assemble the ordered stage sequence and its rate-limit side-chain
//! - Wrap the finished chain in at most one tracing handler
//!
//! # Design Decisions
//! - The composer is declarative: every stage is conditionally appended
//!   and decides its own applicability
//! - The auth sub-sequence is built once and shared by reference between
//!   the main chain and the side-chain
//! - Composition performs no I/O; it only wires collaborators together

use axum::response::IntoResponse;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::Instrument;
use url::Url;

use crate::apidef::{ApiDescriptor, MiddlewareDriver, TLS12};
use crate::gateway::Gateway;
use crate::looping::LoopDispatcher;
use crate::middleware::context::{self, SessionState};
use crate::middleware::custom::{fix_hook_paths, join_bundle_path, CustomMiddleware, HookKind};
use crate::middleware::stages::*;
use crate::middleware::{
    append_enabled, Chain, GatewayRequest, GatewayResponse, Middleware, RequestHandler,
};
use crate::proxy::{HostList, MultiTargetProxy, ReverseProxy, SuccessHandler};
use crate::storage::{cache_store_for, bind_stores, GeneralStores, MemoryStore};

pub mod options;

use async_trait::async_trait;
pub use options::{build_options, with_quota_key, ProcessOption, ProcessOptions};

/// Synthetic endpoint serving the caller's live rate-limit counters.
pub const RATE_LIMIT_ENDPOINT: &str = "/gantry/rate-limits/";

/// Root directory bundles are extracted under.
const BUNDLE_CACHE_DIR: &str = "middleware/bundles";

/// Per-descriptor compiled artifact.
///
/// `handler` is absent only for descriptors that failed validation; a
/// skipped-but-internal API still carries a runnable chain for looping.
#[derive(Default)]
pub struct ChainObject {
    pub handler: Option<Arc<dyn RequestHandler>>,
    /// Side-chain for the rate-limits endpoint; absent on open APIs.
    pub rate_limit_handler: Option<Arc<dyn RequestHandler>>,
    /// Keyless API: no auth block, no side-chain.
    pub open: bool,
    /// Not registered on any router (invalid or internal).
    pub skip: bool,
    /// Response hooks applied by the upstream transport on the way out.
    pub response_chain: Vec<Arc<dyn Middleware>>,
    /// The per-API cache; dropped together with the chain at unload.
    cache_store: Option<Arc<MemoryStore>>,
}

impl ChainObject {
    /// Chain for a descriptor that failed validation.
    pub fn skipped() -> Self {
        Self {
            skip: true,
            ..Self::default()
        }
    }

    pub fn cache_store(&self) -> Option<&Arc<MemoryStore>> {
        self.cache_store.as_ref()
    }
}

/// Terminal handler of the rate-limit side-chain: reports the caller's
/// live allowances as JSON.
struct LiveRatesHandler;

#[async_trait]
impl RequestHandler for LiveRatesHandler {
    async fn serve(&self, req: GatewayRequest) -> GatewayResponse {
        let session = context::get::<SessionState>(&req)
            .cloned()
            .unwrap_or_default();

        axum::Json(serde_json::json!({
            "quota": {
                "quota_max": session.quota_max,
                "quota_remaining": session.quota_remaining,
            },
            "rate_limit": {
                "rate": session.rate,
                "per": session.per,
            },
        }))
        .into_response()
    }
}

/// Single tracing wrapper naming the span after the API.
struct TracedHandler {
    api_name: String,
    inner: Arc<dyn RequestHandler>,
}

#[async_trait]
impl RequestHandler for TracedHandler {
    async fn serve(&self, req: GatewayRequest) -> GatewayResponse {
        let span = tracing::info_span!("api", name = %self.api_name);
        self.inner.serve(req).instrument(span).await
    }
}

/// OpenTelemetry wrapper with descriptor-derived span attributes.
struct OtelHandler {
    api_name: String,
    api_id: String,
    org_id: String,
    inner: Arc<dyn RequestHandler>,
}

#[async_trait]
impl RequestHandler for OtelHandler {
    async fn serve(&self, req: GatewayRequest) -> GatewayResponse {
        let span = tracing::info_span!(
            "api",
            name = %self.api_name,
            api_id = %self.api_id,
            org_id = %self.org_id,
            otel.kind = "server",
        );
        self.inner.serve(req).instrument(span).await
    }
}

impl Gateway {
    /// Compose the pipeline for one descriptor.
    ///
    /// Mutates the descriptor in place (normalisation and listen-path
    /// arbitration) before freezing it into the stages.
    pub(crate) fn process_spec(
        &self,
        api: &mut ApiDescriptor,
        apis_by_listen: &mut HashMap<String, usize>,
        gs: &GeneralStores,
        opts: Vec<ProcessOption>,
    ) -> ChainObject {
        let options = build_options(opts);
        let config = self.config();

        // Upstream TLS bounds: cap at 1.2 and never let min exceed max.
        if api.proxy.transport.ssl_max_version > 0 {
            api.proxy.transport.ssl_max_version = TLS12;
        }
        if api.proxy.transport.ssl_min_version > api.proxy.transport.ssl_max_version {
            api.proxy.transport.ssl_max_version = api.proxy.transport.ssl_min_version;
        }

        if !api.tag_headers.is_empty() {
            api.tag_headers = api
                .tag_headers
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect();
        }

        if self.skip_descriptor_because_invalid(api) {
            tracing::warn!(api_id = %api.api_id, api_name = %api.name, "API not valid, skipped!");
            return ChainObject::skipped();
        }

        let mut chain_def = ChainObject::default();

        // Expose the API only to looping.
        if api.internal {
            chain_def.skip = true;
        }

        self.arbitrate_listen_path(api, apis_by_listen);

        let hosts = if api.proxy.enable_load_balancing && !api.proxy.targets.is_empty() {
            Some(HostList::new(api.proxy.targets.clone()))
        } else {
            None
        };

        let (stores, enforce_org_data_age) = bind_stores(api, gs);
        if enforce_org_data_age {
            self.set_enforce_org_data_age();
        }

        // Hook lists are composed from a working copy; bundle extraction
        // relocates native plugin paths.
        let mut mw = api.custom_middleware.clone();
        let bundle_prefix = if api.uses_bundle() {
            format!("{BUNDLE_CACHE_DIR}/{}-{}", api.api_id, mw.bundle)
        } else {
            String::new()
        };
        if mw.driver == MiddlewareDriver::GoPlugin && !bundle_prefix.is_empty() {
            mw.auth_check.path = join_bundle_path(&bundle_prefix, &mw.auth_check.path);
            fix_hook_paths(&bundle_prefix, &mut mw.pre);
            fix_hook_paths(&bundle_prefix, &mut mw.post);
            fix_hook_paths(&bundle_prefix, &mut mw.post_auth);
            fix_hook_paths(&bundle_prefix, &mut mw.response);
        }

        // Already vetted by the validator.
        let target = match Url::parse(&api.proxy.target_url) {
            Ok(target) => target,
            Err(e) => {
                tracing::error!(api_id = %api.api_id, error = %e, "couldn't parse target URL");
                return ChainObject::skipped();
            }
        };

        let api = Arc::new(api.clone());
        tracing::debug!(api_id = %api.api_id, api_name = %api.name, "Initializing API");

        let proxy: Arc<dyn RequestHandler> = if api.has_version_overrides() {
            tracing::info!(api_id = %api.api_id, "Multi target enabled");
            Arc::new(MultiTargetProxy::new(&api, target.clone(), self.client()))
        } else {
            Arc::new(ReverseProxy::new(target.clone(), self.client(), hosts))
        };

        chain_def.response_chain = mw
            .response
            .iter()
            .map(|def| {
                Arc::new(CustomMiddleware::from_definition(
                    api.clone(),
                    HookKind::Response,
                    def,
                    mw.driver,
                )) as Arc<dyn Middleware>
            })
            .collect();

        let cache_store = cache_store_for(&api.api_id);

        let mut chain_array: Vec<Arc<dyn Middleware>> = Vec::new();
        let mut auth_array: Vec<Arc<dyn Middleware>> = Vec::new();

        if api.auth.is_keyless() {
            chain_def.open = true;
            tracing::info!(api_id = %api.api_id, "Checking security policy: Open");
        }

        append_enabled(&mut chain_array, VersionCheck { api: api.clone() });
        append_enabled(&mut chain_array, CorsMiddleware { api: api.clone() });

        for def in &mw.pre {
            append_enabled(
                &mut chain_array,
                CustomMiddleware::from_definition(api.clone(), HookKind::Pre, def, mw.driver),
            );
        }

        append_enabled(&mut chain_array, RateCheck { api: api.clone() });
        append_enabled(&mut chain_array, IpAllowList { api: api.clone() });
        append_enabled(&mut chain_array, IpDenyList { api: api.clone() });
        append_enabled(&mut chain_array, CertificateCheck { api: api.clone() });
        append_enabled(&mut chain_array, OrganizationMonitor { api: api.clone() });
        append_enabled(&mut chain_array, RequestSizeLimit { api: api.clone() });
        append_enabled(&mut chain_array, ContextVars { api: api.clone() });
        append_enabled(&mut chain_array, TrackEndpoint { api: api.clone() });

        if !api.auth.is_keyless() {
            // Select the keying methods used for session lookups.
            if append_enabled(
                &mut auth_array,
                OauthKeyExists {
                    api: api.clone(),
                    session_store: stores.session.clone(),
                },
            ) {
                tracing::info!(api_id = %api.api_id, "Checking security policy: OAuth");
            }

            if append_enabled(
                &mut auth_array,
                ExternalOauth {
                    api: api.clone(),
                    session_store: stores.session.clone(),
                },
            ) {
                tracing::info!(api_id = %api.api_id, "Checking security policy: External OAuth");
            }

            if append_enabled(
                &mut auth_array,
                BasicAuthValid {
                    api: api.clone(),
                    session_store: stores.auth.clone(),
                },
            ) {
                tracing::info!(api_id = %api.api_id, "Checking security policy: Basic");
            }

            if append_enabled(
                &mut auth_array,
                HttpSignatureValidation {
                    api: api.clone(),
                    session_store: stores.auth.clone(),
                },
            ) {
                tracing::info!(api_id = %api.api_id, "Checking security policy: HMAC");
            }

            if append_enabled(
                &mut auth_array,
                JwtMiddleware {
                    api: api.clone(),
                    session_store: stores.session.clone(),
                },
            ) {
                tracing::info!(api_id = %api.api_id, "Checking security policy: JWT");
            }

            if append_enabled(
                &mut auth_array,
                OpenIdMiddleware {
                    api: api.clone(),
                    session_store: stores.session.clone(),
                },
            ) {
                tracing::info!(api_id = %api.api_id, "Checking security policy: OpenID");
            }

            if api.auth.use_custom_plugin_auth && !mw.auth_check.disabled {
                match mw.driver {
                    MiddlewareDriver::Otto => {
                        tracing::info!(api_id = %api.api_id, "Checking security policy: JS Plugin");
                        auth_array.push(Arc::new(CustomMiddleware::from_definition(
                            api.clone(),
                            HookKind::AuthCheck,
                            &mw.auth_check,
                            mw.driver,
                        )));
                    }
                    _ => {
                        append_enabled(
                            &mut auth_array,
                            CustomMiddleware::from_definition(
                                api.clone(),
                                HookKind::AuthCheck,
                                &mw.auth_check,
                                mw.driver,
                            ),
                        );
                    }
                }
            }

            if api.auth.use_standard_auth || auth_array.is_empty() {
                tracing::info!(api_id = %api.api_id, "Checking security policy: Token");
                auth_array.push(Arc::new(TokenAuth {
                    api: api.clone(),
                    session_store: stores.session.clone(),
                }));
            }

            chain_array.extend(auth_array.iter().cloned());

            // Edge mode: warm the org session expiry before traffic lands.
            if config.slave_options.use_rpc {
                tracing::debug!(org_id = %api.org_id, "Prefetching org session expiry");
                let _ = stores.org.get(&api.org_id);
            }

            for def in &mw.post_auth {
                append_enabled(
                    &mut chain_array,
                    CustomMiddleware::from_definition(api.clone(), HookKind::PostAuth, def, mw.driver),
                );
            }

            append_enabled(&mut chain_array, StripAuth { api: api.clone() });
            append_enabled(&mut chain_array, KeyExpired { api: api.clone() });
            append_enabled(&mut chain_array, AccessRightsCheck { api: api.clone() });
            append_enabled(&mut chain_array, GranularAccess { api: api.clone() });
            append_enabled(&mut chain_array, RateLimitAndQuota { api: api.clone() });
        }

        append_enabled(
            &mut chain_array,
            RateLimitForApi {
                api: api.clone(),
                quota_key: options.quota_key,
            },
        );
        append_enabled(&mut chain_array, GraphQlMiddleware { api: api.clone() });

        if !api.auth.is_keyless() {
            append_enabled(&mut chain_array, GraphQlComplexity { api: api.clone() });
            append_enabled(&mut chain_array, GraphQlGranularAccess { api: api.clone() });
        }

        append_enabled(&mut chain_array, UpstreamBasicAuth { api: api.clone() });
        append_enabled(&mut chain_array, UpstreamOauth { api: api.clone() });

        append_enabled(&mut chain_array, ValidateJson { api: api.clone() });
        append_enabled(&mut chain_array, ValidateRequest { api: api.clone() });
        append_enabled(&mut chain_array, PersistGraphQlOperation { api: api.clone() });
        append_enabled(&mut chain_array, TransformBody { api: api.clone() });
        append_enabled(&mut chain_array, TransformJq { api: api.clone() });
        append_enabled(&mut chain_array, TransformHeaders { api: api.clone() });
        append_enabled(&mut chain_array, UrlRewrite { api: api.clone() });
        append_enabled(&mut chain_array, TransformMethod { api: api.clone() });

        // Earliest the chain may answer without an upstream round-trip.
        append_enabled(&mut chain_array, MockResponse { api: api.clone() });
        append_enabled(
            &mut chain_array,
            CacheResponder {
                api: api.clone(),
                store: cache_store.clone(),
            },
        );
        append_enabled(&mut chain_array, VirtualEndpoint { api: api.clone() });
        append_enabled(&mut chain_array, RequestSigning { api: api.clone() });
        append_enabled(&mut chain_array, CustomMiddleware::endpoint_slot(api.clone()));

        for def in &mw.post {
            append_enabled(
                &mut chain_array,
                CustomMiddleware::from_definition(api.clone(), HookKind::Post, def, mw.driver),
            );
        }

        let success = SuccessHandler {
            api: api.clone(),
            proxy,
        };
        let sink = Arc::new(LoopDispatcher::new(
            api.clone(),
            target,
            success,
            Arc::downgrade(self.registry()),
        ));
        let chain: Arc<dyn RequestHandler> = Arc::new(Chain::new(chain_array, sink));

        if !api.auth.is_keyless() {
            let mut simple_array: Vec<Arc<dyn Middleware>> = Vec::new();
            append_enabled(&mut simple_array, IpAllowList { api: api.clone() });
            append_enabled(&mut simple_array, IpDenyList { api: api.clone() });
            append_enabled(&mut simple_array, OrganizationMonitor { api: api.clone() });
            append_enabled(&mut simple_array, VersionCheck { api: api.clone() });
            simple_array.extend(auth_array.iter().cloned());
            append_enabled(&mut simple_array, KeyExpired { api: api.clone() });
            append_enabled(&mut simple_array, AccessRightsCheck { api: api.clone() });

            tracing::debug!(
                api_id = %api.api_id,
                endpoint = %format!("{}{}", api.proxy.listen_path, RATE_LIMIT_ENDPOINT),
                "Rate limit endpoint is set"
            );

            chain_def.rate_limit_handler =
                Some(Arc::new(Chain::new(simple_array, Arc::new(LiveRatesHandler))));
        }

        tracing::debug!(api_id = %api.api_id, listen_path = %api.proxy.listen_path, "Setting listen path");

        // At most one wrapper applies.
        chain_def.handler = Some(if config.tracing.enabled {
            Arc::new(TracedHandler {
                api_name: api.name.clone(),
                inner: chain,
            })
        } else if config.opentelemetry.enabled {
            Arc::new(OtelHandler {
                api_name: api.name.clone(),
                api_id: api.api_id.clone(),
                org_id: api.org_id.clone(),
                inner: chain,
            })
        } else {
            chain
        });

        chain_def.cache_store = Some(cache_store);

        if api.analytics_plugin.enabled {
            tracing::debug!(
                api_id = %api.api_id,
                plugin = %api.analytics_plugin.plugin_path,
                func = %api.analytics_plugin.func_name,
                "Loaded analytics plugin"
            );
        }

        tracing::info!(
            api_id = %api.api_id,
            api_name = %api.name,
            org_id = %api.org_id,
            "API Loaded"
        );

        chain_def
    }

    /// Deterministic listen-path disambiguation.
    ///
    /// The previously loaded descriptor keeps its path (stability across
    /// reloads); any other claimant gains a `-<api_id>` suffix, then `_`
    /// until the claimed key is unique. Terminates because the suffix
    /// grows monotonically.
    fn arbitrate_listen_path(
        &self,
        api: &mut ApiDescriptor,
        apis_by_listen: &mut HashMap<String, usize>,
    ) {
        let mut path_modified = false;
        loop {
            let hash = crate::loader::generate_domain_path(api.api_domain(), &api.proxy.listen_path);
            if apis_by_listen.get(&hash).copied().unwrap_or(0) < 2 {
                break;
            }

            if !path_modified {
                if let Some(prev) = self.get_api_spec(&api.api_id) {
                    if prev.proxy.listen_path == api.proxy.listen_path {
                        // This id already held this path; let it keep it.
                        break;
                    }
                }
                api.proxy.listen_path = format!("{}-{}", api.proxy.listen_path, api.api_id);
                path_modified = true;
            } else {
                api.proxy.listen_path.push('_');
            }

            // Relinquish the colliding key and claim the mutated one, so
            // the next pass (and later descriptors) see the real counts.
            if let Some(count) = apis_by_listen.get_mut(&hash) {
                *count = count.saturating_sub(1);
            }
            let hash = crate::loader::generate_domain_path(api.api_domain(), &api.proxy.listen_path);
            *apis_by_listen.entry(hash).or_insert(0) += 1;
        }

        if path_modified {
            tracing::error!(
                api_id = %api.api_id,
                listen_path = %api.proxy.listen_path,
                "Listen path collision, changed listen path"
            );
        }
    }
}
