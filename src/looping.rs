//! Internal-scheme looping.
//!
//! # Responsibilities
//! - Detect requests re-entering the gateway through the reserved scheme
//! - Resolve the target chain (self or a fuzzy-matched API)
//! - Enforce the per-request loop depth cap
//! - Route internal-scheme upstream targets back into the live table
//!
//! # Design Decisions
//! - Loop bookkeeping lives in a request extension, never in shared state
//! - The dispatcher holds a weak registry reference so unloaded chains
//!   can actually drop

use async_trait::async_trait;
use axum::http::uri::{PathAndQuery, Scheme, Uri};
use axum::http::Method;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use url::Url;

use crate::apidef::ApiDescriptor;
use crate::gateway::ApiRegistry;
use crate::middleware::context::{
    self, InternalRedirectTarget, LoopState, OrigRequestUrl, TransformRequestMethod,
    UrlRewriteTarget, VersionTag,
};
use crate::middleware::{GatewayRequest, GatewayResponse, RequestHandler};
use crate::proxy::{internal_error, sanitize_proxy_path, SuccessHandler};

/// Reserved URL scheme that triggers loop dispatch.
pub const INTERNAL_SCHEME: &str = "gantry";

/// Host literal addressing the API's own chain.
pub const SELF_TARGET_HOST: &str = "self";

/// Depth cap applied when the request does not override it.
pub const DEFAULT_LOOP_LIMIT: u32 = 5;

enum LoopCheck {
    NotLoop,
    Hop,
    TooDeep(u32),
}

fn check_loop(req: &GatewayRequest) -> LoopCheck {
    if req.uri().scheme_str() != Some(INTERNAL_SCHEME) {
        return LoopCheck::NotLoop;
    }

    let state = context::get::<LoopState>(req).cloned().unwrap_or_default();
    let limit = if state.limit == 0 {
        DEFAULT_LOOP_LIMIT
    } else {
        state.limit
    };

    // A cap of N admits exactly N passes: the entry at level N fails.
    if state.level >= limit {
        LoopCheck::TooDeep(limit)
    } else {
        LoopCheck::Hop
    }
}

fn loop_depth_error(limit: u32) -> GatewayResponse {
    internal_error(&format!(
        "Loop level too deep. Found more than {limit} loops in single request"
    ))
}

/// Canonical name used to address an API in an internal URL: category
/// suffix trimmed, non-alphanumerics removed, matched case-insensitively.
pub fn api_looping_name(name: &str) -> String {
    replace_non_alphanumeric(trim_categories(name))
}

/// Cut the name at one character before the first `#`, dropping the
/// separator character the category marker rides on.
fn trim_categories(name: &str) -> &str {
    match name.find('#') {
        Some(idx) => {
            let mut cut = idx.saturating_sub(1);
            while cut > 0 && !name.is_char_boundary(cut) {
                cut -= 1;
            }
            &name[..cut]
        }
        None => name,
    }
}

fn replace_non_alphanumeric(name: &str) -> String {
    name.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// Find a live API by id, internal object id, or canonical looping name.
pub fn fuzzy_find_api(registry: &ApiRegistry, search: &str) -> Option<Arc<ApiDescriptor>> {
    if search.is_empty() {
        return None;
    }

    registry.descriptors().into_iter().find(|api| {
        api.api_id == search
            || (!api.internal_id.is_empty() && api.internal_id == search)
            || api_looping_name(&api.name).eq_ignore_ascii_case(search)
    })
}

/// Main handler for a live API addressed by name or id.
pub fn find_internal_handler(
    registry: &ApiRegistry,
    name_or_id: &str,
) -> Option<(Arc<dyn RequestHandler>, Arc<ApiDescriptor>)> {
    let api = fuzzy_find_api(registry, name_or_id)?;
    let chain = registry.handle(&api.api_id)?;
    let handler = chain.handler.clone()?;
    Some((handler, api))
}

/// Terminal dispatcher placed at the end of every chain.
///
/// Decides between upstream dispatch (the success handler), an internal
/// loop hop, and internal-scheme upstream targets.
pub struct LoopDispatcher {
    api: Arc<ApiDescriptor>,
    /// Parsed upstream target; internal-scheme targets re-enter the table.
    target: Url,
    success: SuccessHandler,
    registry: Weak<ApiRegistry>,
}

impl LoopDispatcher {
    pub fn new(
        api: Arc<ApiDescriptor>,
        target: Url,
        success: SuccessHandler,
        registry: Weak<ApiRegistry>,
    ) -> Self {
        Self {
            api,
            target,
            success,
            registry,
        }
    }

    /// Resolve the chain a loop hop re-enters.
    fn resolve_loop_target(
        &self,
        req: &mut GatewayRequest,
        host: &str,
    ) -> Result<Arc<dyn RequestHandler>, GatewayResponse> {
        let Some(registry) = self.registry.upgrade() else {
            return Err(internal_error("Can't detect loop target"));
        };

        if host == SELF_TARGET_HOST {
            let mut state = context::get::<LoopState>(req).cloned().unwrap_or_default();
            state.self_looping = true;
            context::set(req, state);

            return registry
                .handle(&self.api.api_id)
                .and_then(|chain| chain.handler.clone())
                .ok_or_else(|| internal_error("Can't detect loop target"));
        }

        context::take::<VersionTag>(req);

        match find_internal_handler(&registry, host) {
            Some((handler, _)) => Ok(handler),
            None => Err(internal_error("Can't detect loop target")),
        }
    }

    /// One internal hop: rewrite the scheme, apply request overrides,
    /// bump the level and re-enter the resolved chain.
    async fn dispatch_loop(&self, mut req: GatewayRequest) -> GatewayResponse {
        let host = req.uri().host().unwrap_or_default().to_string();

        let query: Vec<(String, String)> = req
            .uri()
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        if let Err(resp) = rewrite_scheme_to_http(&mut req) {
            return resp;
        }

        if let Some((_, method)) = query.iter().find(|(k, _)| k == "method") {
            if let Ok(method) = Method::from_str(method) {
                *req.method_mut() = method;
            }
        }

        let handler = match self.resolve_loop_target(&mut req, &host) {
            Ok(handler) => handler,
            Err(resp) => return resp,
        };

        // Parse failures deliberately fall back to 0, i.e. the default cap.
        let loop_limit = query
            .iter()
            .find(|(k, _)| k == "loop_limit")
            .and_then(|(_, v)| v.parse::<u32>().ok())
            .unwrap_or(0);
        let check_limits = query
            .iter()
            .any(|(k, v)| k == "check_limits" && v == "true");

        let mut state = context::get::<LoopState>(&req).cloned().unwrap_or_default();
        state.check_limits = check_limits;

        if let Some(OrigRequestUrl(orig)) = context::take::<OrigRequestUrl>(&mut req) {
            restore_host_and_query(&mut req, &orig);
        }

        state.level += 1;
        state.limit = loop_limit;
        context::set(&mut req, state);

        handler.serve(req).await
    }

    /// Upstream target uses the internal scheme: look the API up once,
    /// stash the redirect destination and re-enter its chain.
    async fn dispatch_internal_target(&self, mut req: GatewayRequest) -> GatewayResponse {
        let Some(registry) = self.registry.upgrade() else {
            return internal_error("Couldn't detect target");
        };

        // Bound the re-entry the same way loop hops are bounded; the
        // request's own query may override the cap.
        let mut state = context::get::<LoopState>(&req).cloned().unwrap_or_default();
        if state.limit == 0 {
            state.limit = req
                .uri()
                .query()
                .and_then(|q| {
                    url::form_urlencoded::parse(q.as_bytes())
                        .find(|(k, _)| k == "loop_limit")
                        .and_then(|(_, v)| v.parse::<u32>().ok())
                })
                .unwrap_or(0);
        }
        let limit = if state.limit == 0 {
            DEFAULT_LOOP_LIMIT
        } else {
            state.limit
        };
        if state.level >= limit {
            return loop_depth_error(limit);
        }

        let host = self.target.host_str().unwrap_or_default();
        let found = if host == SELF_TARGET_HOST {
            registry
                .handle(&self.api.api_id)
                .and_then(|chain| chain.handler.clone())
                .map(|handler| (handler, self.api.clone()))
        } else {
            find_internal_handler(&registry, host)
        };
        let Some((handler, _target_api)) = found else {
            return internal_error("Couldn't detect target");
        };

        let previous = context::get::<InternalRedirectTarget>(&req).cloned();
        let redirect = match redirect_target_url(&self.target, previous.as_ref()) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::error!(api_id = %self.api.api_id, error = %e, "failed to create internal redirect url");
                return internal_error("Failed to perform internal redirect");
            }
        };

        sanitize_proxy_path(&self.api, &mut req);
        context::set(&mut req, InternalRedirectTarget(redirect));
        context::take::<VersionTag>(&mut req);

        state.level += 1;
        context::set(&mut req, state);

        handler.serve(req).await
    }
}

#[async_trait]
impl RequestHandler for LoopDispatcher {
    async fn serve(&self, mut req: GatewayRequest) -> GatewayResponse {
        if let Some(UrlRewriteTarget(target)) = context::take::<UrlRewriteTarget>(&mut req) {
            *req.uri_mut() = target;
        }
        if let Some(TransformRequestMethod(method)) =
            context::take::<TransformRequestMethod>(&mut req)
        {
            *req.method_mut() = method;
        }

        match check_loop(&req) {
            LoopCheck::TooDeep(limit) => loop_depth_error(limit),
            LoopCheck::Hop => self.dispatch_loop(req).await,
            LoopCheck::NotLoop => {
                if self.target.scheme() == INTERNAL_SCHEME {
                    self.dispatch_internal_target(req).await
                } else {
                    self.success.serve(req).await
                }
            }
        }
    }
}

/// Next-hop destination for an internal-scheme upstream target.
fn redirect_target_url(
    target: &Url,
    previous: Option<&InternalRedirectTarget>,
) -> Result<Uri, String> {
    let host = target
        .host_str()
        .ok_or_else(|| "internal target has no host".to_string())?;

    let path = previous
        .map(|InternalRedirectTarget(uri)| uri.path().to_string())
        .unwrap_or_else(|| target.path().to_string());
    let path = if path.is_empty() { "/" } else { &path };

    Uri::from_str(&format!("http://{host}{path}")).map_err(|e| e.to_string())
}

fn rewrite_scheme_to_http(req: &mut GatewayRequest) -> Result<(), GatewayResponse> {
    let mut parts = req.uri().clone().into_parts();
    parts.scheme = Some(Scheme::HTTP);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    match Uri::from_parts(parts) {
        Ok(uri) => {
            *req.uri_mut() = uri;
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to rewrite internal scheme");
            Err(internal_error("Can't detect loop target"))
        }
    }
}

fn restore_host_and_query(req: &mut GatewayRequest, orig: &Uri) {
    let mut parts = req.uri().clone().into_parts();
    parts.authority = orig.authority().cloned();

    let path = req.uri().path();
    let pq = match orig.query() {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    };
    if let Ok(pq) = PathAndQuery::from_str(&pq) {
        parts.path_and_query = Some(pq);
    }

    if let Ok(uri) = Uri::from_parts(parts) {
        *req.uri_mut() = uri;
    }
}
