//! The standard middleware stage catalogue.
//!
//! Every stage decides its own applicability from the descriptor; the
//! composer appends whatever enables itself. Policy bodies (rate
//! algorithms, token cryptography, transform templates) live behind these
//! stages and are not part of the assembler.

use async_trait::async_trait;
use axum::http::{header, StatusCode};
use std::sync::Arc;

use crate::apidef::ApiDescriptor;
use crate::middleware::context::{self, SessionState, VersionTag};
use crate::middleware::{Flow, GatewayRequest, Middleware, MiddlewareError};
use crate::storage::KeyStore;

/// Declares a flag-gated stage whose work happens in an external
/// collaborator; the assembler only decides whether it runs.
macro_rules! flag_stage {
    ($(#[$doc:meta])* $ty:ident, $name:literal, $enabled:expr) => {
        $(#[$doc])*
        pub struct $ty {
            pub api: Arc<ApiDescriptor>,
        }

        #[async_trait]
        impl Middleware for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn enabled(&self) -> bool {
                let enabled: fn(&ApiDescriptor) -> bool = $enabled;
                enabled(&self.api)
            }

            async fn apply(&self, req: GatewayRequest) -> Result<Flow, MiddlewareError> {
                Ok(Flow::Continue(req))
            }
        }
    };
}

/// Resolves the requested API version and stamps it on the request.
pub struct VersionCheck {
    pub api: Arc<ApiDescriptor>,
}

#[async_trait]
impl Middleware for VersionCheck {
    fn name(&self) -> &'static str {
        "VersionCheck"
    }

    async fn apply(&self, mut req: GatewayRequest) -> Result<Flow, MiddlewareError> {
        if self.api.version_data.not_versioned {
            return Ok(Flow::Continue(req));
        }

        let from_header = req
            .headers()
            .get("x-api-version")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let version = from_header.or_else(|| {
            let query = req.uri().query().unwrap_or_default();
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(k, _)| k == "version")
                .map(|(_, v)| v.into_owned())
        });

        if let Some(version) = version {
            if !self.api.version_data.versions.is_empty()
                && !self.api.version_data.versions.contains_key(&version)
            {
                return Err(MiddlewareError::new(
                    StatusCode::FORBIDDEN,
                    "Version information not found",
                ));
            }
            context::set(&mut req, VersionTag(version));
        }

        Ok(Flow::Continue(req))
    }
}

flag_stage!(
    /// Cross-origin request handling.
    CorsMiddleware,
    "CORSMiddleware",
    |api| api.cors.enable
);

flag_stage!(
    /// Global connection-rate admission check.
    RateCheck,
    "RateCheckMW",
    |_| true
);

flag_stage!(
    IpAllowList,
    "IPWhiteListMiddleware",
    |api| api.ip_access.enable_allow_list && !api.ip_access.allowed_ips.is_empty()
);

flag_stage!(
    IpDenyList,
    "IPBlackListMiddleware",
    |api| api.ip_access.enable_deny_list && !api.ip_access.denied_ips.is_empty()
);

flag_stage!(
    /// Client certificate verification for mTLS APIs.
    CertificateCheck,
    "CertificateCheckMW",
    |api| api.use_mutual_tls_auth
);

flag_stage!(
    /// Organisation quota/health monitor.
    OrganizationMonitor,
    "OrganizationMonitor",
    |api| !api.org_id.is_empty()
);

/// Rejects requests whose declared body size exceeds the API limit.
pub struct RequestSizeLimit {
    pub api: Arc<ApiDescriptor>,
}

#[async_trait]
impl Middleware for RequestSizeLimit {
    fn name(&self) -> &'static str {
        "RequestSizeLimitMiddleware"
    }

    fn enabled(&self) -> bool {
        self.api.global_size_limit > 0
    }

    async fn apply(&self, req: GatewayRequest) -> Result<Flow, MiddlewareError> {
        let declared = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);

        if declared > self.api.global_size_limit {
            return Err(MiddlewareError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request is too large",
            ));
        }

        Ok(Flow::Continue(req))
    }
}

flag_stage!(
    /// Extracts request fields into template context variables.
    ContextVars,
    "MiddlewareContextVars",
    |api| api.enable_context_vars
);

flag_stage!(
    /// Per-endpoint analytics tracking.
    TrackEndpoint,
    "TrackEndpointMiddleware",
    |api| api.track_endpoints
);

// --- Authentication block -------------------------------------------------
//
// Each scheme contributes a stage when its flag is on; scheme internals
// (token cryptography, signature math, IdP round-trips) are collaborator
// concerns. The stages carry the session store selected by the binder.

macro_rules! auth_stage {
    ($(#[$doc:meta])* $ty:ident, $name:literal, $enabled:expr) => {
        $(#[$doc])*
        pub struct $ty {
            pub api: Arc<ApiDescriptor>,
            pub session_store: Arc<dyn KeyStore>,
        }

        #[async_trait]
        impl Middleware for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn enabled(&self) -> bool {
                let enabled: fn(&ApiDescriptor) -> bool = $enabled;
                enabled(&self.api)
            }

            async fn apply(&self, req: GatewayRequest) -> Result<Flow, MiddlewareError> {
                Ok(Flow::Continue(req))
            }
        }
    };
}

auth_stage!(OauthKeyExists, "Oauth2KeyExists", |api| api.auth.use_oauth2);
auth_stage!(ExternalOauth, "ExternalOAuthMiddleware", |api| api
    .auth
    .use_external_oauth);
auth_stage!(BasicAuthValid, "BasicAuthKeyIsValid", |api| api
    .auth
    .use_basic_auth);
auth_stage!(HttpSignatureValidation, "HTTPSignatureValidationMiddleware", |api| api
    .auth
    .enable_signature_checking);
auth_stage!(JwtMiddleware, "JWTMiddleware", |api| api.auth.enable_jwt);
auth_stage!(OpenIdMiddleware, "OpenIDMW", |api| api.auth.use_openid);

/// Default bearer-token authentication. Appended when no other scheme is
/// enabled or standard auth is forced.
pub struct TokenAuth {
    pub api: Arc<ApiDescriptor>,
    pub session_store: Arc<dyn KeyStore>,
}

#[async_trait]
impl Middleware for TokenAuth {
    fn name(&self) -> &'static str {
        "AuthKey"
    }

    async fn apply(&self, mut req: GatewayRequest) -> Result<Flow, MiddlewareError> {
        let token = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).to_string());

        let Some(token) = token else {
            return Err(MiddlewareError::new(
                StatusCode::UNAUTHORIZED,
                "Authorization field missing",
            ));
        };

        let session = self
            .session_store
            .get(&token)
            .and_then(|raw| serde_json::from_str::<SessionState>(&raw).ok())
            .unwrap_or_default();
        context::set(&mut req, session);

        Ok(Flow::Continue(req))
    }
}

// --- Identity / authorization ---------------------------------------------

/// Removes client credentials before the upstream sees the request.
pub struct StripAuth {
    pub api: Arc<ApiDescriptor>,
}

#[async_trait]
impl Middleware for StripAuth {
    fn name(&self) -> &'static str {
        "StripAuth"
    }

    fn enabled(&self) -> bool {
        self.api.auth.strip_auth_data
    }

    async fn apply(&self, mut req: GatewayRequest) -> Result<Flow, MiddlewareError> {
        req.headers_mut().remove(header::AUTHORIZATION);
        Ok(Flow::Continue(req))
    }
}

flag_stage!(KeyExpired, "KeyExpired", |_| true);
flag_stage!(AccessRightsCheck, "AccessRightsCheck", |_| true);
flag_stage!(GranularAccess, "GranularAccessMiddleware", |_| true);
flag_stage!(RateLimitAndQuota, "RateLimitAndQuotaCheck", |_| true);

/// API-level rate limiter, independent of caller identity.
pub struct RateLimitForApi {
    pub api: Arc<ApiDescriptor>,
    /// Overrides the quota counter key when supplied at load time.
    pub quota_key: String,
}

#[async_trait]
impl Middleware for RateLimitForApi {
    fn name(&self) -> &'static str {
        "RateLimitForAPI"
    }

    fn enabled(&self) -> bool {
        self.api.global_rate_limit.enabled && self.api.global_rate_limit.rate > 0.0
    }

    async fn apply(&self, req: GatewayRequest) -> Result<Flow, MiddlewareError> {
        Ok(Flow::Continue(req))
    }
}

// --- GraphQL ---------------------------------------------------------------

flag_stage!(GraphQlMiddleware, "GraphQLMiddleware", |api| api.graphql.enabled);
flag_stage!(GraphQlComplexity, "GraphQLComplexityMiddleware", |api| api
    .graphql
    .enabled);
flag_stage!(GraphQlGranularAccess, "GraphQLGranularAccessMiddleware", |api| api
    .graphql
    .enabled);

// --- Upstream auth decorators ---------------------------------------------

flag_stage!(UpstreamBasicAuth, "UpstreamBasicAuth", |api| api
    .upstream_auth
    .basic_enabled);
flag_stage!(UpstreamOauth, "UpstreamOAuth", |api| api.upstream_auth.oauth_enabled);

// --- Body and shape transforms --------------------------------------------

flag_stage!(ValidateJson, "ValidateJSON", |api| api.transforms.validate_json);
flag_stage!(ValidateRequest, "ValidateRequest", |api| api
    .transforms
    .validate_request);
flag_stage!(PersistGraphQlOperation, "PersistGraphQLOperationMiddleware", |api| api
    .transforms
    .persist_graphql);
flag_stage!(TransformBody, "TransformMiddleware", |api| api
    .transforms
    .transform_body);
flag_stage!(TransformJq, "TransformJQMiddleware", |api| api.transforms.transform_jq);
flag_stage!(TransformHeaders, "TransformHeaders", |api| api
    .transforms
    .transform_headers);
flag_stage!(UrlRewrite, "URLRewriteMiddleware", |api| api.transforms.url_rewrite);
flag_stage!(TransformMethod, "TransformMethod", |api| api
    .transforms
    .transform_method);

// --- Short-circuit responders ---------------------------------------------

flag_stage!(MockResponse, "MockResponseMiddleware", |api| api.mock_response_enabled);

/// Serves cached responses; owns this API's cache store.
pub struct CacheResponder {
    pub api: Arc<ApiDescriptor>,
    pub store: Arc<dyn KeyStore>,
}

#[async_trait]
impl Middleware for CacheResponder {
    fn name(&self) -> &'static str {
        "RedisCacheMiddleware"
    }

    fn enabled(&self) -> bool {
        self.api.cache.enable_cache
    }

    async fn apply(&self, req: GatewayRequest) -> Result<Flow, MiddlewareError> {
        Ok(Flow::Continue(req))
    }
}

flag_stage!(VirtualEndpoint, "VirtualEndpoint", |api| api.enable_virtual_endpoints);
flag_stage!(RequestSigning, "RequestSigning", |api| api.request_signing_enabled);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apidef::VersionInfo;
    use crate::storage::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;

    fn api_with<F: FnOnce(&mut ApiDescriptor)>(f: F) -> Arc<ApiDescriptor> {
        let mut api = ApiDescriptor::default();
        f(&mut api);
        Arc::new(api)
    }

    #[test]
    fn test_flag_stages_follow_descriptor() {
        let off = CorsMiddleware {
            api: api_with(|_| {}),
        };
        assert!(!off.enabled());

        let on = CorsMiddleware {
            api: api_with(|a| a.cors.enable = true),
        };
        assert!(on.enabled());
    }

    #[tokio::test]
    async fn test_version_check_rejects_unknown_version() {
        let api = api_with(|a| {
            a.version_data
                .versions
                .insert("v1".into(), VersionInfo::default());
        });
        let stage = VersionCheck { api };

        let req = Request::builder()
            .uri("http://gw.local/svc?version=v9")
            .body(Body::empty())
            .unwrap();
        let err = match stage.apply(req).await {
            Err(e) => e,
            Ok(_) => panic!("unknown version must be rejected"),
        };
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_version_check_stamps_tag() {
        let api = api_with(|a| {
            a.version_data
                .versions
                .insert("v2".into(), VersionInfo::default());
        });
        let stage = VersionCheck { api };

        let req = Request::builder()
            .uri("http://gw.local/svc")
            .header("x-api-version", "v2")
            .body(Body::empty())
            .unwrap();
        match stage.apply(req).await.unwrap() {
            Flow::Continue(req) => {
                assert_eq!(context::get::<VersionTag>(&req).unwrap().0, "v2");
            }
            Flow::Respond(_) => panic!("expected pass-through"),
        }
    }

    #[tokio::test]
    async fn test_token_auth_requires_header() {
        let stage = TokenAuth {
            api: api_with(|_| {}),
            session_store: Arc::new(MemoryStore::new("apikey-", false)),
        };
        let req = Request::new(Body::empty());
        let err = stage.apply(req).await.err().unwrap();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_token_auth_attaches_session() {
        let store = Arc::new(MemoryStore::new("apikey-", false));
        store.set(
            "k1",
            r#"{"rate":10.0,"per":60.0,"quota_max":100,"quota_remaining":99}"#.into(),
        );
        let stage = TokenAuth {
            api: api_with(|_| {}),
            session_store: store,
        };

        let req = Request::builder()
            .header(header::AUTHORIZATION, "Bearer k1")
            .body(Body::empty())
            .unwrap();
        match stage.apply(req).await.unwrap() {
            Flow::Continue(req) => {
                let session = context::get::<SessionState>(&req).unwrap();
                assert_eq!(session.quota_remaining, 99);
            }
            Flow::Respond(_) => panic!("expected pass-through"),
        }
    }

    #[tokio::test]
    async fn test_size_limit_rejects_large_bodies() {
        let stage = RequestSizeLimit {
            api: api_with(|a| a.global_size_limit = 8),
        };
        assert!(stage.enabled());

        let req = Request::builder()
            .header(header::CONTENT_LENGTH, "1024")
            .body(Body::empty())
            .unwrap();
        let err = stage.apply(req).await.err().unwrap();
        assert_eq!(err.status, StatusCode::PAYLOAD_TOO_LARGE);
    }
}
