//! API descriptor definitions.
//!
//! # Responsibilities
//! - Canonical in-memory form of a routed API
//! - Serde round-trip for descriptor files and the control API
//! - Equality predicate used to decide chain reuse across reloads
//!
//! # Design Decisions
//! - Plain data, no behaviour beyond small accessors (validation and
//!   normalisation live in the loader)
//! - `PartialEq` derives are the reload comparison: an unchanged
//!   descriptor keeps its compiled chain

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Wire protocol an API terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Unset in the descriptor; treated as HTTP.
    #[serde(rename = "")]
    #[default]
    Unspecified,
    Http,
    Https,
    H2c,
    Tcp,
    Tls,
}

impl Protocol {
    /// True for the HTTP family (including unset).
    pub fn is_http(self) -> bool {
        matches!(
            self,
            Protocol::Unspecified | Protocol::Http | Protocol::Https | Protocol::H2c
        )
    }
}

/// Driver executing custom middleware hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MiddlewareDriver {
    /// In-process native plugin loaded by path/symbol.
    #[default]
    GoPlugin,
    /// Embedded scripting engine.
    Otto,
    /// Out-of-process hook dispatch.
    Coprocess,
}

/// A single custom middleware hook declaration.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MiddlewareDefinition {
    pub path: String,
    /// Symbol or class name resolved inside the plugin/script.
    pub symbol_name: String,
    pub raw_body_only: bool,
    pub disabled: bool,
}

/// Custom middleware bundle and per-hook definitions.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CustomMiddlewareConfig {
    pub driver: MiddlewareDriver,
    /// Bundle archive name; hook paths are rewritten under the bundle
    /// destination when set.
    pub bundle: String,
    pub bundle_disabled: bool,
    pub pre: Vec<MiddlewareDefinition>,
    pub post_auth: Vec<MiddlewareDefinition>,
    pub post: Vec<MiddlewareDefinition>,
    pub response: Vec<MiddlewareDefinition>,
    pub auth_check: MiddlewareDefinition,
}

/// Storage engine backing the auth or session provider.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageEngine {
    #[default]
    Default,
    Ldap,
    Rpc,
}

/// Auth/session provider selection plus engine metadata.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub storage_engine: StorageEngine,
    /// Engine-specific settings (LDAP host, ports, attribute names, ...).
    pub meta: HashMap<String, String>,
}

/// Authentication scheme toggles for one API.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// No authentication at all; the chain is open.
    pub use_keyless: bool,
    /// Force the token-auth stage even when other schemes are enabled.
    pub use_standard_auth: bool,
    pub use_oauth2: bool,
    pub use_external_oauth: bool,
    pub use_basic_auth: bool,
    /// HTTP signature (HMAC) validation.
    pub enable_signature_checking: bool,
    pub enable_jwt: bool,
    pub use_openid: bool,
    /// Custom auth hook executed through the middleware driver.
    pub use_custom_plugin_auth: bool,
    /// Remove credentials before the request reaches the upstream.
    pub strip_auth_data: bool,
}

impl AuthConfig {
    /// Open access: nothing in the auth block runs.
    pub fn is_keyless(&self) -> bool {
        self.use_keyless
    }
}

/// One named version of the API.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct VersionInfo {
    /// Replaces the API target for requests tagged with this version.
    pub override_target: String,
}

/// Version matrix for the API.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct VersionData {
    pub not_versioned: bool,
    pub versions: HashMap<String, VersionInfo>,
}

/// Links a base API to the descriptors carrying its versions.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct VersionDefinition {
    /// `api_id`s of child version descriptors.
    pub versions: Vec<String>,
    /// Set after load: the `api_id` of the base descriptor.
    pub base_id: String,
}

/// Upstream proxying settings.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// URL prefix this API listens under. Prefix-style, no wildcards.
    pub listen_path: String,
    pub target_url: String,
    /// Remove the listen path before dispatching upstream.
    pub strip_listen_path: bool,
    pub enable_load_balancing: bool,
    /// Candidate upstream hosts when load balancing is enabled.
    pub targets: Vec<String>,
    pub transport: TransportConfig,
}

/// TLS bounds for the upstream transport.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub ssl_min_version: u16,
    pub ssl_max_version: u16,
}

/// TLS 1.2 constant in the registry's wire numbering.
pub const TLS12: u16 = 0x0303;

/// GraphQL capabilities of the API.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GraphQlConfig {
    pub enabled: bool,
    pub playground: PlaygroundConfig,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PlaygroundConfig {
    pub enabled: bool,
    /// Path of the playground page, relative to the listen path.
    pub path: String,
}

/// CORS handling for the API.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enable: bool,
    pub allowed_origins: Vec<String>,
}

/// Response caching.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enable_cache: bool,
    pub cache_timeout_secs: u64,
}

/// Per-API rate limit applied after identity checks.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalRateLimitConfig {
    pub enabled: bool,
    pub rate: f64,
    pub per_secs: f64,
}

/// Body and shape transform toggles.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TransformConfig {
    pub validate_json: bool,
    pub validate_request: bool,
    pub persist_graphql: bool,
    pub transform_body: bool,
    pub transform_jq: bool,
    pub transform_headers: bool,
    pub url_rewrite: bool,
    pub transform_method: bool,
}

/// Upstream credential decorators.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamAuthConfig {
    pub basic_enabled: bool,
    pub oauth_enabled: bool,
}

/// External analytics plugin attachment.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalyticsPluginConfig {
    pub enabled: bool,
    pub plugin_path: String,
    pub func_name: String,
}

/// IP-based admission lists.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IpAccessConfig {
    pub enable_allow_list: bool,
    pub allowed_ips: Vec<String>,
    pub enable_deny_list: bool,
    pub denied_ips: Vec<String>,
}

/// The per-route record consumed by the loader.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiDescriptor {
    pub api_id: String,
    /// Internal object id (database identity), distinct from `api_id`.
    pub internal_id: String,
    pub name: String,
    pub org_id: String,
    pub protocol: Protocol,
    /// Falls back to the gateway default when absent.
    pub listen_port: Option<u16>,
    /// Custom domain; empty means reachable via any host.
    pub domain: String,
    pub proxy: ProxyConfig,
    pub auth: AuthConfig,
    pub auth_provider: ProviderConfig,
    pub session_provider: ProviderConfig,
    pub version_data: VersionData,
    pub version_definition: VersionDefinition,
    pub custom_middleware: CustomMiddlewareConfig,
    /// Endpoint-level native plugins, dispatched from the final plugin slot.
    pub endpoint_plugins: Vec<MiddlewareDefinition>,
    /// Header names copied into analytics tags; normalised to lowercase.
    pub tag_headers: Vec<String>,
    pub cors: CorsConfig,
    pub cache: CacheConfig,
    pub graphql: GraphQlConfig,
    pub global_rate_limit: GlobalRateLimitConfig,
    pub transforms: TransformConfig,
    pub upstream_auth: UpstreamAuthConfig,
    pub analytics_plugin: AnalyticsPluginConfig,
    pub ip_access: IpAccessConfig,
    /// Maximum request body size in bytes; 0 disables the check.
    pub global_size_limit: usize,
    pub enable_context_vars: bool,
    pub track_endpoints: bool,
    pub enable_batch_request_support: bool,
    pub enable_virtual_endpoints: bool,
    pub mock_response_enabled: bool,
    pub request_signing_enabled: bool,
    pub use_mutual_tls_auth: bool,
    /// Only reachable through internal-scheme looping, never registered.
    pub internal: bool,
    pub active: bool,
    /// Descriptor arrived in the OpenAPI-extended shape.
    pub is_oas: bool,
    /// The gateway extension block was present on the OAS document.
    pub oas_extension_present: bool,
    /// Cloud-mode slug used for playground endpoints.
    pub slug: String,
}

impl ApiDescriptor {
    /// Domain this API is scoped to; empty means any host.
    pub fn api_domain(&self) -> &str {
        &self.domain
    }

    /// True when at least one version declares an override target and
    /// versioning is enabled. Selects the multi-target proxy sink.
    pub fn has_version_overrides(&self) -> bool {
        !self.version_data.not_versioned
            && self
                .version_data
                .versions
                .values()
                .any(|v| !v.override_target.is_empty())
    }

    /// Whether the custom middleware bundle applies.
    pub fn uses_bundle(&self) -> bool {
        !self.custom_middleware.bundle_disabled && !self.custom_middleware.bundle.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_http_family() {
        assert!(Protocol::Unspecified.is_http());
        assert!(Protocol::Http.is_http());
        assert!(Protocol::H2c.is_http());
        assert!(!Protocol::Tcp.is_http());
        assert!(!Protocol::Tls.is_http());
    }

    #[test]
    fn test_version_overrides_detection() {
        let mut api = ApiDescriptor::default();
        assert!(!api.has_version_overrides());

        api.version_data.versions.insert(
            "v2".into(),
            VersionInfo {
                override_target: "http://alt.example.com".into(),
            },
        );
        assert!(api.has_version_overrides());

        api.version_data.not_versioned = true;
        assert!(!api.has_version_overrides());
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let mut api = ApiDescriptor::default();
        api.api_id = "a1".into();
        api.proxy.listen_path = "/a1".into();
        api.proxy.target_url = "http://upstream.local".into();

        let json = serde_json::to_string(&api).unwrap();
        let back: ApiDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(api, back);
    }
}
