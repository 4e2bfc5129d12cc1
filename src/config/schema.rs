//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Default port APIs listen on when the descriptor doesn't set one.
    pub listen_port: u16,

    /// Hostname requests must carry to reach APIs without a custom domain.
    /// Empty means any host.
    pub hostname: String,

    /// Dedicated port for the control API; 0 shares the listen port.
    pub control_api_port: u16,

    /// Dedicated hostname for the control API.
    pub control_api_hostname: String,

    /// Honour per-descriptor custom domains.
    pub enable_custom_domains: bool,

    /// Log requests that matched no route.
    pub track_404_logs: bool,

    /// Directory holding HTML templates (playground).
    pub template_path: String,

    /// Cloud mode: playground endpoints address APIs by slug.
    pub cloud: bool,

    /// Hash credential keys before storage lookups.
    pub hash_keys: bool,

    /// Force org-data freshness checks (set when an API binds RPC stores).
    pub enforce_org_data_age: bool,

    pub http_server_options: HttpServerOptions,

    pub slave_options: SlaveOptions,

    pub uptime_tests: UptimeTestsConfig,

    pub tracing: TracingConfig,

    pub opentelemetry: OpenTelemetryConfig,

    pub security: SecurityConfig,

    pub observability: ObservabilityConfig,
}

/// HTTP server behaviour shared by every listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpServerOptions {
    /// Enforce exact-prefix-plus-boundary route matching.
    pub enable_strict_routes: bool,

    /// Request timeout (total time for request/response) in seconds.
    pub request_timeout_secs: u64,

    /// Maximum body size in bytes accepted by any listener.
    pub max_body_size: usize,
}

impl Default for HttpServerOptions {
    fn default() -> Self {
        Self {
            enable_strict_routes: false,
            request_timeout_secs: 30,
            max_body_size: 2 * 1024 * 1024,
        }
    }
}

/// Edge/replica mode settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SlaveOptions {
    /// Operate against the RPC control plane instead of local stores.
    pub use_rpc: bool,
}

/// Uptime checker toggles.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct UptimeTestsConfig {
    pub disable: bool,
}

/// Distributed tracing integration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TracingConfig {
    pub enabled: bool,
}

/// OpenTelemetry integration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct OpenTelemetryConfig {
    pub enabled: bool,
}

/// Security hardening configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// Require client certificates on the control API.
    pub control_api_use_mutual_tls: bool,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Port the control API router is mounted on.
    pub fn control_port(&self) -> u16 {
        if self.control_api_port != 0 {
            self.control_api_port
        } else {
            self.listen_port
        }
    }

    /// A dedicated control port or hostname is configured.
    pub fn control_api_is_dedicated(&self) -> bool {
        (self.control_api_port != 0 && self.control_api_port != self.listen_port)
            || !self.control_api_hostname.is_empty()
    }
}

/// Sensible defaults for a locally-run gateway.
pub fn default_config() -> GatewayConfig {
    GatewayConfig {
        listen_port: 8080,
        ..GatewayConfig::default()
    }
}
