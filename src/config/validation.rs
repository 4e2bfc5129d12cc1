//! Semantic checks over a loaded configuration.

use crate::config::schema::GatewayConfig;

/// One rejected configuration field, with the reason.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// Validate a GatewayConfig for semantic correctness.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listen_port == 0 {
        errors.push(ValidationError("listen_port must be set".to_string()));
    }

    if config.control_api_port != 0 && config.control_api_port == config.listen_port {
        // Legal, but the control API then shares the data plane port.
        tracing::warn!(
            port = config.listen_port,
            "Control API shares the gateway listen port"
        );
    }

    if config.opentelemetry.enabled && config.tracing.enabled {
        tracing::warn!("Both tracing integrations enabled, distributed tracing takes precedence");
    }

    if config.http_server_options.request_timeout_secs == 0 {
        tracing::warn!("Request timeout is 0, requests may time out immediately");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::default_config;

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&default_config()).is_ok());
    }

    #[test]
    fn test_zero_listen_port() {
        let config = GatewayConfig::default();
        let errs = validate_config(&config).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(errs[0].0.contains("listen_port"));
    }
}
