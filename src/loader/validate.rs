//! Descriptor validation.

use url::Url;

use crate::apidef::ApiDescriptor;
use crate::gateway::Gateway;

impl Gateway {
    /// Whether the descriptor must be skipped instead of loaded.
    ///
    /// Target URLs pass through the key-value resolver first; a resolver
    /// miss leaves the configured value untouched.
    pub(crate) fn skip_descriptor_because_invalid(&self, api: &mut ApiDescriptor) -> bool {
        if api.protocol.is_http() {
            if api.proxy.listen_path.is_empty() {
                tracing::error!(api_id = %api.api_id, "Listen path is empty");
                return true;
            }
            if api.proxy.listen_path.contains(' ') {
                tracing::error!(api_id = %api.api_id, "Listen path contains spaces, is invalid");
                return true;
            }
        }

        if let Ok(resolved) = self.kv().resolve(&api.proxy.target_url) {
            api.proxy.target_url = resolved;
        }

        if let Err(e) = Url::parse(&api.proxy.target_url) {
            tracing::error!(api_id = %api.api_id, error = %e, "couldn't parse target URL");
            return true;
        }

        false
    }
}
