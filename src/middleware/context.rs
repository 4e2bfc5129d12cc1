//! Request-scoped context values.
//!
//! Typed bags carried in `http::Extensions`. Populated by individual
//! stages or the loop dispatcher, consumed downstream, destroyed with the
//! request.

use axum::http::{Method, Uri};
use serde::{Deserialize, Serialize};

use super::GatewayRequest;

/// Loop bookkeeping for internal-scheme re-entry.
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    /// Completed internal hops on this request.
    pub level: u32,
    /// Per-request cap; 0 means the default applies.
    pub limit: u32,
    /// The current hop re-entered the same API.
    pub self_looping: bool,
    /// Quota accounting enabled on inner hops.
    pub check_limits: bool,
}

/// Deferred URL rewrite left by the URL-rewrite stage for the sink.
#[derive(Debug, Clone)]
pub struct UrlRewriteTarget(pub Uri);

/// Deferred method change left by the method-transform stage.
#[derive(Debug, Clone)]
pub struct TransformRequestMethod(pub Method);

/// Original request URL saved before an internal hop rewrote it.
#[derive(Debug, Clone)]
pub struct OrigRequestUrl(pub Uri);

/// Destination stashed for an internal-scheme upstream target.
#[derive(Debug, Clone)]
pub struct InternalRedirectTarget(pub Uri);

/// Version tag resolved by the version-check stage.
#[derive(Debug, Clone)]
pub struct VersionTag(pub String);

/// Caller identity and allowances attached by the auth block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    /// Allowed requests per window.
    pub rate: f64,
    /// Window length in seconds.
    pub per: f64,
    pub quota_max: i64,
    pub quota_remaining: i64,
}

/// Remove and return a context value of type `T`.
pub fn take<T: Send + Sync + 'static>(req: &mut GatewayRequest) -> Option<T> {
    req.extensions_mut().remove::<T>()
}

/// Attach (or replace) a context value.
pub fn set<T: Clone + Send + Sync + 'static>(req: &mut GatewayRequest, value: T) {
    req.extensions_mut().insert(value);
}

/// Borrow a context value without consuming it.
pub fn get<T: Send + Sync + 'static>(req: &GatewayRequest) -> Option<&T> {
    req.extensions().get::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;

    #[test]
    fn test_take_consumes_value() {
        let mut req = Request::new(Body::empty());
        set(&mut req, VersionTag("v2".into()));
        assert!(get::<VersionTag>(&req).is_some());

        let tag = take::<VersionTag>(&mut req).unwrap();
        assert_eq!(tag.0, "v2");
        assert!(get::<VersionTag>(&req).is_none());
    }

    #[test]
    fn test_loop_state_defaults() {
        let state = LoopState::default();
        assert_eq!(state.level, 0);
        assert_eq!(state.limit, 0);
        assert!(!state.self_looping);
    }
}
