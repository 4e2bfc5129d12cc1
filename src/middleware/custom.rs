//! Custom middleware hooks declared on the descriptor.
//!
//! One stage type covers all three drivers; the variant decides how the
//! hook body is invoked (in-process native plugin, out-of-process
//! dispatch, embedded script). Hook execution itself is a collaborator;
//! the assembler owns placement and enablement.

use async_trait::async_trait;
use std::sync::Arc;

use crate::apidef::{ApiDescriptor, MiddlewareDefinition, MiddlewareDriver};
use crate::middleware::{Flow, GatewayRequest, Middleware, MiddlewareError};

/// Position of a hook inside the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Pre,
    AuthCheck,
    PostAuth,
    Post,
    Response,
}

impl HookKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HookKind::Pre => "pre",
            HookKind::AuthCheck => "auth_check",
            HookKind::PostAuth => "post_auth",
            HookKind::Post => "post",
            HookKind::Response => "response",
        }
    }
}

/// How the hook body runs.
pub enum CustomStageVariant {
    /// In-process plugin resolved by path and symbol.
    NativePlugin { path: String, symbol_name: String },
    /// Out-of-process hook dispatched to the driver runtime.
    OutOfProcess {
        hook_name: String,
        driver: MiddlewareDriver,
        raw_body_only: bool,
    },
    /// Embedded script class.
    Scripted {
        class_name: String,
        pre: bool,
    },
}

/// A descriptor-declared hook stage.
pub struct CustomMiddleware {
    pub api: Arc<ApiDescriptor>,
    pub kind: HookKind,
    pub variant: CustomStageVariant,
    disabled: bool,
}

impl CustomMiddleware {
    /// Build the stage for one hook definition under the given driver.
    pub fn from_definition(
        api: Arc<ApiDescriptor>,
        kind: HookKind,
        def: &MiddlewareDefinition,
        driver: MiddlewareDriver,
    ) -> Self {
        let variant = match driver {
            MiddlewareDriver::GoPlugin => CustomStageVariant::NativePlugin {
                path: def.path.clone(),
                symbol_name: def.symbol_name.clone(),
            },
            MiddlewareDriver::Coprocess => CustomStageVariant::OutOfProcess {
                hook_name: def.symbol_name.clone(),
                driver,
                raw_body_only: def.raw_body_only,
            },
            MiddlewareDriver::Otto => CustomStageVariant::Scripted {
                class_name: def.symbol_name.clone(),
                pre: matches!(kind, HookKind::Pre | HookKind::AuthCheck),
            },
        };

        tracing::debug!(
            hook = def.symbol_name,
            kind = kind.as_str(),
            driver = ?driver,
            "Registering custom middleware"
        );

        Self {
            api,
            kind,
            variant,
            disabled: def.disabled,
        }
    }

    /// The final native-plugin slot: endpoint-level plugins attached to
    /// the API rather than a single declared hook.
    pub fn endpoint_slot(api: Arc<ApiDescriptor>) -> Self {
        let enabled = api.custom_middleware.driver == MiddlewareDriver::GoPlugin
            && !api.endpoint_plugins.is_empty();
        Self {
            api,
            kind: HookKind::Post,
            variant: CustomStageVariant::NativePlugin {
                path: String::new(),
                symbol_name: String::new(),
            },
            disabled: !enabled,
        }
    }
}

#[async_trait]
impl Middleware for CustomMiddleware {
    fn name(&self) -> &'static str {
        match self.variant {
            CustomStageVariant::NativePlugin { .. } => "GoPluginMiddleware",
            CustomStageVariant::OutOfProcess { .. } => "CoProcessMiddleware",
            CustomStageVariant::Scripted { .. } => "DynamicMiddleware",
        }
    }

    fn enabled(&self) -> bool {
        !self.disabled
    }

    async fn apply(&self, req: GatewayRequest) -> Result<Flow, MiddlewareError> {
        Ok(Flow::Continue(req))
    }
}

/// Rewrite hook paths under the bundle destination, in place.
pub fn fix_hook_paths(prefix: &str, hooks: &mut [MiddlewareDefinition]) {
    for def in hooks.iter_mut() {
        def.path = join_bundle_path(prefix, &def.path);
    }
}

/// `<bundle_dest>/<path>` with duplicate separators collapsed.
pub fn join_bundle_path(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        return path.to_string();
    }
    format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_follows_driver() {
        let api = Arc::new(ApiDescriptor::default());
        let def = MiddlewareDefinition {
            path: "plugin.so".into(),
            symbol_name: "PreHook".into(),
            ..MiddlewareDefinition::default()
        };

        let native =
            CustomMiddleware::from_definition(api.clone(), HookKind::Pre, &def, MiddlewareDriver::GoPlugin);
        assert_eq!(native.name(), "GoPluginMiddleware");

        let oop =
            CustomMiddleware::from_definition(api.clone(), HookKind::Post, &def, MiddlewareDriver::Coprocess);
        assert_eq!(oop.name(), "CoProcessMiddleware");

        let scripted =
            CustomMiddleware::from_definition(api, HookKind::Pre, &def, MiddlewareDriver::Otto);
        assert_eq!(scripted.name(), "DynamicMiddleware");
        match scripted.variant {
            CustomStageVariant::Scripted { pre, .. } => assert!(pre),
            _ => panic!("expected scripted variant"),
        }
    }

    #[test]
    fn test_disabled_hook_never_enables() {
        let api = Arc::new(ApiDescriptor::default());
        let def = MiddlewareDefinition {
            disabled: true,
            ..MiddlewareDefinition::default()
        };
        let stage =
            CustomMiddleware::from_definition(api, HookKind::Pre, &def, MiddlewareDriver::GoPlugin);
        assert!(!stage.enabled());
    }

    #[test]
    fn test_bundle_path_join() {
        assert_eq!(join_bundle_path("/bundles/abc", "hook.so"), "/bundles/abc/hook.so");
        assert_eq!(join_bundle_path("/bundles/abc/", "/hook.so"), "/bundles/abc/hook.so");
        assert_eq!(join_bundle_path("", "hook.so"), "hook.so");

        let mut hooks = vec![MiddlewareDefinition {
            path: "pre.so".into(),
            ..MiddlewareDefinition::default()
        }];
        fix_hook_paths("/bundles/abc", &mut hooks);
        assert_eq!(hooks[0].path, "/bundles/abc/pre.so");
    }
}
