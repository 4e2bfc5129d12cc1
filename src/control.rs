//! Control API mounted on the management port.
//!
//! # Responsibilities
//! - Liveness endpoint
//! - Loaded-API inspection
//! - Reload trigger

use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use std::sync::{Arc, Weak};

use crate::gateway::Gateway;
use crate::middleware::{GatewayRequest, GatewayResponse, RequestHandler};
use crate::router::SubRouter;

#[derive(Serialize)]
struct HelloResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ApiSummary {
    api_id: String,
    name: String,
    listen_path: String,
    target_url: String,
    active: bool,
    internal: bool,
}

#[derive(Serialize)]
struct ReloadResponse {
    status: &'static str,
    message: &'static str,
}

/// Handler backing every control route.
struct ControlApi {
    gateway: Weak<Gateway>,
}

impl ControlApi {
    fn hello(&self) -> GatewayResponse {
        Json(HelloResponse {
            status: "pass",
            version: env!("CARGO_PKG_VERSION"),
        })
        .into_response()
    }

    fn list_apis(&self, gateway: &Gateway) -> GatewayResponse {
        let mut apis: Vec<ApiSummary> = gateway
            .registry()
            .descriptors()
            .into_iter()
            .map(|api| ApiSummary {
                api_id: api.api_id.clone(),
                name: api.name.clone(),
                listen_path: api.proxy.listen_path.clone(),
                target_url: api.proxy.target_url.clone(),
                active: api.active,
                internal: api.internal,
            })
            .collect();
        apis.sort_by(|a, b| a.api_id.cmp(&b.api_id));
        Json(apis).into_response()
    }

    fn reload(&self, gateway: &Arc<Gateway>) -> GatewayResponse {
        gateway.load_global_apps();
        Json(ReloadResponse {
            status: "ok",
            message: "Reload triggered",
        })
        .into_response()
    }
}

#[async_trait]
impl RequestHandler for ControlApi {
    async fn serve(&self, req: GatewayRequest) -> GatewayResponse {
        let Some(gateway) = self.gateway.upgrade() else {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        };

        let method = req.method().clone();
        let path = req.uri().path().trim_end_matches('/');

        if method == Method::GET && path == "/hello" {
            self.hello()
        } else if method == Method::GET && path == "/gantry/apis" {
            self.list_apis(&gateway)
        } else if method == Method::POST && path == "/gantry/reload" {
            self.reload(&gateway)
        } else {
            (StatusCode::NOT_FOUND, "Not Found").into_response()
        }
    }
}

impl Gateway {
    /// Premount the control routes on the management router.
    pub(crate) fn load_control_api_endpoints(self: &Arc<Self>, sub: &mut SubRouter) {
        let control: Arc<dyn RequestHandler> = Arc::new(ControlApi {
            gateway: Arc::downgrade(self),
        });

        sub.path_prefix("/hello").set_catch_all(control.clone());
        sub.path_prefix("/gantry/apis").set_catch_all(control.clone());
        sub.path_prefix("/gantry/reload").set_catch_all(control);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use axum::body::Body;
    use axum::http::Request;

    #[tokio::test]
    async fn test_hello_endpoint() {
        let gw = Gateway::new(default_config());
        let control = ControlApi {
            gateway: Arc::downgrade(&gw),
        };

        let req = Request::builder()
            .uri("http://gw.local/hello")
            .body(Body::empty())
            .unwrap();
        let resp = control.serve(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_control_route() {
        let gw = Gateway::new(default_config());
        let control = ControlApi {
            gateway: Arc::downgrade(&gw),
        };

        let req = Request::builder()
            .uri("http://gw.local/gantry/nope")
            .body(Body::empty())
            .unwrap();
        let resp = control.serve(req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
