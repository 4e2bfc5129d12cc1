//! Middleware pipeline primitives.
//!
//! # Responsibilities
//! - Define the stage contract every middleware satisfies
//! - Run an assembled chain in order, stopping at the first response
//! - Conditional appending: a stage that declines to enable itself
//!   contributes nothing
//!
//! # Design Decisions
//! - Stages receive the request by value and either pass it on or
//!   respond; there is no mid-request rebinding
//! - Errors become JSON error responses through a single helper, so every
//!   stage fails the same way

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::sync::Arc;

pub mod context;
pub mod custom;
pub mod stages;

/// Request type flowing through every chain.
pub type GatewayRequest = Request<Body>;
/// Response type produced by every chain.
pub type GatewayResponse = Response;

/// Anything that can terminate a request: a chain, a sink, a sub-route.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn serve(&self, req: GatewayRequest) -> GatewayResponse;
}

/// Outcome of one middleware stage.
pub enum Flow {
    /// Pass the (possibly modified) request to the next stage.
    Continue(GatewayRequest),
    /// Short-circuit with this response.
    Respond(GatewayResponse),
}

/// Stage failure carrying the client-facing status and message.
#[derive(Debug)]
pub struct MiddlewareError {
    pub status: StatusCode,
    pub message: String,
}

impl MiddlewareError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// One stage of a request pipeline.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stage name used in logs and spans.
    fn name(&self) -> &'static str;

    /// Whether this stage applies to its API. Decided once, at composition.
    fn enabled(&self) -> bool {
        true
    }

    async fn apply(&self, req: GatewayRequest) -> Result<Flow, MiddlewareError>;
}

/// Append `mw` to `stages` when it is enabled for its API.
///
/// Returns whether the stage was appended, so callers can log which
/// security policy became active.
pub fn append_enabled(stages: &mut Vec<Arc<dyn Middleware>>, mw: impl Middleware + 'static) -> bool {
    if !mw.enabled() {
        return false;
    }
    tracing::debug!(stage = mw.name(), "Init");
    stages.push(Arc::new(mw));
    true
}

/// An ordered stage sequence terminating in a sink handler.
pub struct Chain {
    stages: Vec<Arc<dyn Middleware>>,
    terminal: Arc<dyn RequestHandler>,
}

impl Chain {
    pub fn new(stages: Vec<Arc<dyn Middleware>>, terminal: Arc<dyn RequestHandler>) -> Self {
        Self { stages, terminal }
    }

    /// Number of stages ahead of the terminal sink.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

#[async_trait]
impl RequestHandler for Chain {
    async fn serve(&self, mut req: GatewayRequest) -> GatewayResponse {
        for stage in &self.stages {
            match stage.apply(req).await {
                Ok(Flow::Continue(next)) => req = next,
                Ok(Flow::Respond(resp)) => return resp,
                Err(err) => {
                    tracing::debug!(stage = stage.name(), error = %err.message, "Stage rejected request");
                    return error_response(err.status, &err.message);
                }
            }
        }
        self.terminal.serve(req).await
    }
}

#[derive(Serialize)]
struct ApiError<'a> {
    error: &'a str,
}

/// Uniform JSON error body used by every stage and dispatcher.
pub fn error_response(status: StatusCode, message: &str) -> GatewayResponse {
    (status, axum::Json(ApiError { error: message })).into_response()
}
