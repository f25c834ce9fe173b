//! REST listeners: the authenticated user API and the token-gated admin
//! API. Both share the request gate that implements the shutdown drain:
//! once draining starts every route answers 503 until the in-flight
//! counter empties and the listeners stop.

pub mod admin;
pub mod user;

use crate::core::CoreContext;
use actix_web::{dev::ServerHandle, HttpRequest, HttpResponse};
use base64::Engine;
use casualchain_common::{
    api::ApiErrorResponse,
    config::REST_DRAIN_TIMEOUT_MS,
    error::ModuleError,
    time::get_current_time_in_millis,
};
use log::{info, warn};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

/// Tracks in-flight requests and the draining flag.
pub struct RequestGate {
    inflight: AtomicU64,
    draining: AtomicBool,
}

impl Default for RequestGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestGate {
    pub fn new() -> Self {
        Self {
            inflight: AtomicU64::new(0),
            draining: AtomicBool::new(false),
        }
    }

    /// Enter a request; None once draining began.
    pub fn enter(&self) -> Option<GateGuard<'_>> {
        if self.draining.load(Ordering::SeqCst) {
            return None;
        }
        self.inflight.fetch_add(1, Ordering::SeqCst);
        Some(GateGuard(self))
    }

    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Wait for in-flight requests to finish, bounded by the drain budget.
    pub async fn drain(&self) {
        let deadline = get_current_time_in_millis() + REST_DRAIN_TIMEOUT_MS;
        while self.inflight() > 0 {
            if get_current_time_in_millis() > deadline {
                warn!("REST drain timed out with {} requests in flight", self.inflight());
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

pub struct GateGuard<'a>(&'a RequestGate);

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.0.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared state of both listeners.
pub struct RestState {
    pub ctx: Arc<CoreContext>,
    pub gate: Arc<RequestGate>,
}

/// 503 with the structured error body.
pub fn error_response(api: &str, err: &ModuleError) -> HttpResponse {
    HttpResponse::ServiceUnavailable().json(ApiErrorResponse::from_error(api, err))
}

/// 503 used while draining or when a module is down.
pub fn unavailable(api: &str) -> HttpResponse {
    error_response(
        api,
        &ModuleError::internal("rest", "gate", "service is draining or unavailable"),
    )
}

/// HTTP Basic credentials from the Authorization header.
pub fn basic_credentials(req: &HttpRequest) -> Option<(String, String)> {
    let header = req.headers().get("Authorization")?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, password) = text.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Bearer token from the Authorization header.
pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    let header = req.headers().get("Authorization")?.to_str().ok()?;
    header.strip_prefix("Bearer ").map(|t| t.to_string())
}

/// Stop both listeners: drain, then close.
pub async fn shutdown(gate: &Arc<RequestGate>, user: ServerHandle, admin: ServerHandle) {
    info!("REST shutdown: draining {} in-flight requests", gate.inflight());
    gate.begin_drain();
    gate.drain().await;
    user.stop(true).await;
    admin.stop(true).await;
    info!("REST listeners closed");
}
