//! Readiness probes
//!
//! The proxy listener forwards every path, so probes get their own
//! plain-HTTP listener. Readiness flips true once OIDC discovery has
//! succeeded; before that the proxy must not be sent traffic.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tracing::info;

use crate::error::Error;

/// Shared readiness flag
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    /// Create a not-yet-ready flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the proxy ready to serve
    pub fn set_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the proxy is ready
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Serve the probe endpoints
pub async fn serve(addr: SocketAddr, readiness: Readiness) -> Result<(), Error> {
    let app = Router::new()
        .route("/ready", get(ready_handler))
        .route("/healthz", get(ready_handler))
        .with_state(readiness);

    info!(addr = %addr, "starting probe listener");

    axum_server::bind(addr)
        .serve(app.into_make_service())
        .await
        .map_err(|e| Error::Internal(format!("probe server error: {}", e)))
}

async fn ready_handler(State(readiness): State<Readiness>) -> (StatusCode, &'static str) {
    if readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}
