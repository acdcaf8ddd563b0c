//! Relay status endpoints

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use crate::api::server::AppState;
use crate::error::{RelayError, Result};
use crate::models::ProxyDescriptor;

/// Pool, connection and error counters
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.pool.snapshot();
    let current = snapshot.current.as_ref();

    Json(json!({
        "status": "ok",
        "proxy": {
            "current": current.map(|p| p.key().to_string()),
            "country": current.and_then(|p| p.country.clone()),
            "available": snapshot.available,
            "blacklisted": snapshot.blacklisted,
        },
        "connections": {
            "successful": snapshot.successful_connections,
            "total": snapshot.total_connections,
            "success_rate": round2(snapshot.success_rate()),
        },
        "errors": {
            "invalid_socks": snapshot.invalid_socks_requests,
            "connection_errors": snapshot.consecutive_upstream_errors,
        },
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "timestamp": Utc::now().timestamp(),
    }))
}

/// Percentages are reported with two decimals
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Descriptor of the active upstream proxy
pub async fn current_proxy(State(state): State<AppState>) -> Result<Json<ProxyDescriptor>> {
    state
        .pool
        .active()
        .map(|p| Json((*p).clone()))
        .ok_or_else(|| RelayError::NotFound("no active proxy".to_string()))
}
