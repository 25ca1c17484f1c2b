//! Health check endpoints.

use std::collections::BTreeMap;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
}

/// Readiness details.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ReadyResponse {
    #[serde(flatten)]
    pub health: HealthResponse,
    pub subscriptions: usize,
    pub stored_events: BTreeMap<String, usize>,
    pub providers: Vec<String>,
    pub notifiers: Vec<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

fn health(status: &str) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: "pulsed".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    }
}

async fn healthz() -> impl IntoResponse {
    Json(health("ok"))
}

/// Ready once the watchers have subscribed. Returns 503 before that.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let events = state.events();
    let subscriptions = events.subscription_count().await;
    let stored_events = events
        .store_sizes()
        .await
        .into_iter()
        .map(|(t, n)| (t.to_string(), n))
        .collect();

    let ready = subscriptions > 0;
    let response = ReadyResponse {
        health: health(if ready { "ok" } else { "degraded" }),
        subscriptions,
        stored_events,
        providers: state.providers().iter().map(|s| s.to_string()).collect(),
        notifiers: state.notifiers().iter().map(|s| s.to_string()).collect(),
    };

    if ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
