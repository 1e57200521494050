use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

pub const SERVICE_NAME: &str = "bifrost";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
	pub status: String,
	pub service: String,
	pub version: String,
	pub timestamp: DateTime<Utc>,
}

/// Liveness endpoint: 200 with `healthy` when the manifest store answers a
/// ping, otherwise 503 with `unhealthy`.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
	let (status, label) = match state.service.store().ping().await {
		Ok(()) => (StatusCode::OK, "healthy"),
		Err(e) => {
			log::warn!("Health check failed: {}", e);
			(StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
		}
	};
	let report = HealthReport {
		status: label.to_string(),
		service: SERVICE_NAME.to_string(),
		version: env!("CARGO_PKG_VERSION").to_string(),
		timestamp: Utc::now(),
	};
	(status, Json(report)).into_response()
}

/// Prometheus metrics endpoint: returns metrics in Prometheus text format
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
	let metrics_text = state.metrics.encode();
	(StatusCode::OK, metrics_text).into_response()
}

/// Coarse JSON counters: active devices, total syncs, storage usage.
pub async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
	match state.service.stats().await {
		Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
		Err(e) => e.into_response(),
	}
}
