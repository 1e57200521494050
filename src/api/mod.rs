//! HTTP transport for the sync service.

pub mod error;
pub mod handlers;
pub mod rate_limit;

use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

use crate::config::Settings;
use crate::health;
use crate::state::AppState;

pub use error::ErrorBody;
pub use rate_limit::KeyedRateLimitLayer;

pub fn build_router(state: AppState, settings: &Settings) -> Router {
	let sync = Router::new()
		.route("/v1/auth", post(handlers::authenticate))
		.route("/v1/auth/refresh", post(handlers::refresh))
		.route(
			"/v1/manifests",
			post(handlers::upload_manifest).get(handlers::download_manifests),
		)
		.route("/v1/profiles/sync", post(handlers::sync_profiles))
		.route("/v1/status", get(handlers::sync_status))
		.layer(KeyedRateLimitLayer::new(
			settings.rate_limit_burst as usize,
			settings.rate_limit_rps,
			Arc::clone(state.service.issuer()),
		));

	let ops = Router::new()
		.route("/health", get(health::health))
		.route("/metrics", get(health::metrics_handler))
		.route("/stats", get(health::stats_handler));

	Router::new()
		.merge(sync)
		.merge(ops)
		.layer(RequestBodyLimitLayer::new(settings.max_body_bytes))
		.with_state(state)
}
