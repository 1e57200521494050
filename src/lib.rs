pub mod api;
pub mod auth;
pub mod config;
pub mod conflict;
pub mod health;
pub mod integrity;
pub mod manifest;
pub mod observability;
pub mod service;
pub mod state;
pub mod status;

use anyhow::Context;
use axum::Router;
use log::info;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::Settings;
use crate::observability::MetricsRegistry;
use crate::service::SyncService;
use crate::state::AppState;

/// Build the service and its router from settings.
pub fn build_app(settings: &Settings, metrics: Arc<MetricsRegistry>) -> anyhow::Result<(Router, Arc<SyncService>)> {
	let service = Arc::new(SyncService::from_settings(settings, Arc::clone(&metrics))?);
	let state = AppState::new(Arc::clone(&service), metrics);
	Ok((api::build_router(state, settings), service))
}

/// Serve the sync API until Ctrl-C.
///
/// Plain HTTP; TLS is terminated in front of the service.
pub async fn run(settings: Settings, metrics: Arc<MetricsRegistry>) -> anyhow::Result<()> {
	let (app, _service) = build_app(&settings, metrics)?;

	let addr = format!("{}:{}", settings.host, settings.port);
	let listener = tokio::net::TcpListener::bind(&addr)
		.await
		.with_context(|| format!("failed to bind {}", addr))?;
	info!("Bifrost listening on http://{} (advertising {})", addr, settings.sync_endpoint);

	axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
		.with_graceful_shutdown(shutdown_signal())
		.await
		.context("server error")?;

	info!("Bifrost stopped");
	Ok(())
}

async fn shutdown_signal() {
	if let Err(e) = tokio::signal::ctrl_c().await {
		log::error!("Failed to listen for shutdown signal: {}", e);
	}
}
