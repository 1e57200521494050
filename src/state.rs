use std::sync::Arc;

use crate::observability::MetricsRegistry;
use crate::service::SyncService;

/// Application state passed to handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
	pub service: Arc<SyncService>,
	pub metrics: Arc<MetricsRegistry>,
}

impl AppState {
	pub fn new(service: Arc<SyncService>, metrics: Arc<MetricsRegistry>) -> Self {
		Self { service, metrics }
	}
}
