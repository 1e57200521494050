pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{MetricsRegistry, init_metrics};

use log::info;
use std::sync::Arc;

/// Global observability state
pub struct ObservabilityState {
	pub metrics: Arc<MetricsRegistry>,
}

/// Initialize logging at `level` and the metrics registry.
pub fn init_observability(level: log::Level) -> anyhow::Result<ObservabilityState> {
	init_logging(level)?;
	let metrics = init_metrics()?;

	info!("Observability initialized: logging at {} and Prometheus metrics enabled", level);

	Ok(ObservabilityState { metrics })
}
