use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

const NAMESPACE: &str = "bifrost";

/// Central registry for all Prometheus metrics
pub struct MetricsRegistry {
	registry: Registry,

	// Authentication
	pub auth_requests_total: IntCounter,
	pub auth_failures_total: IntCounter,
	pub token_refreshes_total: IntCounter,

	// Manifests
	pub manifest_uploads_total: IntCounter,
	pub manifest_upload_rejections_total: IntCounter,
	pub manifest_downloads_total: IntCounter,
	pub manifest_bytes_total: IntCounter,

	// Profile sync
	pub profile_syncs_total: IntCounter,
	pub diffs_applied_total: IntCounter,
	pub conflicts_total: IntCounter,
	pub diff_rejections_total: IntCounter,
	pub profile_sync_duration_seconds: Histogram,

	// Totals across every successful upload, download and profile sync
	pub sync_operations_total: IntCounter,
	pub sync_errors_total: IntCounter,

	pub active_devices: IntGauge,
	pub storage_bytes: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
	let c = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
	registry.register(Box::new(c.clone()))?;
	Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
	let g = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
	registry.register(Box::new(g.clone()))?;
	Ok(g)
}

impl MetricsRegistry {
	pub fn new() -> prometheus::Result<Self> {
		let registry = Registry::new();

		let auth_requests_total = counter(&registry, "auth_requests_total", "Total device authentication requests")?;
		let auth_failures_total = counter(&registry, "auth_failures_total", "Total rejected credentials")?;
		let token_refreshes_total = counter(&registry, "token_refreshes_total", "Total refreshed credential pairs")?;

		let manifest_uploads_total = counter(&registry, "manifest_uploads_total", "Total manifests stored")?;
		let manifest_upload_rejections_total = counter(
			&registry,
			"manifest_upload_rejections_total",
			"Manifest uploads rejected before reaching the store",
		)?;
		let manifest_downloads_total = counter(&registry, "manifest_downloads_total", "Total manifest download pages served")?;
		let manifest_bytes_total = counter(&registry, "manifest_bytes_total", "Total encrypted payload bytes accepted")?;

		let profile_syncs_total = counter(&registry, "profile_syncs_total", "Total profile sync batches")?;
		let diffs_applied_total = counter(&registry, "diffs_applied_total", "Profile diffs applied cleanly")?;
		let conflicts_total = counter(&registry, "conflicts_total", "Profile diffs resolved as conflicts")?;
		let diff_rejections_total = counter(&registry, "diff_rejections_total", "Profile diffs rejected individually")?;

		let profile_sync_duration_seconds = Histogram::with_opts(
			HistogramOpts::new("profile_sync_duration_seconds", "Duration of profile sync batches in seconds")
				.namespace(NAMESPACE)
				.buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
		)?;
		registry.register(Box::new(profile_sync_duration_seconds.clone()))?;

		let sync_operations_total = counter(&registry, "sync_operations_total", "Total successful sync operations")?;
		let sync_errors_total = counter(&registry, "sync_errors_total", "Total failed sync operations")?;

		let active_devices = gauge(&registry, "active_devices", "Registered devices")?;
		let storage_bytes = gauge(&registry, "storage_bytes", "Payload bytes retained across all devices")?;

		Ok(Self {
			registry,
			auth_requests_total,
			auth_failures_total,
			token_refreshes_total,
			manifest_uploads_total,
			manifest_upload_rejections_total,
			manifest_downloads_total,
			manifest_bytes_total,
			profile_syncs_total,
			diffs_applied_total,
			conflicts_total,
			diff_rejections_total,
			profile_sync_duration_seconds,
			sync_operations_total,
			sync_errors_total,
			active_devices,
			storage_bytes,
		})
	}

	/// Encode metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				log::error!("Failed to encode metrics: {}", e);
				String::new()
			}
		}
	}
}

/// Initialize the metrics registry
pub fn init_metrics() -> anyhow::Result<Arc<MetricsRegistry>> {
	Ok(Arc::new(MetricsRegistry::new()?))
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	#[test]
	fn metrics_registry_creation() {
		let registry = super::MetricsRegistry::new().unwrap();
		assert!(registry.encode().contains("bifrost_auth_requests_total"));
	}

	#[test]
	fn metrics_increment() {
		let registry = super::MetricsRegistry::new().unwrap();
		registry.conflicts_total.inc();
		registry.storage_bytes.set(42);
		let text = registry.encode();
		assert!(text.contains("bifrost_conflicts_total 1"));
		assert!(text.contains("bifrost_storage_bytes 42"));
	}
}
