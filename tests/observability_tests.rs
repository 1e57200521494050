use vanopticon_bifrost::observability::{MetricsRegistry, init_metrics};

#[cfg(feature = "unit-tests")]
#[test]
fn test_metrics_registry_creation() {
	let registry = MetricsRegistry::new().unwrap();
	let output = registry.encode();

	// Verify metrics are present in the output
	assert!(output.contains("bifrost_auth_requests_total"));
	assert!(output.contains("bifrost_manifest_uploads_total"));
	assert!(output.contains("bifrost_profile_syncs_total"));
	assert!(output.contains("bifrost_conflicts_total"));
	assert!(output.contains("bifrost_storage_bytes"));
	assert!(output.contains("bifrost_profile_sync_duration_seconds"));
}

#[cfg(feature = "unit-tests")]
#[test]
fn test_metrics_increment() {
	let registry = MetricsRegistry::new().unwrap();
	registry.diffs_applied_total.inc_by(3);
	registry.active_devices.set(2);

	let output = registry.encode();
	assert!(output.contains("bifrost_diffs_applied_total 3"));
	assert!(output.contains("bifrost_active_devices 2"));
}

#[cfg(feature = "unit-tests")]
#[test]
fn test_init_metrics_returns_independent_registries() {
	let a = init_metrics().unwrap();
	let b = init_metrics().unwrap();
	a.conflicts_total.inc();
	assert!(a.encode().contains("bifrost_conflicts_total 1"));
	assert!(b.encode().contains("bifrost_conflicts_total 0"));
}
