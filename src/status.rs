//! Read-side composition of roster, storage occupancy, engine progress and
//! subsystem health into a per-device status snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::conflict::ConflictEngine;
use crate::manifest::{ManifestStore, StoreError};

/// Number of failures kept per device for status reporting.
pub const RECENT_ERROR_CAPACITY: usize = 10;

/// Health of the subsystems the service depends on but does not own.
pub trait HealthProbe: Send + Sync + 'static {
	fn encryption_healthy(&self) -> bool;
	fn connectivity_healthy(&self) -> bool;
}

/// In-process probe whose flags are set by whoever observes the subsystems.
#[derive(Debug)]
pub struct StaticHealth {
	encryption: AtomicBool,
	connectivity: AtomicBool,
}

impl StaticHealth {
	pub fn new(encryption: bool, connectivity: bool) -> Self {
		Self {
			encryption: AtomicBool::new(encryption),
			connectivity: AtomicBool::new(connectivity),
		}
	}

	pub fn set_encryption_healthy(&self, healthy: bool) {
		self.encryption.store(healthy, Ordering::Relaxed);
	}

	pub fn set_connectivity_healthy(&self, healthy: bool) {
		self.connectivity.store(healthy, Ordering::Relaxed);
	}
}

impl Default for StaticHealth {
	fn default() -> Self {
		Self::new(true, true)
	}
}

impl HealthProbe for StaticHealth {
	fn encryption_healthy(&self) -> bool {
		self.encryption.load(Ordering::Relaxed)
	}

	fn connectivity_healthy(&self) -> bool {
		self.connectivity.load(Ordering::Relaxed)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentError {
	pub at: DateTime<Utc>,
	pub code: String,
	pub message: String,
}

/// Bounded per-device ring of the latest failures.
pub struct ErrorLog {
	capacity: usize,
	entries: RwLock<HashMap<String, VecDeque<RecentError>>>,
}

impl ErrorLog {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity: capacity.max(1),
			entries: RwLock::new(HashMap::new()),
		}
	}

	pub async fn record(&self, device_id: &str, code: &str, message: impl Into<String>, at: DateTime<Utc>) {
		let mut entries = self.entries.write().await;
		let ring = entries.entry(device_id.to_string()).or_default();
		ring.push_back(RecentError {
			at,
			code: code.to_string(),
			message: message.into(),
		});
		while ring.len() > self.capacity {
			ring.pop_front();
		}
	}

	/// Oldest first.
	pub async fn recent(&self, device_id: &str) -> Vec<RecentError> {
		self.entries
			.read()
			.await
			.get(device_id)
			.map(|ring| ring.iter().cloned().collect())
			.unwrap_or_default()
	}
}

impl Default for ErrorLog {
	fn default() -> Self {
		Self::new(RECENT_ERROR_CAPACITY)
	}
}

/// Sync status of one device. Derived on every request, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
	pub sync_enabled: bool,
	pub last_sync: Option<DateTime<Utc>>,
	pub total_devices: usize,
	pub total_profiles: usize,
	pub connected_devices: Vec<String>,
	pub storage_used_bytes: u64,
	pub storage_limit_bytes: u64,
	pub encryption_healthy: bool,
	pub connectivity_healthy: bool,
	pub recent_errors: Vec<RecentError>,
}

#[derive(Clone)]
pub struct StatusAggregator {
	store: Arc<dyn ManifestStore>,
	engine: Arc<ConflictEngine>,
	health: Arc<dyn HealthProbe>,
	errors: Arc<ErrorLog>,
	storage_limit_bytes: u64,
}

impl StatusAggregator {
	pub fn new(
		store: Arc<dyn ManifestStore>,
		engine: Arc<ConflictEngine>,
		health: Arc<dyn HealthProbe>,
		errors: Arc<ErrorLog>,
		storage_limit_bytes: u64,
	) -> Self {
		Self {
			store,
			engine,
			health,
			errors,
			storage_limit_bytes,
		}
	}

	/// Compose the snapshot for `device_id`, owned by `user_id`.
	///
	/// Storage is summed over every device on the user's roster.
	pub async fn get_status(&self, user_id: &str, device_id: &str) -> Result<Snapshot, StoreError> {
		let roster = self.store.get_device_list(user_id).await?;

		let mut storage_used_bytes = 0;
		for device in &roster {
			storage_used_bytes += self.store.storage_used(device).await?;
		}

		Ok(Snapshot {
			sync_enabled: roster.contains(device_id),
			last_sync: self.engine.last_sync(user_id, device_id).await,
			total_devices: roster.len(),
			total_profiles: self.engine.total_profiles(user_id).await,
			connected_devices: roster.into_iter().collect(),
			storage_used_bytes,
			storage_limit_bytes: self.storage_limit_bytes,
			encryption_healthy: self.health.encryption_healthy(),
			connectivity_healthy: self.health.connectivity_healthy(),
			recent_errors: self.errors.recent(device_id).await,
		})
	}
}
