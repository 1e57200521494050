use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{DEFAULT_RETENTION, Device, ManifestEnvelope, ManifestStore, StoreError};

/// One device's retained manifests.
#[derive(Default)]
struct DeviceLog {
	entries: VecDeque<ManifestEnvelope>,
	bytes: u64,
}

impl DeviceLog {
	/// Append and evict oldest-first down to `retention`.
	fn push(&mut self, envelope: ManifestEnvelope, retention: usize) -> usize {
		self.bytes += envelope.payload_len();
		self.entries.push_back(envelope);

		let mut evicted = 0;
		while self.entries.len() > retention {
			if let Some(old) = self.entries.pop_front() {
				self.bytes -= old.payload_len();
				evicted += 1;
			}
		}
		evicted
	}
}

/// In-memory manifest store.
///
/// Each device log sits behind its own lock, so appends to different devices
/// never contend and a reader of one log sees it either before or after an
/// append-plus-eviction, never in between. Everything is lost on restart.
pub struct MemoryStore {
	retention: usize,
	max_envelope_bytes: Option<u64>,
	logs: RwLock<HashMap<String, Arc<RwLock<DeviceLog>>>>,
	devices: RwLock<HashMap<String, Device>>,
	rosters: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl MemoryStore {
	pub fn new(retention: usize) -> Self {
		Self {
			retention: retention.max(1),
			max_envelope_bytes: None,
			logs: RwLock::new(HashMap::new()),
			devices: RwLock::new(HashMap::new()),
			rosters: RwLock::new(HashMap::new()),
		}
	}

	/// Reject single envelopes larger than `limit` bytes with `CapacityExceeded`.
	pub fn with_max_envelope_bytes(mut self, limit: u64) -> Self {
		self.max_envelope_bytes = Some(limit);
		self
	}

	pub fn retention(&self) -> usize {
		self.retention
	}

	async fn log_for(&self, device_id: &str) -> Option<Arc<RwLock<DeviceLog>>> {
		self.logs.read().await.get(device_id).cloned()
	}

	async fn log_for_write(&self, device_id: &str) -> Arc<RwLock<DeviceLog>> {
		if let Some(log) = self.log_for(device_id).await {
			return log;
		}
		let mut logs = self.logs.write().await;
		Arc::clone(logs.entry(device_id.to_string()).or_default())
	}
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new(DEFAULT_RETENTION)
	}
}

#[async_trait]
impl ManifestStore for MemoryStore {
	async fn store_manifest(&self, device_id: &str, envelope: ManifestEnvelope) -> Result<(), StoreError> {
		if let Some(limit) = self.max_envelope_bytes {
			if envelope.payload_len() > limit {
				return Err(StoreError::CapacityExceeded {
					device_id: device_id.to_string(),
					size: envelope.payload_len(),
					limit,
				});
			}
		}

		let log = self.log_for_write(device_id).await;
		let mut log = log.write().await;
		let evicted = log.push(envelope, self.retention);
		if evicted > 0 {
			debug!("Evicted {} manifest(s) for device {}", evicted, device_id);
		}
		Ok(())
	}

	async fn get_manifests(&self, device_id: &str, since: DateTime<Utc>) -> Result<Vec<ManifestEnvelope>, StoreError> {
		let Some(log) = self.log_for(device_id).await else {
			return Ok(Vec::new());
		};
		let log = log.read().await;
		Ok(log
			.entries
			.iter()
			.filter(|m| m.created_at > since)
			.cloned()
			.collect())
	}

	async fn get_device_list(&self, user_id: &str) -> Result<BTreeSet<String>, StoreError> {
		Ok(self.rosters.read().await.get(user_id).cloned().unwrap_or_default())
	}

	async fn register_device(&self, device: Device) -> Result<(), StoreError> {
		{
			let mut devices = self.devices.write().await;
			match devices.get_mut(&device.device_id) {
				Some(existing) => {
					existing.public_key = device.public_key.clone();
					existing.last_seen = device.last_seen;
				}
				None => {
					devices.insert(device.device_id.clone(), device.clone());
				}
			}
		}

		self.rosters
			.write()
			.await
			.entry(device.user_id)
			.or_default()
			.insert(device.device_id);
		Ok(())
	}

	async fn storage_used(&self, device_id: &str) -> Result<u64, StoreError> {
		match self.log_for(device_id).await {
			Some(log) => Ok(log.read().await.bytes),
			None => Ok(0),
		}
	}

	async fn manifest_count(&self, device_id: &str) -> Result<usize, StoreError> {
		match self.log_for(device_id).await {
			Some(log) => Ok(log.read().await.entries.len()),
			None => Ok(0),
		}
	}

	async fn total_storage_used(&self) -> Result<u64, StoreError> {
		let logs: Vec<_> = self.logs.read().await.values().cloned().collect();
		let mut total = 0;
		for log in logs {
			total += log.read().await.bytes;
		}
		Ok(total)
	}

	async fn device_count(&self) -> Result<usize, StoreError> {
		Ok(self.devices.read().await.len())
	}

	async fn ping(&self) -> Result<(), StoreError> {
		Ok(())
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::manifest::epoch;
	use chrono::{Duration, TimeZone};

	fn ts(secs: i64) -> DateTime<Utc> {
		Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
	}

	fn envelope(n: usize, at: DateTime<Utc>) -> ManifestEnvelope {
		ManifestEnvelope::new("device-a", vec![0u8; n % 7 + 1], format!("hash-{}", n), at)
	}

	#[tokio::test]
	async fn test_unknown_device_reads_empty() {
		let store = MemoryStore::default();
		assert!(store.get_manifests("nobody", epoch()).await.unwrap().is_empty());
		assert!(store.get_device_list("nobody").await.unwrap().is_empty());
		assert_eq!(store.storage_used("nobody").await.unwrap(), 0);
	}

	#[tokio::test]
	async fn test_eviction_keeps_most_recent_in_insertion_order() {
		let store = MemoryStore::default();
		// Timestamps deliberately run backwards: eviction follows insertion order.
		for n in 0..105 {
			store
				.store_manifest("device-a", envelope(n, ts(1000 - n as i64)))
				.await
				.unwrap();
		}

		let all = store.get_manifests("device-a", epoch()).await.unwrap();
		assert_eq!(all.len(), 100);
		let hashes: Vec<_> = all.iter().map(|m| m.payload_hash.clone()).collect();
		let expected: Vec<_> = (5..105).map(|n| format!("hash-{}", n)).collect();
		assert_eq!(hashes, expected);

		let bytes: u64 = all.iter().map(|m| m.payload_len()).sum();
		assert_eq!(store.storage_used("device-a").await.unwrap(), bytes);
	}

	#[tokio::test]
	async fn test_since_is_strict_and_preserves_order() {
		let store = MemoryStore::default();
		let at = [ts(30), ts(10), ts(20), ts(10), ts(40)];
		for (n, t) in at.iter().enumerate() {
			store.store_manifest("device-a", envelope(n, *t)).await.unwrap();
		}

		let after_10 = store.get_manifests("device-a", ts(10)).await.unwrap();
		let hashes: Vec<_> = after_10.iter().map(|m| m.payload_hash.as_str()).collect();
		assert_eq!(hashes, vec!["hash-0", "hash-2", "hash-4"]);

		assert!(store.get_manifests("device-a", ts(40)).await.unwrap().is_empty());
		assert_eq!(store.get_manifests("device-a", ts(40) - Duration::seconds(1)).await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_duplicates_are_kept() {
		let store = MemoryStore::default();
		let env = envelope(1, ts(1));
		store.store_manifest("device-a", env.clone()).await.unwrap();
		store.store_manifest("device-a", env).await.unwrap();
		assert_eq!(store.manifest_count("device-a").await.unwrap(), 2);
	}

	#[tokio::test]
	async fn test_oversized_envelope_rejected_without_mutation() {
		let store = MemoryStore::new(10).with_max_envelope_bytes(4);
		let big = ManifestEnvelope::new("device-a", vec![0u8; 5], "abc", ts(1));
		let err = store.store_manifest("device-a", big).await.unwrap_err();
		assert!(matches!(err, StoreError::CapacityExceeded { size: 5, limit: 4, .. }));
		assert_eq!(store.manifest_count("device-a").await.unwrap(), 0);
	}

	#[tokio::test]
	async fn test_register_device_is_idempotent() {
		let store = MemoryStore::default();
		let device = Device {
			device_id: "device-a".to_string(),
			user_id: "user-1".to_string(),
			public_key: "k1".to_string(),
			registered_at: ts(0),
			last_seen: ts(0),
		};
		store.register_device(device.clone()).await.unwrap();
		store
			.register_device(Device {
				public_key: "k2".to_string(),
				last_seen: ts(5),
				..device
			})
			.await
			.unwrap();

		let roster = store.get_device_list("user-1").await.unwrap();
		assert_eq!(roster.into_iter().collect::<Vec<_>>(), vec!["device-a".to_string()]);
		assert_eq!(store.device_count().await.unwrap(), 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn test_concurrent_appends_never_expose_partial_eviction() {
		let store = Arc::new(MemoryStore::new(100));
		let mut writers = Vec::new();
		for w in 0..4 {
			let store = Arc::clone(&store);
			writers.push(tokio::spawn(async move {
				for n in 0..100 {
					let env = ManifestEnvelope::new("device-a", vec![1u8; 3], format!("{}-{}", w, n), ts(n));
					store.store_manifest("device-a", env).await.unwrap();
				}
			}));
		}

		let reader = {
			let store = Arc::clone(&store);
			tokio::spawn(async move {
				for _ in 0..200 {
					let snapshot = store.get_manifests("device-a", epoch()).await.unwrap();
					assert!(snapshot.len() <= 100);
					tokio::task::yield_now().await;
				}
			})
		};

		for w in writers {
			w.await.unwrap();
		}
		reader.await.unwrap();

		assert_eq!(store.manifest_count("device-a").await.unwrap(), 100);
		assert_eq!(store.storage_used("device-a").await.unwrap(), 300);
		assert_eq!(store.total_storage_used().await.unwrap(), 300);
	}
}
