//! Per-device manifest logs and the device roster.
//!
//! Callers depend only on the `ManifestStore` capability set; `MemoryStore` is
//! the in-process backend used by the alpha service and the tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

pub use memory::MemoryStore;

/// Default number of manifests retained per device.
pub const DEFAULT_RETENTION: usize = 100;

/// An opaque, client-encrypted manifest plus the metadata the service may see.
///
/// Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEnvelope {
	pub device_id: String,
	/// Ciphertext; base64 on the wire.
	#[serde(with = "payload_base64")]
	pub payload: Vec<u8>,
	/// Client-computed digest of the plaintext.
	pub payload_hash: String,
	pub created_at: DateTime<Utc>,
}

impl ManifestEnvelope {
	pub fn new(
		device_id: impl Into<String>,
		payload: Vec<u8>,
		payload_hash: impl Into<String>,
		created_at: DateTime<Utc>,
	) -> Self {
		Self {
			device_id: device_id.into(),
			payload,
			payload_hash: payload_hash.into(),
			created_at,
		}
	}

	pub fn payload_len(&self) -> u64 {
		self.payload.len() as u64
	}
}

/// A device known to the service. Created on first authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
	pub device_id: String,
	pub user_id: String,
	pub public_key: String,
	pub registered_at: DateTime<Utc>,
	pub last_seen: DateTime<Utc>,
}

/// The zero timestamp: `get_manifests` with this bound returns the whole retained window.
pub fn epoch() -> DateTime<Utc> {
	DateTime::<Utc>::UNIX_EPOCH
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
	#[error("storage capacity exceeded for device {device_id}: {size} bytes exceeds limit of {limit}")]
	CapacityExceeded { device_id: String, size: u64, limit: u64 },
	#[error("storage backend error: {0}")]
	Backend(String),
}

/// Storage capability set required by the sync service.
#[async_trait]
pub trait ManifestStore: Send + Sync + 'static {
	/// Append to the device's log, evicting the oldest entries beyond the
	/// retention bound. Duplicate uploads are stored as separate entries.
	async fn store_manifest(&self, device_id: &str, envelope: ManifestEnvelope) -> Result<(), StoreError>;

	/// Envelopes with `created_at` strictly after `since`, in insertion order.
	/// Unknown devices yield an empty list.
	async fn get_manifests(&self, device_id: &str, since: DateTime<Utc>) -> Result<Vec<ManifestEnvelope>, StoreError>;

	/// Devices associated with a user; empty for unknown users.
	async fn get_device_list(&self, user_id: &str) -> Result<BTreeSet<String>, StoreError>;

	/// Associate a device with its user, refreshing key and last-seen time on repeat.
	async fn register_device(&self, device: Device) -> Result<(), StoreError>;

	/// Sum of payload sizes across the device's retained manifests.
	async fn storage_used(&self, device_id: &str) -> Result<u64, StoreError>;

	async fn manifest_count(&self, device_id: &str) -> Result<usize, StoreError>;

	/// Payload bytes retained across every device.
	async fn total_storage_used(&self) -> Result<u64, StoreError>;

	/// Number of registered devices across all users.
	async fn device_count(&self) -> Result<usize, StoreError>;

	/// Lightweight readiness check.
	async fn ping(&self) -> Result<(), StoreError>;
}

mod payload_base64 {
	use base64::Engine;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
		let encoded = String::deserialize(deserializer)?;
		base64::engine::general_purpose::STANDARD
			.decode(encoded.as_bytes())
			.map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_envelope_payload_is_base64_on_the_wire() {
		let env = ManifestEnvelope::new("device-a", b"\x00\x01cipher".to_vec(), "abc", epoch());
		let value = serde_json::to_value(&env).unwrap();
		assert_eq!(value["payload"], json!("AAFjaXBoZXI="));

		let back: ManifestEnvelope = serde_json::from_value(value).unwrap();
		assert_eq!(back, env);
		assert_eq!(back.payload_len(), 8);
	}

	#[test]
	fn test_envelope_rejects_bad_payload_encoding() {
		let value = json!({
			"device_id": "device-a",
			"payload": "%%%",
			"payload_hash": "abc",
			"created_at": "2026-01-01T00:00:00Z"
		});
		assert!(serde_json::from_value::<ManifestEnvelope>(value).is_err());
	}
}
