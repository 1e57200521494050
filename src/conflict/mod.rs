//! Per-field profile reconciliation across a user's devices.
//!
//! Every field carries a server-assigned `logical_version`. A diff declaring
//! the current version applies cleanly; a diff declaring an older version is a
//! conflict and goes to the configured `ResolutionStrategy`. Either way the
//! outcome is reported back to the submitting device.

pub mod engine;
pub mod strategy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use engine::{ConflictEngine, FieldState};
pub use strategy::{AppliedWins, ConflictPolicy, LastWriterWins, ResolutionRule, ResolutionStrategy, Side, Verdict};

/// A proposed mutation to one profile field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDiff {
	pub field_name: String,
	/// Version the client believes is current.
	pub base_version: u64,
	/// Opaque to the server.
	pub new_value: Value,
	/// Stamped by the server with the authenticated device.
	#[serde(default)]
	pub device_id: String,
	pub client_timestamp: DateTime<Utc>,
}

impl ProfileDiff {
	pub fn new(
		field_name: impl Into<String>,
		base_version: u64,
		new_value: Value,
		device_id: impl Into<String>,
		client_timestamp: DateTime<Utc>,
	) -> Self {
		Self {
			field_name: field_name.into(),
			base_version,
			new_value,
			device_id: device_id.into(),
			client_timestamp,
		}
	}
}

/// Report of one stale diff and how it was settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
	pub field_name: String,
	pub winner: ProfileDiff,
	pub loser: ProfileDiff,
	pub policy: ConflictPolicy,
	pub rule: ResolutionRule,
}

/// Canonical field state a device has not seen yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDiff {
	pub field_name: String,
	pub logical_version: u64,
	pub value: Value,
	pub last_writer: String,
	pub client_timestamp: DateTime<Utc>,
}

/// A diff applied without conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDiff {
	pub field_name: String,
	pub logical_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
	#[error("unknown profile field '{0}'")]
	UnknownField(String),
	#[error("field '{field}' is at version {current}, diff declares base {declared}")]
	FutureBaseVersion { field: String, declared: u64, current: u64 },
}

impl DiffError {
	pub fn code(&self) -> &'static str {
		match self {
			Self::UnknownField(_) => "unknown_field",
			Self::FutureBaseVersion { .. } => "future_base_version",
		}
	}
}

/// A diff rejected individually; the rest of its batch is unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRejection {
	/// Position of the diff in the submitted batch.
	pub index: usize,
	pub field_name: String,
	pub code: String,
	pub message: String,
}

impl DiffRejection {
	fn new(index: usize, field_name: &str, err: &DiffError) -> Self {
		Self {
			index,
			field_name: field_name.to_string(),
			code: err.code().to_string(),
			message: err.to_string(),
		}
	}
}

/// Result of one profile sync batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
	pub applied: Vec<AppliedDiff>,
	pub conflicts: Vec<ConflictRecord>,
	/// How many of `conflicts` this batch settled; the rest are held reports.
	#[serde(default)]
	pub resolved: usize,
	pub rejected: Vec<DiffRejection>,
	pub server_diffs: Vec<ServerDiff>,
	/// Change sequence the device has now seen up to.
	pub sync_point: u64,
	pub synced_at: DateTime<Utc>,
}
