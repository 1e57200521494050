use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};

use super::{
	AppliedDiff, ConflictPolicy, ConflictRecord, DiffError, DiffRejection, ProfileDiff, ResolutionStrategy,
	ServerDiff, Side, SyncOutcome,
};
use crate::config::Settings;

/// How the diff currently holding a field got there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadKind {
	Clean,
	Resolved,
}

struct FieldRecord {
	value: Value,
	logical_version: u64,
	/// The diff that produced `value`; `None` until the first write.
	head: Option<ProfileDiff>,
	head_kind: HeadKind,
	/// Arena change sequence of the last write.
	change_seq: u64,
}

impl FieldRecord {
	fn empty() -> Self {
		Self {
			value: Value::Null,
			logical_version: 0,
			head: None,
			head_kind: HeadKind::Clean,
			change_seq: 0,
		}
	}

	fn install(&mut self, diff: ProfileDiff, kind: HeadKind, seq: u64) -> u64 {
		self.value = diff.new_value.clone();
		self.logical_version += 1;
		self.head = Some(diff);
		self.head_kind = kind;
		self.change_seq = seq;
		self.logical_version
	}
}

/// Read-only copy of a field's canonical state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldState {
	pub field_name: String,
	pub value: Value,
	pub logical_version: u64,
	pub last_writer: Option<String>,
	pub client_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct SyncPoint {
	seq: u64,
	at: DateTime<Utc>,
}

/// One user's profile: a fixed arena of field records, each behind its own lock.
struct ProfileArena {
	fields: BTreeMap<String, Mutex<FieldRecord>>,
	change_seq: AtomicU64,
	sync_points: Mutex<HashMap<String, SyncPoint>>,
	/// Records whose loser came from another device, held until that device syncs.
	pending: Mutex<HashMap<String, Vec<ConflictRecord>>>,
}

impl ProfileArena {
	fn new(fields: &BTreeSet<String>) -> Self {
		Self {
			fields: fields
				.iter()
				.map(|name| (name.clone(), Mutex::new(FieldRecord::empty())))
				.collect(),
			change_seq: AtomicU64::new(0),
			sync_points: Mutex::new(HashMap::new()),
			pending: Mutex::new(HashMap::new()),
		}
	}

	/// Must be called while holding the lock of the field being written.
	fn next_seq(&self) -> u64 {
		self.change_seq.fetch_add(1, Ordering::SeqCst) + 1
	}
}

/// Reconciles profile diffs for every user.
///
/// Arenas are created lazily per user; the set of known fields is fixed at
/// construction. Calls touching different fields never wait on each other.
pub struct ConflictEngine {
	fields: BTreeSet<String>,
	strategy: Arc<dyn ResolutionStrategy>,
	arenas: RwLock<HashMap<String, Arc<ProfileArena>>>,
}

impl ConflictEngine {
	pub fn new<I, S>(fields: I, strategy: Arc<dyn ResolutionStrategy>) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			fields: fields.into_iter().map(Into::into).collect(),
			strategy,
			arenas: RwLock::new(HashMap::new()),
		}
	}

	pub fn with_policy<I, S>(fields: I, policy: ConflictPolicy) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self::new(fields, policy.strategy())
	}

	pub fn from_settings(settings: &Settings) -> Self {
		Self::with_policy(settings.profile_fields.iter().cloned(), settings.conflict_policy)
	}

	pub fn policy(&self) -> ConflictPolicy {
		self.strategy.policy()
	}

	pub fn known_fields(&self) -> impl Iterator<Item = &str> {
		self.fields.iter().map(String::as_str)
	}

	async fn existing_arena(&self, user_id: &str) -> Option<Arc<ProfileArena>> {
		self.arenas.read().await.get(user_id).cloned()
	}

	async fn arena(&self, user_id: &str) -> Arc<ProfileArena> {
		if let Some(arena) = self.existing_arena(user_id).await {
			return arena;
		}
		let mut arenas = self.arenas.write().await;
		Arc::clone(
			arenas
				.entry(user_id.to_string())
				.or_insert_with(|| Arc::new(ProfileArena::new(&self.fields))),
		)
	}

	pub async fn sync(&self, user_id: &str, device_id: &str, diffs: Vec<ProfileDiff>) -> SyncOutcome {
		self.sync_at(user_id, device_id, diffs, Utc::now()).await
	}

	/// Apply a batch in submission order, then collect the fields that changed
	/// since the device's previous sync point.
	///
	/// Per-diff failures are reported in `rejected`; the batch itself never fails.
	/// `conflicts` also carries records for this device's earlier diffs that lost
	/// to a later resolution, each delivered once.
	pub async fn sync_at(
		&self,
		user_id: &str,
		device_id: &str,
		diffs: Vec<ProfileDiff>,
		now: DateTime<Utc>,
	) -> SyncOutcome {
		let arena = self.arena(user_id).await;
		let seen = arena
			.sync_points
			.lock()
			.await
			.get(device_id)
			.map(|p| p.seq)
			.unwrap_or(0);

		let mut outcome = SyncOutcome {
			applied: Vec::new(),
			conflicts: Vec::new(),
			resolved: 0,
			rejected: Vec::new(),
			server_diffs: Vec::new(),
			sync_point: seen,
			synced_at: now,
		};

		for (index, mut diff) in diffs.into_iter().enumerate() {
			diff.device_id = device_id.to_string();
			self.merge_one(&arena, index, diff, &mut outcome).await;
		}

		// Anything allocated up to here was committed under a field lock we
		// are about to take, so it is either in this scan or above the watermark.
		let watermark = arena.change_seq.load(Ordering::SeqCst);
		for (name, slot) in &arena.fields {
			let record = slot.lock().await;
			if record.change_seq <= seen {
				continue;
			}
			let Some(head) = &record.head else {
				continue;
			};
			if record.head_kind == HeadKind::Clean && head.device_id == device_id {
				continue;
			}
			outcome.server_diffs.push(ServerDiff {
				field_name: name.clone(),
				logical_version: record.logical_version,
				value: record.value.clone(),
				last_writer: head.device_id.clone(),
				client_timestamp: head.client_timestamp,
			});
		}

		outcome.resolved = outcome.conflicts.len();
		if let Some(held) = arena.pending.lock().await.remove(device_id) {
			outcome.conflicts.extend(held);
		}

		let mut points = arena.sync_points.lock().await;
		let point = points.entry(device_id.to_string()).or_insert(SyncPoint { seq: 0, at: now });
		point.seq = point.seq.max(watermark);
		point.at = now;
		outcome.sync_point = point.seq;
		drop(points);

		info!(
			"Profile sync for device {}: {} applied, {} conflict(s), {} rejected, {} server diff(s)",
			device_id,
			outcome.applied.len(),
			outcome.conflicts.len(),
			outcome.rejected.len(),
			outcome.server_diffs.len()
		);
		outcome
	}

	async fn merge_one(&self, arena: &ProfileArena, index: usize, diff: ProfileDiff, outcome: &mut SyncOutcome) {
		let Some(slot) = arena.fields.get(&diff.field_name) else {
			let err = DiffError::UnknownField(diff.field_name.clone());
			debug!("Rejecting diff {} from {}: {}", index, diff.device_id, err);
			outcome.rejected.push(DiffRejection::new(index, &diff.field_name, &err));
			return;
		};

		let mut record = slot.lock().await;
		let current = record.logical_version;

		if diff.base_version > current {
			let err = DiffError::FutureBaseVersion {
				field: diff.field_name.clone(),
				declared: diff.base_version,
				current,
			};
			debug!("Rejecting diff {} from {}: {}", index, diff.device_id, err);
			outcome.rejected.push(DiffRejection::new(index, &diff.field_name, &err));
			return;
		}

		let stale = diff.base_version < current;
		let incumbent = match record.head.as_ref().filter(|_| stale).cloned() {
			Some(head) => head,
			// Clean apply. A stale diff always finds a head since current > 0.
			None => {
				let field_name = diff.field_name.clone();
				let version = record.install(diff, HeadKind::Clean, arena.next_seq());
				outcome.applied.push(AppliedDiff {
					field_name,
					logical_version: version,
				});
				return;
			}
		};

		let verdict = self.strategy.resolve(&incumbent, &diff);
		let caller = diff.device_id.clone();
		let (winner, loser) = match verdict.winner {
			Side::Challenger => {
				record.install(diff.clone(), HeadKind::Resolved, arena.next_seq());
				(diff, incumbent)
			}
			Side::Incumbent => (incumbent, diff),
		};
		debug!(
			"Conflict on '{}': {} beat {} ({:?})",
			winner.field_name, winner.device_id, loser.device_id, verdict.rule
		);
		let conflict = ConflictRecord {
			field_name: winner.field_name.clone(),
			winner,
			loser,
			policy: self.strategy.policy(),
			rule: verdict.rule,
		};
		if conflict.loser.device_id != caller {
			arena
				.pending
				.lock()
				.await
				.entry(conflict.loser.device_id.clone())
				.or_default()
				.push(conflict.clone());
		}
		outcome.conflicts.push(conflict);
	}

	/// Current canonical state of a field, if the field is known.
	pub async fn field(&self, user_id: &str, field_name: &str) -> Option<FieldState> {
		if !self.fields.contains(field_name) {
			return None;
		}
		let Some(arena) = self.existing_arena(user_id).await else {
			return Some(FieldState {
				field_name: field_name.to_string(),
				value: Value::Null,
				logical_version: 0,
				last_writer: None,
				client_timestamp: None,
			});
		};
		let record = arena.fields.get(field_name)?.lock().await;
		Some(FieldState {
			field_name: field_name.to_string(),
			value: record.value.clone(),
			logical_version: record.logical_version,
			last_writer: record.head.as_ref().map(|h| h.device_id.clone()),
			client_timestamp: record.head.as_ref().map(|h| h.client_timestamp),
		})
	}

	pub async fn last_sync(&self, user_id: &str, device_id: &str) -> Option<DateTime<Utc>> {
		let arena = self.existing_arena(user_id).await?;
		let points = arena.sync_points.lock().await;
		points.get(device_id).map(|p| p.at)
	}

	/// Number of fields written at least once for this user.
	pub async fn total_profiles(&self, user_id: &str) -> usize {
		let Some(arena) = self.existing_arena(user_id).await else {
			return 0;
		};
		let mut written = 0;
		for slot in arena.fields.values() {
			if slot.lock().await.logical_version > 0 {
				written += 1;
			}
		}
		written
	}
}
