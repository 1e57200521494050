use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;

use super::ProfileDiff;

/// Policy for resolving a stale diff against the diff currently holding a field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
	/// Rank by declared base version, then later client timestamp, then the
	/// lexicographically smaller device id.
	#[default]
	LastWriterWins,
	/// The diff the server already applied keeps the field.
	AppliedWins,
}

impl ConflictPolicy {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::LastWriterWins => "last_writer_wins",
			Self::AppliedWins => "applied_wins",
		}
	}

	/// The strategy implementing this policy.
	pub fn strategy(self) -> Arc<dyn ResolutionStrategy> {
		match self {
			Self::LastWriterWins => Arc::new(LastWriterWins),
			Self::AppliedWins => Arc::new(AppliedWins),
		}
	}
}

impl FromStr for ConflictPolicy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"last_writer_wins" | "lww" => Ok(Self::LastWriterWins),
			"applied_wins" => Ok(Self::AppliedWins),
			other => Err(format!("unknown conflict policy '{}'", other)),
		}
	}
}

/// Which side of a conflict keeps the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
	Incumbent,
	Challenger,
}

/// The comparison that decided a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionRule {
	/// One diff was based on a later field version than the other.
	NewerBase,
	/// Same base; the later client timestamp won.
	LaterTimestamp,
	/// Same base and timestamp; the smaller device id won.
	DeviceOrder,
	/// The server had already applied the incumbent.
	AlreadyApplied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
	pub winner: Side,
	pub rule: ResolutionRule,
}

impl Verdict {
	fn incumbent(rule: ResolutionRule) -> Self {
		Self {
			winner: Side::Incumbent,
			rule,
		}
	}

	fn challenger(rule: ResolutionRule) -> Self {
		Self {
			winner: Side::Challenger,
			rule,
		}
	}
}

/// Pluggable conflict resolution.
///
/// `incumbent` is the diff that produced the field's current value and
/// `challenger` a diff whose base version is already superseded. The verdict
/// must depend only on the two diffs so resolution is reproducible.
pub trait ResolutionStrategy: Send + Sync {
	fn policy(&self) -> ConflictPolicy;

	fn resolve(&self, incumbent: &ProfileDiff, challenger: &ProfileDiff) -> Verdict;
}

/// Last Writer Wins with an explicit, total tie-break.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl ResolutionStrategy for LastWriterWins {
	fn policy(&self) -> ConflictPolicy {
		ConflictPolicy::LastWriterWins
	}

	fn resolve(&self, incumbent: &ProfileDiff, challenger: &ProfileDiff) -> Verdict {
		match challenger.base_version.cmp(&incumbent.base_version) {
			Ordering::Greater => return Verdict::challenger(ResolutionRule::NewerBase),
			Ordering::Less => return Verdict::incumbent(ResolutionRule::NewerBase),
			Ordering::Equal => {}
		}

		match challenger.client_timestamp.cmp(&incumbent.client_timestamp) {
			Ordering::Greater => return Verdict::challenger(ResolutionRule::LaterTimestamp),
			Ordering::Less => return Verdict::incumbent(ResolutionRule::LaterTimestamp),
			Ordering::Equal => {}
		}

		match challenger.device_id.cmp(&incumbent.device_id) {
			Ordering::Less => Verdict::challenger(ResolutionRule::DeviceOrder),
			Ordering::Greater => Verdict::incumbent(ResolutionRule::DeviceOrder),
			// Same device resubmitting the same edit.
			Ordering::Equal => Verdict::incumbent(ResolutionRule::AlreadyApplied),
		}
	}
}

/// Server receipt order: whatever was applied first holds the field.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppliedWins;

impl ResolutionStrategy for AppliedWins {
	fn policy(&self) -> ConflictPolicy {
		ConflictPolicy::AppliedWins
	}

	fn resolve(&self, _incumbent: &ProfileDiff, _challenger: &ProfileDiff) -> Verdict {
		Verdict::incumbent(ResolutionRule::AlreadyApplied)
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use chrono::{TimeZone, Utc};
	use serde_json::json;

	fn diff(device: &str, base: u64, secs: i64) -> ProfileDiff {
		ProfileDiff::new(
			"dns_settings",
			base,
			json!(device),
			device,
			Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
		)
	}

	#[test]
	fn test_later_timestamp_wins() {
		let lww = LastWriterWins;
		let v = lww.resolve(&diff("a", 0, 10), &diff("b", 0, 20));
		assert_eq!(v, Verdict::challenger(ResolutionRule::LaterTimestamp));
		let v = lww.resolve(&diff("a", 0, 20), &diff("b", 0, 10));
		assert_eq!(v, Verdict::incumbent(ResolutionRule::LaterTimestamp));
	}

	#[test]
	fn test_equal_timestamps_smaller_device_wins() {
		let lww = LastWriterWins;
		assert_eq!(
			lww.resolve(&diff("node2", 0, 10), &diff("node1", 0, 10)).winner,
			Side::Challenger
		);
		assert_eq!(
			lww.resolve(&diff("node1", 0, 10), &diff("node2", 0, 10)).winner,
			Side::Incumbent
		);
	}

	#[test]
	fn test_newer_base_beats_timestamp() {
		let lww = LastWriterWins;
		let v = lww.resolve(&diff("a", 3, 0), &diff("b", 2, 99));
		assert_eq!(v, Verdict::incumbent(ResolutionRule::NewerBase));
	}

	#[test]
	fn test_verdict_is_symmetric() {
		let lww = LastWriterWins;
		let pairs = [
			(diff("a", 1, 5), diff("b", 1, 7)),
			(diff("b", 1, 5), diff("a", 1, 5)),
			(diff("a", 0, 9), diff("b", 2, 1)),
		];
		for (x, y) in pairs {
			let forward = lww.resolve(&x, &y);
			let backward = lww.resolve(&y, &x);
			let winner_fwd = if forward.winner == Side::Challenger { &y } else { &x };
			let winner_bwd = if backward.winner == Side::Challenger { &x } else { &y };
			assert_eq!(winner_fwd, winner_bwd);
			assert_eq!(forward.rule, backward.rule);
		}
	}

	#[test]
	fn test_applied_wins_ignores_timestamps() {
		let v = AppliedWins.resolve(&diff("a", 0, 10), &diff("b", 0, 999));
		assert_eq!(v, Verdict::incumbent(ResolutionRule::AlreadyApplied));
	}

	#[test]
	fn test_policy_parsing() {
		assert_eq!("applied_wins".parse::<ConflictPolicy>(), Ok(ConflictPolicy::AppliedWins));
		assert_eq!("LWW".parse::<ConflictPolicy>(), Ok(ConflictPolicy::LastWriterWins));
		assert!("crdt".parse::<ConflictPolicy>().is_err());
		assert_eq!(ConflictPolicy::default().strategy().policy(), ConflictPolicy::LastWriterWins);
	}
}
