//! Payload integrity checks at the edge of the end-to-end encrypted channel.
//!
//! Only the declared digest is examined. Payloads are ciphertext and are never
//! inspected here.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::manifest::ManifestEnvelope;

/// Longest bare digest accepted (a hex SHA-512 is 128 characters).
const MAX_BARE_DIGEST_LEN: usize = 128;

static BARE_DIGEST: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"^[A-Za-z0-9+/_=-]+$").expect("valid bare digest pattern"));
static HEX_DIGEST: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-fA-F]+$").expect("valid hex pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
	#[error("missing payload hash")]
	MissingDigest,
	#[error("malformed payload hash: {0}")]
	MalformedDigest(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
	Sha256,
	Sha512,
	Blake3,
}

impl DigestAlgorithm {
	fn from_prefix(prefix: &str) -> Option<Self> {
		match prefix.to_ascii_lowercase().as_str() {
			"sha256" => Some(Self::Sha256),
			"sha512" => Some(Self::Sha512),
			"blake3" => Some(Self::Blake3),
			_ => None,
		}
	}

	/// Length of the hex encoding of this algorithm's output.
	pub fn hex_len(self) -> usize {
		match self {
			Self::Sha256 | Self::Blake3 => 64,
			Self::Sha512 => 128,
		}
	}
}

/// How a digest that passed verification was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestFormat {
	/// Bare hex/base64 text; only its alphabet and length are checked.
	Bare,
	/// `algorithm:hex`, checked against the algorithm's exact length.
	Prefixed(DigestAlgorithm),
}

/// Verify an envelope's declared digest before it may be stored.
pub fn verify(envelope: &ManifestEnvelope) -> Result<DigestFormat, IntegrityError> {
	verify_digest(&envelope.payload_hash)
}

pub fn verify_digest(digest: &str) -> Result<DigestFormat, IntegrityError> {
	if digest.is_empty() {
		return Err(IntegrityError::MissingDigest);
	}

	if let Some((prefix, body)) = digest.split_once(':') {
		let algorithm = DigestAlgorithm::from_prefix(prefix)
			.ok_or_else(|| IntegrityError::MalformedDigest(format!("unknown digest algorithm '{}'", prefix)))?;
		if body.len() != algorithm.hex_len() || !HEX_DIGEST.is_match(body) {
			return Err(IntegrityError::MalformedDigest(format!(
				"{:?} digest must be {} hex characters",
				algorithm,
				algorithm.hex_len()
			)));
		}
		return Ok(DigestFormat::Prefixed(algorithm));
	}

	if digest.len() > MAX_BARE_DIGEST_LEN {
		return Err(IntegrityError::MalformedDigest(format!(
			"digest longer than {} characters",
			MAX_BARE_DIGEST_LEN
		)));
	}
	if !BARE_DIGEST.is_match(digest) {
		return Err(IntegrityError::MalformedDigest(
			"digest must be hex or base64 text".to_string(),
		));
	}
	Ok(DigestFormat::Bare)
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn test_empty_digest_is_missing() {
		assert_eq!(verify_digest(""), Err(IntegrityError::MissingDigest));
	}

	#[test]
	fn test_bare_digests() {
		assert_eq!(verify_digest("abc"), Ok(DigestFormat::Bare));
		assert_eq!(verify_digest("q83vEjRWeJA="), Ok(DigestFormat::Bare));
		assert!(matches!(verify_digest("has space"), Err(IntegrityError::MalformedDigest(_))));
		assert!(matches!(verify_digest(&"a".repeat(129)), Err(IntegrityError::MalformedDigest(_))));
	}

	#[test]
	fn test_prefixed_digests() {
		let sha256 = format!("sha256:{}", "ab".repeat(32));
		assert_eq!(verify_digest(&sha256), Ok(DigestFormat::Prefixed(DigestAlgorithm::Sha256)));

		let sha512 = format!("SHA512:{}", "0f".repeat(64));
		assert_eq!(verify_digest(&sha512), Ok(DigestFormat::Prefixed(DigestAlgorithm::Sha512)));

		assert!(verify_digest("sha256:abcd").is_err());
		assert!(verify_digest(&format!("md5:{}", "ab".repeat(16))).is_err());
		assert!(verify_digest(&format!("blake3:{}", "zz".repeat(32))).is_err());
	}
}
