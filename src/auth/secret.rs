use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;
use thiserror::Error;

/// Minimum HS256 key length accepted for signing credentials.
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum SecretError {
	#[error("signing secret must be at least {min} bytes, got {len}")]
	TooShort { len: usize, min: usize },
	#[error("signing secret is not valid base64: {0}")]
	Encoding(#[from] base64::DecodeError),
	#[error("system random source unavailable")]
	Random,
}

/// Process-wide HMAC key used to sign access and refresh credentials.
///
/// Constructed explicitly at startup (from configuration or freshly generated)
/// and handed to the `TokenIssuer`; never persisted by the service.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningSecret(Vec<u8>);

impl SigningSecret {
	/// Generate a new 32-byte secret from the system CSPRNG.
	pub fn generate() -> Result<Self, SecretError> {
		let rng = SystemRandom::new();
		let mut bytes = vec![0u8; MIN_SECRET_LEN];
		rng.fill(&mut bytes).map_err(|_| SecretError::Random)?;
		Ok(Self(bytes))
	}

	pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, SecretError> {
		if bytes.len() < MIN_SECRET_LEN {
			return Err(SecretError::TooShort {
				len: bytes.len(),
				min: MIN_SECRET_LEN,
			});
		}
		Ok(Self(bytes))
	}

	pub fn from_base64(encoded: &str) -> Result<Self, SecretError> {
		let bytes = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
		Self::from_bytes(bytes)
	}

	pub fn to_base64(&self) -> String {
		base64::engine::general_purpose::STANDARD.encode(&self.0)
	}

	pub(crate) fn as_bytes(&self) -> &[u8] {
		&self.0
	}
}

impl fmt::Debug for SigningSecret {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "SigningSecret({} bytes, redacted)", self.0.len())
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn generated_secrets_differ() {
		let a = SigningSecret::generate().unwrap();
		let b = SigningSecret::generate().unwrap();
		assert_eq!(a.as_bytes().len(), MIN_SECRET_LEN);
		assert_ne!(a, b);
	}

	#[test]
	fn short_secret_rejected() {
		let err = SigningSecret::from_bytes(vec![1u8; 8]).unwrap_err();
		assert!(matches!(err, SecretError::TooShort { len: 8, .. }));
	}

	#[test]
	fn base64_round_trip_and_redacted_debug() {
		let secret = SigningSecret::from_bytes(vec![7u8; 48]).unwrap();
		let decoded = SigningSecret::from_base64(&secret.to_base64()).unwrap();
		assert_eq!(secret, decoded);
		assert!(!format!("{:?}", secret).contains('7'));
	}
}
