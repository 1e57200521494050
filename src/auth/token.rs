use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{PoisonError, RwLock};

use super::AuthError;
use super::secret::{SecretError, SigningSecret};
use crate::config::{MAX_TOKEN_TTL_SECS, Settings};

const PEM_BEGIN: &str = "-----BEGIN PUBLIC KEY-----";
const PEM_END: &str = "-----END PUBLIC KEY-----";
const MIN_PUBLIC_KEY_LEN: usize = 32;
const MAX_PUBLIC_KEY_LEN: usize = 4096;
/// Bytes of the SHA-256 digest kept when deriving a user id.
const USER_ID_DIGEST_LEN: usize = 16;

/// Which of the two credentials a token is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
	Access,
	Refresh,
}

/// Claims carried by both access and refresh credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
	pub sub: String,
	pub device_id: String,
	pub user_id: String,
	pub kind: TokenKind,
	pub iss: String,
	pub iat: i64,
	pub exp: i64,
}

/// Result of a successful authentication or refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedTokens {
	pub device_id: String,
	pub user_id: String,
	pub access_token: String,
	pub refresh_token: String,
	/// Access credential lifetime in seconds.
	pub expires_in: u64,
}

/// Issuer name and credential lifetimes.
#[derive(Debug, Clone)]
pub struct TokenConfig {
	pub issuer: String,
	pub access_ttl: Duration,
	pub refresh_ttl: Duration,
}

impl Default for TokenConfig {
	fn default() -> Self {
		Self {
			issuer: "bifrost-sync".to_string(),
			access_ttl: Duration::hours(1),
			refresh_ttl: Duration::hours(24),
		}
	}
}

/// Lifetimes beyond `MAX_TOKEN_TTL_SECS` are clamped to it.
fn ttl_from_secs(secs: u64) -> Duration {
	let secs = secs.min(MAX_TOKEN_TTL_SECS) as i64;
	Duration::try_seconds(secs).unwrap_or_else(|| Duration::days(365))
}

impl From<&Settings> for TokenConfig {
	fn from(settings: &Settings) -> Self {
		Self {
			issuer: settings.token_issuer.clone(),
			access_ttl: ttl_from_secs(settings.access_token_ttl_secs),
			refresh_ttl: ttl_from_secs(settings.refresh_token_ttl_secs),
		}
	}
}

struct KeyRing {
	current: SigningSecret,
	/// Secret replaced by the last rotation; still accepted for validation.
	previous: Option<SigningSecret>,
}

/// Stateless credential issuer and validator.
///
/// Validity of a credential is decided only by its HS256 signature and its
/// expiry; no session table is kept.
pub struct TokenIssuer {
	config: TokenConfig,
	keys: RwLock<KeyRing>,
}

impl TokenIssuer {
	pub fn new(config: TokenConfig, secret: SigningSecret) -> Self {
		Self {
			config,
			keys: RwLock::new(KeyRing {
				current: secret,
				previous: None,
			}),
		}
	}

	/// Build an issuer from settings, generating a secret when none is configured.
	pub fn from_settings(settings: &Settings) -> Result<Self, SecretError> {
		let secret = match settings.token_secret.as_deref() {
			Some(encoded) => SigningSecret::from_base64(encoded)?,
			None => {
				warn!("No token secret configured; generated an ephemeral one (credentials will not survive a restart)");
				SigningSecret::generate()?
			}
		};
		Ok(Self::new(TokenConfig::from(settings), secret))
	}

	pub fn access_ttl_secs(&self) -> u64 {
		self.config.access_ttl.num_seconds().max(0) as u64
	}

	/// Authenticate a device and issue an access/refresh pair.
	pub fn authenticate(&self, device_id: &str, public_key: &str) -> Result<IssuedTokens, AuthError> {
		self.authenticate_at(device_id, public_key, Utc::now())
	}

	pub fn authenticate_at(
		&self,
		device_id: &str,
		public_key: &str,
		now: DateTime<Utc>,
	) -> Result<IssuedTokens, AuthError> {
		info!("Authentication request for device: {}", device_id);

		if device_id.trim().is_empty() {
			return Err(AuthError::InvalidCredentials("device_id is empty".to_string()));
		}
		validate_public_key(public_key)?;

		let user_id = derive_user_id(device_id);
		self.issue_pair(device_id, &user_id, now)
	}

	/// Exchange a valid refresh credential for a new pair.
	pub fn refresh(&self, refresh_token: &str) -> Result<IssuedTokens, AuthError> {
		self.refresh_at(refresh_token, Utc::now())
	}

	pub fn refresh_at(&self, refresh_token: &str, now: DateTime<Utc>) -> Result<IssuedTokens, AuthError> {
		let claims = self.validate_at(refresh_token, TokenKind::Refresh, now)?;
		debug!("Refreshing credentials for device: {}", claims.device_id);
		self.issue_pair(&claims.device_id, &claims.user_id, now)
	}

	/// Validate an access credential, returning its claims.
	pub fn validate_access(&self, token: &str) -> Result<Claims, AuthError> {
		self.validate_at(token, TokenKind::Access, Utc::now())
	}

	/// Validate a credential of the expected kind as of `now`.
	///
	/// A credential is expired once `now` reaches its `exp` claim.
	pub fn validate_at(&self, token: &str, expected: TokenKind, now: DateTime<Utc>) -> Result<Claims, AuthError> {
		let claims = self.verify_signature(token)?;

		if now.timestamp() >= claims.exp {
			debug!("Rejected expired {:?} credential for device: {}", claims.kind, claims.device_id);
			return Err(AuthError::Expired);
		}
		if claims.kind != expected {
			return Err(AuthError::InvalidCredentials(format!(
				"expected {:?} credential, got {:?}",
				expected, claims.kind
			)));
		}
		if claims.sub != claims.device_id || claims.user_id != derive_user_id(&claims.device_id) {
			return Err(AuthError::InvalidCredentials("credential identity binding is inconsistent".to_string()));
		}

		Ok(claims)
	}

	/// Replace the signing secret. Credentials signed with the replaced secret
	/// keep validating until they expire or the next rotation.
	pub fn rotate_secret(&self, secret: SigningSecret) {
		let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
		let old = std::mem::replace(&mut keys.current, secret);
		keys.previous = Some(old);
		info!("Token signing secret rotated");
	}

	fn issue_pair(&self, device_id: &str, user_id: &str, now: DateTime<Utc>) -> Result<IssuedTokens, AuthError> {
		let access_token = self.sign(device_id, user_id, TokenKind::Access, now)?;
		let refresh_token = self.sign(device_id, user_id, TokenKind::Refresh, now)?;

		Ok(IssuedTokens {
			device_id: device_id.to_string(),
			user_id: user_id.to_string(),
			access_token,
			refresh_token,
			expires_in: self.access_ttl_secs(),
		})
	}

	fn sign(&self, device_id: &str, user_id: &str, kind: TokenKind, now: DateTime<Utc>) -> Result<String, AuthError> {
		let ttl = match kind {
			TokenKind::Access => self.config.access_ttl,
			TokenKind::Refresh => self.config.refresh_ttl,
		};
		let exp = now
			.checked_add_signed(ttl)
			.ok_or_else(|| AuthError::Signing("credential expiry out of range".to_string()))?;
		let claims = Claims {
			sub: device_id.to_string(),
			device_id: device_id.to_string(),
			user_id: user_id.to_string(),
			kind,
			iss: self.config.issuer.clone(),
			iat: now.timestamp(),
			exp: exp.timestamp(),
		};

		let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
		encode(
			&Header::new(Algorithm::HS256),
			&claims,
			&EncodingKey::from_secret(keys.current.as_bytes()),
		)
		.map_err(|e| AuthError::Signing(e.to_string()))
	}

	fn verify_signature(&self, token: &str) -> Result<Claims, AuthError> {
		let mut validation = Validation::new(Algorithm::HS256);
		// Expiry is checked against the caller-supplied clock instead.
		validation.validate_exp = false;
		validation.set_issuer(&[&self.config.issuer]);
		validation.set_required_spec_claims(&["exp", "iss", "sub"]);

		let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
		let candidates = std::iter::once(&keys.current).chain(keys.previous.iter());

		let mut last_err = AuthError::InvalidSignature;
		for secret in candidates {
			match decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation) {
				Ok(data) => return Ok(data.claims),
				Err(e) => {
					last_err = match e.kind() {
						ErrorKind::ExpiredSignature => AuthError::Expired,
						_ => AuthError::InvalidSignature,
					};
					// Only a signature mismatch is worth retrying with the previous key.
					if !matches!(e.kind(), ErrorKind::InvalidSignature) {
						break;
					}
				}
			}
		}

		debug!("Credential failed verification: {}", last_err);
		Err(last_err)
	}
}

/// Derive the stable user identity for a device.
///
/// SHA-256 of the device id, truncated to 16 bytes and base64url encoded, so
/// the same device always binds to the same user without a lookup table.
pub fn derive_user_id(device_id: &str) -> String {
	let digest = Sha256::digest(device_id.as_bytes());
	base64::engine::general_purpose::URL_SAFE.encode(&digest[..USER_ID_DIGEST_LEN])
}

/// Check that a device public key is a PEM `PUBLIC KEY` block or bare
/// base64/base64url of a plausible key length. Returns the decoded key bytes.
pub fn validate_public_key(public_key: &str) -> Result<Vec<u8>, AuthError> {
	use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};

	let trimmed = public_key.trim();
	if trimmed.is_empty() {
		return Err(AuthError::InvalidCredentials("public_key is empty".to_string()));
	}

	let body: String = if trimmed.starts_with(PEM_BEGIN) {
		trimmed
			.strip_prefix(PEM_BEGIN)
			.and_then(|rest| rest.strip_suffix(PEM_END))
			.ok_or_else(|| AuthError::InvalidCredentials("public_key PEM block is not terminated".to_string()))?
			.split_whitespace()
			.collect()
	} else {
		trimmed.to_string()
	};

	let decoded = STANDARD
		.decode(&body)
		.or_else(|_| STANDARD_NO_PAD.decode(&body))
		.or_else(|_| URL_SAFE.decode(&body))
		.or_else(|_| URL_SAFE_NO_PAD.decode(&body))
		.map_err(|_| AuthError::InvalidCredentials("public_key is not valid base64".to_string()))?;

	if !(MIN_PUBLIC_KEY_LEN..=MAX_PUBLIC_KEY_LEN).contains(&decoded.len()) {
		return Err(AuthError::InvalidCredentials(format!(
			"public_key length {} outside {}..={} bytes",
			decoded.len(),
			MIN_PUBLIC_KEY_LEN,
			MAX_PUBLIC_KEY_LEN
		)));
	}

	Ok(decoded)
}
