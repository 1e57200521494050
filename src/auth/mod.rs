//! Device authentication: stable user identity derivation and stateless
//! access/refresh credentials signed with a process-wide secret.

pub mod secret;
pub mod token;

use thiserror::Error;

pub use secret::{SecretError, SigningSecret};
pub use token::{
	Claims, IssuedTokens, TokenConfig, TokenIssuer, TokenKind, derive_user_id, validate_public_key,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
	/// Empty or malformed device credentials, or a credential of the wrong kind.
	#[error("invalid device credentials: {0}")]
	InvalidCredentials(String),
	#[error("credential has expired")]
	Expired,
	#[error("credential signature is invalid")]
	InvalidSignature,
	#[error("failed to sign credential: {0}")]
	Signing(String),
}
