//! Common test utilities and helpers for integration tests.
#![allow(dead_code)]

use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use vanopticon_bifrost::auth::SigningSecret;
use vanopticon_bifrost::config::Settings;
use vanopticon_bifrost::conflict::ConflictPolicy;
use vanopticon_bifrost::manifest::ManifestEnvelope;
use vanopticon_bifrost::observability::MetricsRegistry;
use vanopticon_bifrost::service::{AuthRequest, AuthResponse, SyncService};

/// A well-formed device public key (32 bytes, standard base64).
pub fn public_key() -> String {
	base64::engine::general_purpose::STANDARD.encode([7u8; 32])
}

pub fn ts(secs: i64) -> DateTime<Utc> {
	Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Settings with a fixed signing secret and the given profile fields.
pub fn settings(fields: &[&str], policy: ConflictPolicy) -> Settings {
	Settings {
		host: "127.0.0.1".to_string(),
		token_secret: Some(SigningSecret::generate().unwrap().to_base64()),
		profile_fields: fields.iter().map(|f| f.to_string()).collect(),
		conflict_policy: policy,
		..Settings::default()
	}
}

pub fn metrics() -> Arc<MetricsRegistry> {
	Arc::new(MetricsRegistry::new().unwrap())
}

pub fn service(settings: &Settings) -> SyncService {
	SyncService::from_settings(settings, metrics()).unwrap()
}

pub async fn login(service: &SyncService, device_id: &str) -> AuthResponse {
	service
		.authenticate(AuthRequest {
			device_id: device_id.to_string(),
			public_key: public_key(),
		})
		.await
		.unwrap()
}

pub fn envelope(device_id: &str, n: usize, created_at: DateTime<Utc>) -> ManifestEnvelope {
	ManifestEnvelope::new(device_id, format!("ciphertext-{}", n).into_bytes(), format!("hash{}", n), created_at)
}
