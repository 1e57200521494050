//! The sync service façade: authenticates every call, then drives the token
//! issuer, integrity verifier, manifest store, conflict engine and status
//! aggregator. Transport adapters sit on top of this and add no logic.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use url::Url;

use crate::auth::{AuthError, Claims, IssuedTokens, TokenIssuer, TokenKind};
use crate::config::Settings;
use crate::conflict::{AppliedDiff, ConflictEngine, ConflictRecord, DiffRejection, ProfileDiff, ServerDiff};
use crate::integrity::{self, IntegrityError};
use crate::manifest::{Device, ManifestEnvelope, ManifestStore, MemoryStore, StoreError, epoch};
use crate::observability::MetricsRegistry;
use crate::status::{ErrorLog, HealthProbe, Snapshot, StaticHealth, StatusAggregator};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
	#[error(transparent)]
	Auth(#[from] AuthError),
	#[error("device mismatch: credential is bound to '{bound}' but the request names '{requested}'")]
	DeviceMismatch { bound: String, requested: String },
	#[error("payload integrity check failed: {0}")]
	Integrity(#[from] IntegrityError),
	#[error(transparent)]
	Storage(#[from] StoreError),
	#[error("bad request: {0}")]
	BadRequest(String),
}

impl SyncError {
	/// Stable machine-readable code.
	pub fn code(&self) -> &'static str {
		match self {
			Self::Auth(AuthError::InvalidCredentials(_)) => "invalid_credentials",
			Self::Auth(AuthError::Expired) => "expired",
			Self::Auth(AuthError::InvalidSignature) => "invalid_signature",
			Self::Auth(AuthError::Signing(_)) => "internal_error",
			Self::DeviceMismatch { .. } => "device_mismatch",
			Self::Integrity(IntegrityError::MissingDigest) => "missing_digest",
			Self::Integrity(IntegrityError::MalformedDigest(_)) => "malformed_digest",
			Self::Storage(StoreError::CapacityExceeded { .. }) => "storage_capacity_exceeded",
			Self::Storage(StoreError::Backend(_)) => "storage_error",
			Self::BadRequest(_) => "bad_request",
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
	pub device_id: String,
	pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
	pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
	pub success: bool,
	pub device_id: String,
	pub user_id: String,
	pub access_token: String,
	pub refresh_token: String,
	pub expires_in: u64,
	pub sync_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
	pub success: bool,
	pub message: String,
	pub server_timestamp: DateTime<Utc>,
	/// Manifests replace whole snapshots, so this is always zero.
	pub conflict_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadQuery {
	pub since: Option<DateTime<Utc>>,
	pub page_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResponse {
	pub success: bool,
	pub manifests: Vec<ManifestEnvelope>,
	pub server_timestamp: DateTime<Utc>,
	pub has_more: bool,
	pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncProfilesRequest {
	#[serde(default)]
	pub diffs: Vec<ProfileDiff>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProfilesResponse {
	pub success: bool,
	pub server_diffs: Vec<ServerDiff>,
	pub conflicts: Vec<ConflictRecord>,
	pub applied: Vec<AppliedDiff>,
	pub rejected: Vec<DiffRejection>,
	pub sync_point: u64,
	pub new_sync_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
	pub success: bool,
	#[serde(flatten)]
	pub snapshot: Snapshot,
}

/// Coarse operational counters for the monitoring surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
	pub active_devices: usize,
	pub total_syncs: u64,
	pub storage_usage: u64,
}

fn encode_page_token(offset: usize) -> String {
	URL_SAFE_NO_PAD.encode(offset.to_string())
}

fn decode_page_token(token: &str) -> Result<usize, SyncError> {
	let invalid = || SyncError::BadRequest("invalid page token".to_string());
	let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
	let text = String::from_utf8(bytes).map_err(|_| invalid())?;
	text.parse().map_err(|_| invalid())
}

pub struct SyncService {
	issuer: Arc<TokenIssuer>,
	store: Arc<dyn ManifestStore>,
	engine: Arc<ConflictEngine>,
	status: StatusAggregator,
	errors: Arc<ErrorLog>,
	metrics: Arc<MetricsRegistry>,
	sync_endpoint: Url,
	page_size: usize,
}

impl SyncService {
	pub fn new(
		settings: &Settings,
		issuer: Arc<TokenIssuer>,
		store: Arc<dyn ManifestStore>,
		engine: Arc<ConflictEngine>,
		health: Arc<dyn HealthProbe>,
		metrics: Arc<MetricsRegistry>,
	) -> Self {
		let errors = Arc::new(ErrorLog::default());
		let status = StatusAggregator::new(
			Arc::clone(&store),
			Arc::clone(&engine),
			health,
			Arc::clone(&errors),
			settings.storage_limit_bytes,
		);
		Self {
			issuer,
			store,
			engine,
			status,
			errors,
			metrics,
			sync_endpoint: settings.sync_endpoint.clone(),
			page_size: settings.download_page_size.max(1),
		}
	}

	/// Wire up the in-memory backends described by `settings`.
	pub fn from_settings(settings: &Settings, metrics: Arc<MetricsRegistry>) -> anyhow::Result<Self> {
		let issuer = Arc::new(TokenIssuer::from_settings(settings)?);
		let store: Arc<dyn ManifestStore> = Arc::new(
			MemoryStore::new(settings.manifest_retention).with_max_envelope_bytes(settings.storage_limit_bytes),
		);
		let engine = Arc::new(ConflictEngine::from_settings(settings));
		info!(
			"Sync service ready: retention {} per device, {} profile field(s), conflict policy {}",
			settings.manifest_retention,
			settings.profile_fields.len(),
			engine.policy().as_str()
		);
		Ok(Self::new(
			settings,
			issuer,
			store,
			engine,
			Arc::new(StaticHealth::default()),
			metrics,
		))
	}

	pub fn issuer(&self) -> &Arc<TokenIssuer> {
		&self.issuer
	}

	pub fn store(&self) -> &Arc<dyn ManifestStore> {
		&self.store
	}

	pub fn engine(&self) -> &Arc<ConflictEngine> {
		&self.engine
	}

	fn auth_response(&self, tokens: IssuedTokens) -> AuthResponse {
		AuthResponse {
			success: true,
			device_id: tokens.device_id,
			user_id: tokens.user_id,
			access_token: tokens.access_token,
			refresh_token: tokens.refresh_token,
			expires_in: tokens.expires_in,
			sync_endpoint: self.sync_endpoint.to_string(),
		}
	}

	/// Validate the access credential presented with a call.
	pub fn authorize(&self, access_token: &str) -> Result<Claims, SyncError> {
		self.issuer
			.validate_at(access_token, TokenKind::Access, Utc::now())
			.map_err(|e| {
				self.metrics.auth_failures_total.inc();
				debug!("Rejected access credential: {}", e);
				SyncError::from(e)
			})
	}

	/// Count and remember a failure of an authenticated call.
	async fn fail(&self, device_id: &str, err: SyncError) -> SyncError {
		warn!("Request from device {} failed: {}", device_id, err);
		self.metrics.sync_errors_total.inc();
		self.errors.record(device_id, err.code(), err.to_string(), Utc::now()).await;
		err
	}

	async fn refresh_gauges(&self) {
		match self.store.device_count().await {
			Ok(n) => self.metrics.active_devices.set(n as i64),
			Err(e) => warn!("Failed to count devices: {}", e),
		}
		match self.store.total_storage_used().await {
			Ok(bytes) => self.metrics.storage_bytes.set(bytes as i64),
			Err(e) => warn!("Failed to measure storage: {}", e),
		}
	}

	pub async fn authenticate(&self, req: AuthRequest) -> Result<AuthResponse, SyncError> {
		self.metrics.auth_requests_total.inc();
		let tokens = match self.issuer.authenticate(&req.device_id, &req.public_key) {
			Ok(tokens) => tokens,
			Err(e) => {
				self.metrics.auth_failures_total.inc();
				warn!("Authentication failed for device '{}': {}", req.device_id, e);
				return Err(e.into());
			}
		};

		let now = Utc::now();
		self.store
			.register_device(Device {
				device_id: tokens.device_id.clone(),
				user_id: tokens.user_id.clone(),
				public_key: req.public_key,
				registered_at: now,
				last_seen: now,
			})
			.await?;
		self.refresh_gauges().await;

		info!("Device {} authenticated as user {}", tokens.device_id, tokens.user_id);
		Ok(self.auth_response(tokens))
	}

	pub async fn refresh(&self, req: RefreshRequest) -> Result<AuthResponse, SyncError> {
		let tokens = self.issuer.refresh(&req.refresh_token).map_err(|e| {
			self.metrics.auth_failures_total.inc();
			debug!("Refresh rejected: {}", e);
			SyncError::from(e)
		})?;
		self.metrics.token_refreshes_total.inc();
		info!("Credentials refreshed for device {}", tokens.device_id);
		Ok(self.auth_response(tokens))
	}

	/// Store one manifest for the authenticated device.
	///
	/// The device binding and the digest are checked before the store is
	/// touched, so a rejected upload leaves it unchanged.
	pub async fn upload_manifest(
		&self,
		access_token: &str,
		envelope: ManifestEnvelope,
	) -> Result<UploadResponse, SyncError> {
		let claims = self.authorize(access_token)?;
		let device_id = claims.device_id.as_str();
		info!("Upload manifest for device: {}", device_id);

		if envelope.device_id != device_id {
			self.metrics.manifest_upload_rejections_total.inc();
			let err = SyncError::DeviceMismatch {
				bound: device_id.to_string(),
				requested: envelope.device_id,
			};
			return Err(self.fail(device_id, err).await);
		}

		if let Err(e) = integrity::verify(&envelope) {
			self.metrics.manifest_upload_rejections_total.inc();
			return Err(self.fail(device_id, e.into()).await);
		}

		let size = envelope.payload_len();
		if let Err(e) = self.store.store_manifest(device_id, envelope).await {
			return Err(self.fail(device_id, e.into()).await);
		}

		self.metrics.manifest_uploads_total.inc();
		self.metrics.manifest_bytes_total.inc_by(size);
		self.metrics.sync_operations_total.inc();
		self.refresh_gauges().await;

		Ok(UploadResponse {
			success: true,
			message: "Manifest uploaded successfully".to_string(),
			server_timestamp: Utc::now(),
			conflict_count: 0,
		})
	}

	/// One page of the device's manifests created after `since`.
	pub async fn download_manifests(
		&self,
		access_token: &str,
		query: DownloadQuery,
	) -> Result<DownloadResponse, SyncError> {
		let claims = self.authorize(access_token)?;
		let device_id = claims.device_id.as_str();
		info!("Download manifests for device: {}", device_id);

		let offset = match query.page_token.as_deref() {
			Some(token) => match decode_page_token(token) {
				Ok(offset) => offset,
				Err(e) => return Err(self.fail(device_id, e).await),
			},
			None => 0,
		};

		let since = query.since.unwrap_or_else(epoch);
		let window = match self.store.get_manifests(device_id, since).await {
			Ok(window) => window,
			Err(e) => return Err(self.fail(device_id, e.into()).await),
		};

		let end = offset.saturating_add(self.page_size).min(window.len());
		let manifests = window.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
		let has_more = end < window.len();

		self.metrics.manifest_downloads_total.inc();
		self.metrics.sync_operations_total.inc();

		Ok(DownloadResponse {
			success: true,
			manifests,
			server_timestamp: Utc::now(),
			has_more,
			next_page_token: has_more.then(|| encode_page_token(end)),
		})
	}

	/// Merge the device's diffs into its user's profile.
	///
	/// Per-diff problems are returned in the response, never as an error.
	pub async fn sync_profiles(
		&self,
		access_token: &str,
		req: SyncProfilesRequest,
	) -> Result<SyncProfilesResponse, SyncError> {
		let claims = self.authorize(access_token)?;
		info!("Sync profiles for device: {} with {} diffs", claims.device_id, req.diffs.len());

		if let Some(foreign) = req
			.diffs
			.iter()
			.find(|d| !d.device_id.is_empty() && d.device_id != claims.device_id)
		{
			let err = SyncError::DeviceMismatch {
				bound: claims.device_id.clone(),
				requested: foreign.device_id.clone(),
			};
			return Err(self.fail(&claims.device_id, err).await);
		}

		let started = Instant::now();
		let outcome = self.engine.sync(&claims.user_id, &claims.device_id, req.diffs).await;
		self.metrics
			.profile_sync_duration_seconds
			.observe(started.elapsed().as_secs_f64());

		self.metrics.profile_syncs_total.inc();
		self.metrics.sync_operations_total.inc();
		self.metrics.diffs_applied_total.inc_by(outcome.applied.len() as u64);
		self.metrics.conflicts_total.inc_by(outcome.resolved as u64);
		self.metrics.diff_rejections_total.inc_by(outcome.rejected.len() as u64);

		let now = Utc::now();
		for rejection in &outcome.rejected {
			self.errors
				.record(&claims.device_id, &rejection.code, rejection.message.clone(), now)
				.await;
		}

		Ok(SyncProfilesResponse {
			success: true,
			server_diffs: outcome.server_diffs,
			conflicts: outcome.conflicts,
			applied: outcome.applied,
			rejected: outcome.rejected,
			sync_point: outcome.sync_point,
			new_sync_timestamp: outcome.synced_at,
		})
	}

	pub async fn get_sync_status(&self, access_token: &str) -> Result<StatusResponse, SyncError> {
		let claims = self.authorize(access_token)?;
		debug!("Get sync status for device: {}", claims.device_id);
		let snapshot = self.status.get_status(&claims.user_id, &claims.device_id).await?;
		Ok(StatusResponse {
			success: true,
			snapshot,
		})
	}

	pub async fn stats(&self) -> Result<ServiceStats, SyncError> {
		Ok(ServiceStats {
			active_devices: self.store.device_count().await?,
			total_syncs: self.metrics.sync_operations_total.get(),
			storage_usage: self.store.total_storage_used().await?,
		})
	}
}
