use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequestParts, Query, State};
use axum::http::header;
use axum::http::request::Parts;

use crate::auth::AuthError;
use crate::manifest::ManifestEnvelope;
use crate::service::{
	AuthRequest, AuthResponse, DownloadQuery, DownloadResponse, RefreshRequest, StatusResponse, SyncError,
	SyncProfilesRequest, SyncProfilesResponse, UploadResponse,
};
use crate::state::AppState;

/// The access credential from `Authorization: Bearer <token>`.
pub struct BearerToken(pub String);

impl<S: Send + Sync> FromRequestParts<S> for BearerToken {
	type Rejection = SyncError;

	async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
		let value = parts
			.headers
			.get(header::AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.ok_or_else(|| AuthError::InvalidCredentials("missing Authorization header".to_string()))?;

		let token = value
			.strip_prefix("Bearer ")
			.or_else(|| value.strip_prefix("bearer "))
			.map(str::trim)
			.filter(|t| !t.is_empty())
			.ok_or_else(|| AuthError::InvalidCredentials("expected a bearer credential".to_string()))?;

		Ok(Self(token.to_string()))
	}
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, SyncError> {
	payload
		.map(|Json(v)| v)
		.map_err(|e| SyncError::BadRequest(e.body_text()))
}

pub async fn authenticate(
	State(state): State<AppState>,
	payload: Result<Json<AuthRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, SyncError> {
	let req = body(payload)?;
	state.service.authenticate(req).await.map(Json)
}

pub async fn refresh(
	State(state): State<AppState>,
	payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, SyncError> {
	let req = body(payload)?;
	state.service.refresh(req).await.map(Json)
}

pub async fn upload_manifest(
	State(state): State<AppState>,
	BearerToken(token): BearerToken,
	payload: Result<Json<ManifestEnvelope>, JsonRejection>,
) -> Result<Json<UploadResponse>, SyncError> {
	let envelope = body(payload)?;
	state.service.upload_manifest(&token, envelope).await.map(Json)
}

pub async fn download_manifests(
	State(state): State<AppState>,
	BearerToken(token): BearerToken,
	query: Result<Query<DownloadQuery>, QueryRejection>,
) -> Result<Json<DownloadResponse>, SyncError> {
	let Query(query) = query.map_err(|e| SyncError::BadRequest(e.body_text()))?;
	state.service.download_manifests(&token, query).await.map(Json)
}

pub async fn sync_profiles(
	State(state): State<AppState>,
	BearerToken(token): BearerToken,
	payload: Result<Json<SyncProfilesRequest>, JsonRejection>,
) -> Result<Json<SyncProfilesResponse>, SyncError> {
	let req = body(payload)?;
	state.service.sync_profiles(&token, req).await.map(Json)
}

pub async fn sync_status(
	State(state): State<AppState>,
	BearerToken(token): BearerToken,
) -> Result<Json<StatusResponse>, SyncError> {
	state.service.get_sync_status(&token).await.map(Json)
}
