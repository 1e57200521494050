use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::auth::AuthError;
use crate::manifest::StoreError;
use crate::service::SyncError;

/// Body of every failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
	pub success: bool,
	pub code: String,
	pub message: String,
}

impl SyncError {
	pub fn status_code(&self) -> StatusCode {
		match self {
			Self::Auth(AuthError::Signing(_)) => StatusCode::INTERNAL_SERVER_ERROR,
			Self::Auth(_) => StatusCode::UNAUTHORIZED,
			Self::DeviceMismatch { .. } => StatusCode::FORBIDDEN,
			Self::Integrity(_) => StatusCode::UNPROCESSABLE_ENTITY,
			Self::Storage(StoreError::CapacityExceeded { .. }) => StatusCode::INSUFFICIENT_STORAGE,
			Self::Storage(StoreError::Backend(_)) => StatusCode::INTERNAL_SERVER_ERROR,
			Self::BadRequest(_) => StatusCode::BAD_REQUEST,
		}
	}
}

impl IntoResponse for SyncError {
	fn into_response(self) -> Response {
		let status = self.status_code();
		let body = ErrorBody {
			success: false,
			code: self.code().to_string(),
			message: self.to_string(),
		};
		(status, Json(body)).into_response()
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::integrity::IntegrityError;

	#[test]
	fn test_status_mapping() {
		assert_eq!(SyncError::from(AuthError::Expired).status_code(), StatusCode::UNAUTHORIZED);
		assert_eq!(
			SyncError::from(IntegrityError::MissingDigest).status_code(),
			StatusCode::UNPROCESSABLE_ENTITY
		);
		assert_eq!(
			SyncError::from(StoreError::CapacityExceeded {
				device_id: "a".into(),
				size: 2,
				limit: 1
			})
			.status_code(),
			StatusCode::INSUFFICIENT_STORAGE
		);
		assert_eq!(SyncError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
	}
}
