use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::DbErr;

use crate::models::asset::ValidationError;
use crate::models::error::ErrorResponse;
use crate::services::assets::StoreError;
use crate::services::auth::AuthError;

/// Error returned by every API handler
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("bad request body: {0}")]
    Body(#[from] JsonRejection),
    #[error("bad path: {0}")]
    Path(#[from] PathRejection),
    #[error("asset not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(DbErr),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ApiError::NotFound,
            StoreError::Database(e) => ApiError::Database(e),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(AuthError::ServiceUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Body(rejection) => rejection.status(),
            ApiError::Path(rejection) => rejection.status(),
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message sent to the client. Internal details stay in the logs.
    fn client_message(&self) -> String {
        match self {
            ApiError::Auth(AuthError::Expired) => "Token has expired".to_string(),
            ApiError::Auth(AuthError::UntrustedIssuer) => "Invalid token issuer".to_string(),
            ApiError::Auth(AuthError::ServiceUnavailable) => {
                "Authentication service unavailable".to_string()
            }
            ApiError::Auth(AuthError::Malformed(_)) | ApiError::Auth(AuthError::UnknownKey(_)) => {
                "Invalid authentication token".to_string()
            }
            ApiError::Validation(e) => e.to_string(),
            ApiError::Body(rejection) => rejection.body_text(),
            ApiError::Path(rejection) => rejection.body_text(),
            ApiError::NotFound => "Asset not found".to_string(),
            ApiError::Database(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected ({}): {}", status, self);
        }

        let mut response = (
            status,
            Json(ErrorResponse {
                error: self.client_message(),
            }),
        )
            .into_response();

        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }

        response
    }
}
