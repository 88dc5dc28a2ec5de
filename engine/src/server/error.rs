//! Mapping of engine errors onto HTTP responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::errors::ShipyardError;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Error returned by API handlers
#[derive(Debug)]
pub struct ApiError(pub ShipyardError);

impl From<ShipyardError> for ApiError {
    fn from(err: ShipyardError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ShipyardError::NotFound(_) => StatusCode::NOT_FOUND,
            ShipyardError::ValidationError(_)
            | ShipyardError::ConfigError(_)
            | ShipyardError::JsonError(_) => StatusCode::BAD_REQUEST,
            ShipyardError::SignatureError(_) => StatusCode::UNAUTHORIZED,
            ShipyardError::Conflict(_)
            | ShipyardError::TransitionError(_)
            | ShipyardError::LeaseError(_)
            | ShipyardError::ActivationError(_) => StatusCode::CONFLICT,
            ShipyardError::StorageError(_) | ShipyardError::HttpError(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            // infrastructure details stay in the engine log
            error!("Request failed: {}", self.0);
            "internal failure, see engine logs".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}
