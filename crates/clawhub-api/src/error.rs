use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::CONFLICT, message: msg.into() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::NOT_FOUND, message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::INTERNAL_SERVER_ERROR, message: msg.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<clawhub_reconciler::ReconcileError> for ApiError {
    fn from(e: clawhub_reconciler::ReconcileError) -> Self {
        use clawhub_reconciler::ReconcileError::*;
        match e {
            InstanceNotFound(_) => ApiError::not_found(e.to_string()),
            InvalidManifest(_) | Config(_) => ApiError::bad_request(e.to_string()),
            ResourceUpdateUnsupported(_) => ApiError::conflict(e.to_string()),
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<clawhub_store::StoreError> for ApiError {
    fn from(e: clawhub_store::StoreError) -> Self {
        ApiError::internal(e.to_string())
    }
}
