use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine as _;

use crate::state::AppState;

/// Axum middleware that requires the operator token.
///
/// Accepts `Authorization: Bearer <token>` or `Authorization: Basic
/// base64(user:<token>)` (the latter for tooling that only speaks basic
/// auth). Returns 401 otherwise; no public endpoints.
pub async fn require_auth_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let authorized = match header {
        Some(value) => {
            if let Some(token) = value.strip_prefix("Bearer ") {
                token == state.auth_token.as_str()
            } else if let Some(encoded) = value.strip_prefix("Basic ") {
                base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                    .and_then(|creds| {
                        creds.split_once(':').map(|(_, password)| {
                            password == state.auth_token.as_str()
                        })
                    })
                    .unwrap_or(false)
            } else {
                false
            }
        }
        None => false,
    };

    if authorized {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, "Unauthorized\n").into_response()
    }
}
