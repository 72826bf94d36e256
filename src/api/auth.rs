// =============================================================================
// Bearer token authentication — Axum extractor (§6)
// =============================================================================
//
// Validates `Authorization: Bearer <token>` against `Services.settings.admin_token`.
// Comparison is constant-time so a partial match never leaks timing
// information about how much of the token an attacker guessed correctly.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::app_state::Services;

/// Compare two byte slices in constant time. Always walks the full length of
/// both slices even after a mismatch is found.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Validates the bearer token; yields the raw token string on success.
pub struct AuthBearer(pub String);

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

impl FromRequestParts<Arc<Services>> for AuthBearer {
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<Services>) -> Result<Self, Self::Rejection> {
        let Some(expected) = &state.settings.admin_token else {
            warn!("AUTOTRADE_ADMIN_TOKEN is not set — all authenticated requests are rejected");
            return Err(AuthRejection { status: StatusCode::FORBIDDEN, message: "server authentication not configured" });
        };

        let token = match parts.headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                warn!("missing or malformed Authorization header");
                return Err(AuthRejection { status: StatusCode::FORBIDDEN, message: "missing or invalid authorization token" });
            }
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("invalid admin token presented");
            return Err(AuthRejection { status: StatusCode::FORBIDDEN, message: "invalid authorization token" });
        }

        Ok(AuthBearer(token.to_string()))
    }
}

/// Constant-time check of the `x-cron-token` header against
/// `Services.cron_trigger_token`, for `POST /scheduler/cron-trigger`.
pub fn cron_token_valid(services: &Services, presented: &str) -> bool {
    match &services.cron_trigger_token {
        Some(expected) => constant_time_eq(presented.as_bytes(), expected.as_bytes()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"hello", b"world"));
    }

    #[test]
    fn constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer_string"));
    }

    #[test]
    fn constant_time_eq_empty() {
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn constant_time_eq_single_bit_diff() {
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }
}
