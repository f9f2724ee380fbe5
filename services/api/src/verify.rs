//! Email verification endpoints driving the OTP dispatcher.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, instrument, warn};

use crate::api::{AppState, ErrorBody};
use crate::users::is_valid_email;

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub email: Option<String>,
}

/// The generated code rides along in the 201 body only while
/// `otp.expose_in_response` is on.
#[derive(Debug, Serialize)]
struct VerifyResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    otp: Option<String>,
}

/// Verification routes, mounted under the service root.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/user/verify/signup", post(signup_email_verify))
        .route("/v1/user/verify/profile", post(profile_email_verify))
}

/// Pre-signup verification: the address must not belong to an account yet.
#[instrument(skip(state, request))]
async fn signup_email_verify(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> Result<(StatusCode, Json<VerifyResponse>), (StatusCode, Json<ErrorBody>)> {
    let email = request.email.unwrap_or_default();
    if !is_valid_email(&email) {
        return Err((
            StatusCode::CONFLICT,
            Json(ErrorBody::new("Invalid email format")),
        ));
    }

    let existing = state.users.find_by_email(&email).await.map_err(|e| {
        error!(error = %e, "Verification lookup failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody::new("Internal Server Error")),
        )
    })?;
    if existing.is_some() {
        warn!(email = %email, "Verification requested for registered email");
        return Err((
            StatusCode::CONFLICT,
            Json(ErrorBody::new("Email already registered")),
        ));
    }

    dispatch(&state, email).await
}

/// Profile-change verification: the address must belong to an active account.
#[instrument(skip(state, request))]
async fn profile_email_verify(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> Result<(StatusCode, Json<VerifyResponse>), (StatusCode, Json<ErrorBody>)> {
    let email = request.email.unwrap_or_default();
    if !is_valid_email(&email) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new("Invalid email format")),
        ));
    }

    let user = state
        .users
        .find_by_email(&email)
        .await
        .map_err(|e| {
            error!(error = %e, "Verification lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::new("Internal Server Error")),
            )
        })?
        .ok_or_else(|| {
            (
                StatusCode::CONFLICT,
                Json(ErrorBody::new("Email not found")),
            )
        })?;

    if !user.active {
        return Err((
            StatusCode::FORBIDDEN,
            Json(ErrorBody::new("Your account is inactive or blocked")),
        ));
    }

    dispatch(&state, email).await
}

async fn dispatch(
    state: &AppState,
    email: String,
) -> Result<(StatusCode, Json<VerifyResponse>), (StatusCode, Json<ErrorBody>)> {
    let delivery = state.otp.submit(email).await.map_err(|e| {
        error!(error = %e, "OTP dispatch failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody::new(format!("Failed to send OTP: {e}"))),
        )
    })?;

    Ok((
        StatusCode::CREATED,
        Json(VerifyResponse {
            success: true,
            otp: state.expose_otp.then_some(delivery.code),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_omits_otp_when_not_exposed() {
        let hidden = serde_json::to_value(VerifyResponse {
            success: true,
            otp: None,
        })
        .unwrap();
        assert_eq!(hidden.as_object().unwrap().len(), 1);
        assert_eq!(hidden["success"], true);

        let shown = serde_json::to_value(VerifyResponse {
            success: true,
            otp: Some("123456".to_string()),
        })
        .unwrap();
        assert_eq!(shown["otp"], "123456");
    }
}
