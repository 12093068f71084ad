use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{ApiError, CurrentUser, SharedState};
use crate::shopfloor::auth;
use fabtrack_common::User;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

#[derive(Deserialize)]
pub struct ResetRequest {
    pub email: String,
}

#[derive(Deserialize)]
pub struct ResetConfirmRequest {
    pub token: String,
    pub password: String,
    pub password_repeat: String,
}

pub async fn login(
    State(state): State<SharedState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ttl = state.tracker.session_ttl_minutes;
    let (token, user) = state
        .db
        .call(move |db| auth::login(db, &req.username, &req.password, ttl, Utc::now()))
        .await?;
    Ok(Json(LoginResponse { token, user }))
}

pub async fn logout(
    State(state): State<SharedState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let token = current.token;
    state.db.call(move |db| auth::logout(db, &token)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn me(current: CurrentUser) -> Json<User> {
    Json(current.user)
}

/// No mail is sent, so the token comes back in the response. Unknown
/// addresses get a `null` token.
pub async fn request_reset(
    State(state): State<SharedState>,
    Json(req): Json<ResetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ttl = state.tracker.reset_token_minutes;
    let token = state
        .db
        .call(move |db| auth::request_password_reset(db, &req.email, ttl, Utc::now()))
        .await?;
    Ok(Json(serde_json::json!({ "token": token })))
}

pub async fn confirm_reset(
    State(state): State<SharedState>,
    Json(req): Json<ResetConfirmRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .call(move |db| {
            auth::confirm_password_reset(
                db,
                &req.token,
                &req.password,
                &req.password_repeat,
                Utc::now(),
            )
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
