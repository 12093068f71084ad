//! JSON API under `/api/v1`.
//!
//! Every route except `/health`, login and the password reset pair needs a
//! bearer token from `POST /api/v1/auth/login`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::FromRequestParts,
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use fabtrack_common::{Role, User};
use tracing::error;

use super::auth;
use super::db::DbHandle;
use crate::config::TrackerSection;
use crate::errors::TrackerError;

mod catalog;
mod jobs;
mod process;
mod session;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub tracker: TrackerSection,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unauthorized(String),
    Forbidden(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(workflow) = TrackerError::find_workflow(&err) {
            return ApiError::BadRequest(workflow.to_string());
        }
        match TrackerError::find(&err) {
            Some(e @ TrackerError::NotFound { .. }) => ApiError::NotFound(e.to_string()),
            Some(e @ (TrackerError::Validation(_) | TrackerError::PasswordReset(_))) => {
                ApiError::BadRequest(e.to_string())
            }
            Some(e @ (TrackerError::AlreadyExists { .. } | TrackerError::InUse { .. })) => {
                ApiError::Conflict(e.to_string())
            }
            Some(e @ TrackerError::Unauthorized) => ApiError::Unauthorized(e.to_string()),
            Some(e @ TrackerError::Forbidden(_)) => ApiError::Forbidden(e.to_string()),
            _ => {
                error!("request failed: {:#}", err);
                ApiError::Internal(err.to_string())
            }
        }
    }
}

/// 200 with the entity, or 404.
fn found<T>(entity: Option<T>, kind: &str, id: impl std::fmt::Display) -> Result<Json<T>, ApiError> {
    entity
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("{} {} not found", kind, id)))
}

/// 204 when a row was deleted, or 404.
fn deleted(done: bool, kind: &str, id: impl std::fmt::Display) -> Result<StatusCode, ApiError> {
    if done {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("{} {} not found", kind, id)))
    }
}

// ── Authentication ────────────────────────────────────────────────────

/// The user behind the request's bearer token.
pub struct CurrentUser {
    pub user: User,
    pub token: String,
}

impl CurrentUser {
    /// Admins pass every role check.
    pub fn require_any(&self, roles: &[Role]) -> Result<(), ApiError> {
        if self.user.has_role(Role::Admin) || self.user.has_any_role(roles) {
            return Ok(());
        }
        let names: Vec<&str> = roles.iter().map(|r| r.as_str()).collect();
        Err(ApiError::Forbidden(format!(
            "Requires one of the roles: admin, {}",
            names.join(", ")
        )))
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        self.require_any(&[])
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

impl FromRequestParts<SharedState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".into()))?;
        let lookup = token.clone();
        let user = state
            .db
            .call(move |db| auth::authenticate(db, &lookup, Utc::now()))
            .await?;
        Ok(CurrentUser { user, token })
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/v1/auth/login", post(session::login))
        .route("/api/v1/auth/logout", post(session::logout))
        .route("/api/v1/auth/me", get(session::me))
        .route("/api/v1/auth/password-reset", post(session::request_reset))
        .route(
            "/api/v1/auth/password-reset/confirm",
            post(session::confirm_reset),
        )
        .merge(catalog::routes())
        .merge(process::routes())
        .merge(jobs::routes())
        .route("/health", get(health_check))
}

async fn health_check() -> &'static str {
    "ok"
}
