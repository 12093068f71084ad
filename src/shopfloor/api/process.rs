//! Process definitions: states, state machines, process steps and chains.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiError, CurrentUser, SharedState, deleted, found};
use crate::shopfloor::db::{NewProcessChain, NewProcessStep, NewStateMachine};
use crate::shopfloor::validate;

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/v1/states", get(list_states).post(create_state))
        .route(
            "/api/v1/states/{id}",
            get(get_state).put(update_state).delete(delete_state),
        )
        .route(
            "/api/v1/state-machines",
            get(list_state_machines).post(create_state_machine),
        )
        .route(
            "/api/v1/state-machines/{id}",
            get(get_state_machine)
                .put(update_state_machine)
                .delete(delete_state_machine),
        )
        .route(
            "/api/v1/process-steps",
            get(list_process_steps).post(create_process_step),
        )
        .route(
            "/api/v1/process-steps/{id}",
            get(get_process_step)
                .put(update_process_step)
                .delete(delete_process_step),
        )
        .route(
            "/api/v1/process-chains",
            get(list_process_chains).post(create_process_chain),
        )
        .route(
            "/api/v1/process-chains/{id}",
            get(get_process_chain)
                .put(update_process_chain)
                .delete(delete_process_chain),
        )
}

#[derive(Deserialize)]
pub struct StateRequest {
    pub name: String,
    #[serde(default)]
    pub blocking: bool,
}

// ── States ────────────────────────────────────────────────────────────

async fn list_states(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(|db| db.list_states()).await?))
}

async fn get_state(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    found(state.db.call(move |db| db.get_state(id)).await?, "State", id)
}

async fn create_state(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Json(req): Json<StateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let created = state
        .db
        .call(move |db| {
            validate::validate_state(db, &req.name)?;
            db.create_state(&req.name, req.blocking)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_state(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<StateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = state
        .db
        .call(move |db| {
            validate::validate_state(db, &req.name)?;
            db.update_state(id, &req.name, req.blocking)
        })
        .await?;
    Ok(Json(updated))
}

async fn delete_state(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    deleted(state.db.call(move |db| db.delete_state(id)).await?, "State", id)
}

// ── State machines ────────────────────────────────────────────────────

async fn list_state_machines(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(|db| db.list_state_machines()).await?))
}

async fn get_state_machine(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    found(
        state.db.call(move |db| db.get_state_machine(id)).await?,
        "State machine",
        id,
    )
}

async fn create_state_machine(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Json(req): Json<NewStateMachine>,
) -> Result<impl IntoResponse, ApiError> {
    let machine = state
        .db
        .call(move |db| {
            validate::validate_state_machine(db, &req)?;
            db.create_state_machine(&req)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(machine)))
}

async fn update_state_machine(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<NewStateMachine>,
) -> Result<impl IntoResponse, ApiError> {
    let machine = state
        .db
        .call(move |db| {
            validate::validate_state_machine(db, &req)?;
            db.update_state_machine(id, &req)
        })
        .await?;
    Ok(Json(machine))
}

async fn delete_state_machine(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    deleted(
        state.db.call(move |db| db.delete_state_machine(id)).await?,
        "State machine",
        id,
    )
}

// ── Process steps ─────────────────────────────────────────────────────

async fn list_process_steps(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(|db| db.list_process_steps()).await?))
}

async fn get_process_step(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    found(
        state.db.call(move |db| db.get_process_step(id)).await?,
        "Process step",
        id,
    )
}

async fn create_process_step(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Json(req): Json<NewProcessStep>,
) -> Result<impl IntoResponse, ApiError> {
    let step = state
        .db
        .call(move |db| {
            validate::validate_process_step(db, &req)?;
            db.create_process_step(&req)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(step)))
}

async fn update_process_step(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<NewProcessStep>,
) -> Result<impl IntoResponse, ApiError> {
    let step = state
        .db
        .call(move |db| {
            validate::validate_process_step(db, &req)?;
            db.update_process_step(id, &req)
        })
        .await?;
    Ok(Json(step))
}

async fn delete_process_step(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    deleted(
        state.db.call(move |db| db.delete_process_step(id)).await?,
        "Process step",
        id,
    )
}

// ── Process chains ────────────────────────────────────────────────────

async fn list_process_chains(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(|db| db.list_process_chains()).await?))
}

async fn get_process_chain(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    found(
        state.db.call(move |db| db.get_process_chain(id)).await?,
        "Process chain",
        id,
    )
}

async fn create_process_chain(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Json(req): Json<NewProcessChain>,
) -> Result<impl IntoResponse, ApiError> {
    let chain = state
        .db
        .call(move |db| {
            validate::validate_process_chain(db, &req)?;
            db.create_process_chain(&req)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(chain)))
}

async fn update_process_chain(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<NewProcessChain>,
) -> Result<impl IntoResponse, ApiError> {
    let chain = state
        .db
        .call(move |db| {
            validate::validate_process_chain(db, &req)?;
            db.update_process_chain(id, &req)
        })
        .await?;
    Ok(Json(chain))
}

async fn delete_process_chain(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    deleted(
        state.db.call(move |db| db.delete_process_chain(id)).await?,
        "Process chain",
        id,
    )
}
