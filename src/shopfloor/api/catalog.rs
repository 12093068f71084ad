//! Master data: users, lookup tables, locations, carriers, assemblies,
//! validation patterns and global config.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use fabtrack_common::{GlobalConfig, Role, ValidationPattern};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiError, CurrentUser, SharedState, deleted, found};
use crate::errors::TrackerError;
use crate::shopfloor::auth;
use crate::shopfloor::db::{NewAssembly, NewUser, NewWorkstation, TrackerDb, UserUpdate};
use crate::shopfloor::validate::{self, FieldValidator};
use crate::shopfloor::workflow::OLD_ACTIVE_JOB_KEY;

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/v1/users", get(list_users).post(create_user))
        .route(
            "/api/v1/users/{id}",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route("/api/v1/priorities", get(list_priorities).post(create_priority))
        .route(
            "/api/v1/priorities/{id}",
            get(get_priority).put(update_priority).delete(delete_priority),
        )
        .route(
            "/api/v1/carrier-types",
            get(list_carrier_types).post(create_carrier_type),
        )
        .route(
            "/api/v1/carrier-types/{id}",
            get(get_carrier_type)
                .put(update_carrier_type)
                .delete(delete_carrier_type),
        )
        .route("/api/v1/carriers", get(list_carriers).post(create_carrier))
        .route(
            "/api/v1/carriers/{id}",
            get(get_carrier).put(update_carrier).delete(delete_carrier),
        )
        .route("/api/v1/stocks", get(list_stocks).post(create_stock))
        .route(
            "/api/v1/stocks/{id}",
            get(get_stock).put(update_stock).delete(delete_stock),
        )
        .route("/api/v1/transports", get(list_transports).post(create_transport))
        .route(
            "/api/v1/transports/{id}",
            get(get_transport).put(update_transport).delete(delete_transport),
        )
        .route(
            "/api/v1/workstations",
            get(list_workstations).post(create_workstation),
        )
        .route(
            "/api/v1/workstations/{id}",
            get(get_workstation)
                .put(update_workstation)
                .delete(delete_workstation),
        )
        .route("/api/v1/assemblies", get(list_assemblies).post(create_assembly))
        .route(
            "/api/v1/assemblies/{id}",
            get(get_assembly).put(update_assembly).delete(delete_assembly),
        )
        .route("/api/v1/parameters", get(list_parameters).post(create_parameter))
        .route(
            "/api/v1/parameters/{id}",
            get(get_parameter).put(update_parameter).delete(delete_parameter),
        )
        .route(
            "/api/v1/validation-patterns",
            get(list_patterns).post(create_pattern),
        )
        .route(
            "/api/v1/validation-patterns/{name}",
            get(get_pattern).put(update_pattern).delete(delete_pattern),
        )
        .route("/api/v1/global-config", get(list_config).post(create_config))
        .route(
            "/api/v1/global-config/{key}",
            get(get_config).put(update_config).delete(delete_config),
        )
}

// ── Request payloads ──────────────────────────────────────────────────

fn default_locale() -> String {
    "de".to_string()
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub roles: Vec<Role>,
    #[serde(default = "default_locale")]
    pub locale: String,
}

#[derive(Deserialize)]
pub struct UpdateUserRequest {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub roles: Vec<Role>,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default)]
    pub dark_mode: bool,
    #[serde(default)]
    pub pinned_menu: bool,
    /// Replaces the password when set.
    #[serde(default)]
    pub password: Option<String>,
}

impl UpdateUserRequest {
    fn update(&self) -> UserUpdate {
        UserUpdate {
            username: self.username.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            email: self.email.clone(),
            roles: self.roles.clone(),
            locale: self.locale.clone(),
            dark_mode: self.dark_mode,
            pinned_menu: self.pinned_menu,
        }
    }
}

#[derive(Deserialize)]
pub struct PriorityRequest {
    pub name: String,
    pub value: i32,
}

#[derive(Deserialize)]
pub struct NameRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct CarrierRequest {
    pub carrier_id: String,
    pub carrier_type: Uuid,
    pub location: Uuid,
}

#[derive(Deserialize)]
pub struct StockRequest {
    pub position: String,
}

#[derive(Deserialize)]
pub struct TransportRequest {
    pub position: String,
    pub transporter: Uuid,
}

#[derive(Deserialize)]
pub struct ParameterRequest {
    pub field: String,
}

#[derive(Deserialize)]
pub struct ConfigValueRequest {
    pub value: String,
}

// ── Users ─────────────────────────────────────────────────────────────

async fn list_users(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(|db| db.list_users()).await?))
}

async fn get_user(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    found(state.db.call(move |db| db.get_user(id)).await?, "User", id)
}

async fn create_user(
    State(state): State<SharedState>,
    current: CurrentUser,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    current.require_admin()?;
    let user = state
        .db
        .call(move |db| {
            let fields = UserUpdate {
                username: req.username.clone(),
                first_name: req.first_name.clone(),
                last_name: req.last_name.clone(),
                email: req.email.clone(),
                roles: req.roles.clone(),
                locale: req.locale.clone(),
                dark_mode: false,
                pinned_menu: false,
            };
            validate::validate_user(db, &fields, Some(&req.password))?;
            db.transaction(|db| {
                let user = db.create_user(&NewUser {
                    username: req.username,
                    password_hash: auth::hash_password(&req.password),
                    first_name: req.first_name,
                    last_name: req.last_name,
                    email: req.email,
                    roles: req.roles,
                    locale: req.locale,
                })?;
                db.sync_transport(&user)?;
                Ok(user)
            })
        })
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn update_user(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    current.require_admin()?;
    let user = state
        .db
        .call(move |db| {
            let fields = req.update();
            validate::validate_user(db, &fields, req.password.as_deref())?;
            db.transaction(|db| {
                let user = db.update_user(id, &fields)?;
                if let Some(password) = &req.password {
                    db.set_password_hash(id, &auth::hash_password(password))?;
                }
                db.sync_transport(&user)?;
                Ok(user)
            })
        })
        .await?;
    Ok(Json(user))
}

async fn delete_user(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    current.require_admin()?;
    if current.user.id == id {
        return Err(ApiError::Conflict(
            TrackerError::in_use("user", "users can't delete themselves").to_string(),
        ));
    }
    deleted(state.db.call(move |db| db.delete_user(id)).await?, "User", id)
}

// ── Priorities ────────────────────────────────────────────────────────

async fn list_priorities(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(|db| db.list_priorities()).await?))
}

async fn get_priority(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    found(state.db.call(move |db| db.get_priority(id)).await?, "Priority", id)
}

async fn create_priority(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Json(req): Json<PriorityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let priority = state
        .db
        .call(move |db| {
            validate::validate_priority(db, &req.name)?;
            db.create_priority(&req.name, req.value)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(priority)))
}

async fn update_priority(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<PriorityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let priority = state
        .db
        .call(move |db| {
            validate::validate_priority(db, &req.name)?;
            db.update_priority(id, &req.name, req.value)
        })
        .await?;
    Ok(Json(priority))
}

async fn delete_priority(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    deleted(state.db.call(move |db| db.delete_priority(id)).await?, "Priority", id)
}

// ── Carrier types ─────────────────────────────────────────────────────

async fn list_carrier_types(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(|db| db.list_carrier_types()).await?))
}

async fn get_carrier_type(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    found(
        state.db.call(move |db| db.get_carrier_type(id)).await?,
        "Carrier type",
        id,
    )
}

async fn create_carrier_type(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Json(req): Json<NameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let carrier_type = state
        .db
        .call(move |db| {
            validate::validate_carrier_type(db, &req.name)?;
            db.create_carrier_type(&req.name)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(carrier_type)))
}

async fn update_carrier_type(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<NameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let carrier_type = state
        .db
        .call(move |db| {
            validate::validate_carrier_type(db, &req.name)?;
            db.update_carrier_type(id, &req.name)
        })
        .await?;
    Ok(Json(carrier_type))
}

async fn delete_carrier_type(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    deleted(
        state.db.call(move |db| db.delete_carrier_type(id)).await?,
        "Carrier type",
        id,
    )
}

// ── Carriers ──────────────────────────────────────────────────────────

async fn list_carriers(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(|db| db.list_carriers()).await?))
}

async fn get_carrier(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    found(state.db.call(move |db| db.get_carrier(id)).await?, "Carrier", id)
}

async fn create_carrier(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Json(req): Json<CarrierRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let carrier = state
        .db
        .call(move |db| {
            validate::validate_carrier(db, &req.carrier_id)?;
            db.create_carrier(&req.carrier_id, req.carrier_type, req.location)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(carrier)))
}

async fn update_carrier(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<CarrierRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let carrier = state
        .db
        .call(move |db| {
            validate::validate_carrier(db, &req.carrier_id)?;
            db.update_carrier(id, &req.carrier_id, req.carrier_type, req.location)
        })
        .await?;
    Ok(Json(carrier))
}

async fn delete_carrier(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    deleted(state.db.call(move |db| db.delete_carrier(id)).await?, "Carrier", id)
}

// ── Locations ─────────────────────────────────────────────────────────

async fn list_stocks(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(|db| db.list_stocks()).await?))
}

async fn get_stock(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    found(state.db.call(move |db| db.get_stock(id)).await?, "Stock", id)
}

async fn create_stock(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Json(req): Json<StockRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let stock = state
        .db
        .call(move |db| {
            validate::validate_position(db, &req.position)?;
            db.create_stock(&req.position)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(stock)))
}

async fn update_stock(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<StockRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let stock = state
        .db
        .call(move |db| {
            validate::validate_position(db, &req.position)?;
            db.update_stock(id, &req.position)
        })
        .await?;
    Ok(Json(stock))
}

async fn delete_stock(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let done = state
        .db
        .call(move |db| match db.get_stock(id)? {
            Some(_) => db.delete_location(id),
            None => Ok(false),
        })
        .await?;
    deleted(done, "Stock", id)
}

async fn list_transports(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(|db| db.list_transports()).await?))
}

async fn get_transport(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    found(state.db.call(move |db| db.get_transport(id)).await?, "Transport", id)
}

async fn create_transport(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Json(req): Json<TransportRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let transport = state
        .db
        .call(move |db| {
            validate::validate_position(db, &req.position)?;
            db.create_transport(&req.position, req.transporter)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(transport)))
}

async fn update_transport(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<TransportRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let transport = state
        .db
        .call(move |db| {
            validate::validate_position(db, &req.position)?;
            db.update_transport(id, &req.position, req.transporter)
        })
        .await?;
    Ok(Json(transport))
}

async fn delete_transport(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let done = state
        .db
        .call(move |db| match db.get_transport(id)? {
            Some(_) => db.delete_location(id),
            None => Ok(false),
        })
        .await?;
    deleted(done, "Transport", id)
}

async fn list_workstations(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(|db| db.list_workstations()).await?))
}

async fn get_workstation(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    found(
        state.db.call(move |db| db.get_workstation(id)).await?,
        "Workstation",
        id,
    )
}

async fn create_workstation(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Json(req): Json<NewWorkstation>,
) -> Result<impl IntoResponse, ApiError> {
    let workstation = state
        .db
        .call(move |db| {
            validate::validate_workstation(db, &req)?;
            db.create_workstation(&req)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(workstation)))
}

async fn update_workstation(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<NewWorkstation>,
) -> Result<impl IntoResponse, ApiError> {
    let workstation = state
        .db
        .call(move |db| {
            validate::validate_workstation(db, &req)?;
            db.update_workstation(id, &req)
        })
        .await?;
    Ok(Json(workstation))
}

async fn delete_workstation(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let done = state
        .db
        .call(move |db| match db.get_workstation(id)? {
            Some(_) => db.delete_location(id),
            None => Ok(false),
        })
        .await?;
    deleted(done, "Workstation", id)
}

// ── Assemblies ────────────────────────────────────────────────────────

async fn list_assemblies(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(|db| db.list_assemblies()).await?))
}

async fn get_assembly(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    found(state.db.call(move |db| db.get_assembly(id)).await?, "Assembly", id)
}

async fn create_assembly(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Json(req): Json<NewAssembly>,
) -> Result<impl IntoResponse, ApiError> {
    let assembly = state
        .db
        .call(move |db| {
            validate::validate_assembly(db, &req)?;
            db.create_assembly(&req)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(assembly)))
}

async fn update_assembly(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<NewAssembly>,
) -> Result<impl IntoResponse, ApiError> {
    let assembly = state
        .db
        .call(move |db| {
            validate::validate_assembly(db, &req)?;
            db.update_assembly(id, &req)
        })
        .await?;
    Ok(Json(assembly))
}

async fn delete_assembly(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    deleted(state.db.call(move |db| db.delete_assembly(id)).await?, "Assembly", id)
}

// ── Parameters ────────────────────────────────────────────────────────

async fn list_parameters(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(|db| db.list_parameters()).await?))
}

async fn get_parameter(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    found(state.db.call(move |db| db.get_parameter(id)).await?, "Parameter", id)
}

async fn create_parameter(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Json(req): Json<ParameterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let parameter = state
        .db
        .call(move |db| {
            validate::validate_parameter(db, &req.field)?;
            db.create_parameter(&req.field)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(parameter)))
}

async fn update_parameter(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<ParameterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let parameter = state
        .db
        .call(move |db| {
            validate::validate_parameter(db, &req.field)?;
            db.update_parameter(id, &req.field)
        })
        .await?;
    Ok(Json(parameter))
}

async fn delete_parameter(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    deleted(state.db.call(move |db| db.delete_parameter(id)).await?, "Parameter", id)
}

// ── Validation patterns ───────────────────────────────────────────────

async fn list_patterns(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(|db| db.list_patterns()).await?))
}

async fn get_pattern(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = name.clone();
    found(
        state.db.call(move |db| db.get_pattern(&lookup)).await?,
        "Validation pattern",
        name,
    )
}

async fn create_pattern(
    State(state): State<SharedState>,
    current: CurrentUser,
    Json(pattern): Json<ValidationPattern>,
) -> Result<impl IntoResponse, ApiError> {
    current.require_admin()?;
    validate::check_pattern(&pattern).map_err(ApiError::BadRequest)?;
    let pattern = state
        .db
        .call(move |db| {
            if db.get_pattern(&pattern.name)?.is_some() {
                return Err(
                    TrackerError::already_exists("Validation pattern", &pattern.name).into(),
                );
            }
            db.upsert_pattern(&pattern)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(pattern)))
}

async fn update_pattern(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(name): Path<String>,
    Json(mut pattern): Json<ValidationPattern>,
) -> Result<impl IntoResponse, ApiError> {
    current.require_admin()?;
    pattern.name = name;
    validate::check_pattern(&pattern).map_err(ApiError::BadRequest)?;
    let pattern = state
        .db
        .call(move |db| {
            if db.get_pattern(&pattern.name)?.is_none() {
                return Err(TrackerError::not_found("Validation pattern", &pattern.name).into());
            }
            db.upsert_pattern(&pattern)
        })
        .await?;
    Ok(Json(pattern))
}

async fn delete_pattern(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    current.require_admin()?;
    let lookup = name.clone();
    deleted(
        state.db.call(move |db| db.delete_pattern(&lookup)).await?,
        "Validation pattern",
        name,
    )
}

// ── Global config ─────────────────────────────────────────────────────

/// Values with a known meaning must parse.
fn check_config_value(db: &TrackerDb, entry: &GlobalConfig) -> anyhow::Result<()> {
    if entry.key.trim().is_empty() {
        return Err(TrackerError::Validation("Config key is empty".into()).into());
    }
    if entry.key == OLD_ACTIVE_JOB_KEY {
        let mut v = FieldValidator::new(db);
        v.field(OLD_ACTIVE_JOB_KEY, "Integer", &entry.value)?;
        v.finish()?;
    }
    Ok(())
}

async fn list_config(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(|db| db.list_config()).await?))
}

async fn get_config(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = key.clone();
    let value = state.db.call(move |db| db.get_config(&lookup)).await?;
    found(
        value.map(|value| GlobalConfig {
            key: key.clone(),
            value,
        }),
        "Config",
        &key,
    )
}

async fn create_config(
    State(state): State<SharedState>,
    current: CurrentUser,
    Json(entry): Json<GlobalConfig>,
) -> Result<impl IntoResponse, ApiError> {
    current.require_admin()?;
    let entry = state
        .db
        .call(move |db| {
            check_config_value(db, &entry)?;
            if db.get_config(&entry.key)?.is_some() {
                return Err(TrackerError::already_exists("Config", &entry.key).into());
            }
            db.set_config(&entry.key, &entry.value)?;
            Ok(entry)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn update_config(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(key): Path<String>,
    Json(req): Json<ConfigValueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    current.require_admin()?;
    let entry = GlobalConfig { key, value: req.value };
    let entry = state
        .db
        .call(move |db| {
            check_config_value(db, &entry)?;
            if db.get_config(&entry.key)?.is_none() {
                return Err(TrackerError::not_found("Config", &entry.key).into());
            }
            db.set_config(&entry.key, &entry.value)?;
            Ok(entry)
        })
        .await?;
    Ok(Json(entry))
}

async fn delete_config(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    current.require_admin()?;
    let lookup = key.clone();
    deleted(
        state.db.call(move |db| db.delete_config(&lookup)).await?,
        "Config",
        key,
    )
}
