//! Jobs and their procedures: CRUD, lifecycle, transport and parameter values.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use fabtrack_common::{FinishOutcome, Job, Role};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiError, CurrentUser, SharedState, deleted, found};
use crate::shopfloor::db::{NewAssembly, NewJob};
use crate::shopfloor::validate;
use crate::shopfloor::values::{self, StepValues};
use crate::shopfloor::workflow;

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/v1/jobs", get(list_jobs).post(create_job))
        .route("/api/v1/jobs/important", get(important_jobs))
        .route("/api/v1/jobs/transport", get(transport_jobs))
        .route("/api/v1/jobs/old", get(old_jobs))
        .route("/api/v1/jobs/mine", get(my_jobs))
        .route(
            "/api/v1/jobs/{id}",
            get(get_job).put(update_job).delete(delete_job),
        )
        .route("/api/v1/jobs/{id}/start", post(start_job))
        .route("/api/v1/jobs/{id}/stop", post(stop_job))
        .route("/api/v1/jobs/{id}/collect", post(collect_job))
        .route("/api/v1/jobs/{id}/deliver", post(deliver_job))
        .route("/api/v1/jobs/{id}/progress", get(job_progress))
        .route("/api/v1/jobs/{id}/next-position", get(next_position))
        .route("/api/v1/jobs/{id}/protocol", get(job_protocol))
        .route(
            "/api/v1/jobs/{id}/values",
            get(export_values).put(import_values),
        )
        .route("/api/v1/procedures/{id}", get(get_procedure))
        .route("/api/v1/procedures/{id}/exec", post(exec_procedure))
        .route("/api/v1/procedures/{id}/finish", post(finish_procedure))
        .route("/api/v1/procedures/{id}/advance", post(advance_procedure))
        .route(
            "/api/v1/workstations/{id}/procedures",
            get(workstation_queue),
        )
}

#[derive(Deserialize)]
pub struct FinishRequest {
    /// Minutes to book instead of the measured time; 0 measures.
    #[serde(default)]
    pub transition_time: i64,
    /// Required when the last state of a creating step is finished.
    #[serde(default)]
    pub assembly: Option<NewAssembly>,
}

#[derive(Deserialize)]
pub struct MyJobsQuery {
    /// Also list jobs that are waiting for a transporter.
    #[serde(default)]
    pub include_transport: bool,
}

#[derive(Serialize)]
pub struct TransitionResponse {
    pub job: Job,
    pub outcome: FinishOutcome,
}

// ── CRUD ──────────────────────────────────────────────────────────────

async fn list_jobs(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(|db| db.list_jobs()).await?))
}

async fn get_job(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    found(state.db.call(move |db| db.get_job(id)).await?, "Job", id)
}

async fn create_job(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Json(req): Json<NewJob>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .db
        .call(move |db| {
            validate::validate_job(db, &req)?;
            db.create_job(&req, Utc::now())
        })
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn update_job(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<NewJob>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .db
        .call(move |db| {
            validate::validate_job(db, &req)?;
            db.update_job(id, &req)
        })
        .await?;
    Ok(Json(job))
}

async fn delete_job(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    deleted(state.db.call(move |db| db.delete_job(id)).await?, "Job", id)
}

// ── Lifecycle ─────────────────────────────────────────────────────────

async fn start_job(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .db
        .call(move |db| workflow::start_job(db, id, Utc::now()))
        .await?;
    Ok(Json(job))
}

async fn stop_job(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(move |db| workflow::stop_job(db, id)).await?))
}

async fn collect_job(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    current.require_any(&[Role::Transport])?;
    let user = current.user;
    let job = state
        .db
        .call(move |db| workflow::collect_job(db, id, &user, Utc::now()))
        .await?;
    Ok(Json(job))
}

async fn deliver_job(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    current.require_any(&[Role::Transport])?;
    let job = state
        .db
        .call(move |db| workflow::deliver_job(db, id, Utc::now()))
        .await?;
    Ok(Json(job))
}

async fn job_progress(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.db.call(move |db| workflow::load_job(db, id)).await?;
    Ok(Json(job.progress()))
}

async fn next_position(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.db.call(move |db| workflow::load_job(db, id)).await?;
    Ok(Json(serde_json::json!({ "position": job.next_position() })))
}

async fn job_protocol(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let protocol = state
        .db
        .call(move |db| {
            let job = workflow::load_job(db, id)?;
            values::build_protocol(db, &job)
        })
        .await?;
    Ok(Json(protocol))
}

async fn export_values(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.db.call(move |db| workflow::load_job(db, id)).await?;
    Ok(Json(values::export_values(&job)))
}

async fn import_values(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(data): Json<Vec<StepValues>>,
) -> Result<impl IntoResponse, ApiError> {
    let written = state
        .db
        .call(move |db| {
            let job = workflow::load_job(db, id)?;
            values::import_values(db, &job, &data)
        })
        .await?;
    Ok(Json(serde_json::json!({ "written": written })))
}

// ── Overviews ─────────────────────────────────────────────────────────

async fn important_jobs(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(workflow::important_jobs).await?))
}

async fn transport_jobs(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.call(workflow::transport_jobs).await?))
}

async fn old_jobs(
    State(state): State<SharedState>,
    _user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let fallback = state.tracker.old_active_job_minutes;
    let jobs = state
        .db
        .call(move |db| workflow::old_jobs(db, fallback, Utc::now()))
        .await?;
    Ok(Json(jobs))
}

async fn my_jobs(
    State(state): State<SharedState>,
    current: CurrentUser,
    Query(query): Query<MyJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    current.require_any(&[Role::Technologist])?;
    let user = current.user.id;
    let jobs = state
        .db
        .call(move |db| workflow::technologist_jobs(db, user, query.include_transport))
        .await?;
    Ok(Json(jobs))
}

async fn workstation_queue(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .db
            .call(move |db| workflow::workstation_queue(db, id))
            .await?,
    ))
}

// ── Procedures ────────────────────────────────────────────────────────

async fn get_procedure(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .db
            .call(move |db| workflow::get_procedure(db, id))
            .await?,
    ))
}

async fn exec_procedure(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user = current.user.id;
    let job = state
        .db
        .call(move |db| workflow::exec_procedure(db, id, user, Utc::now()))
        .await?;
    Ok(Json(job))
}

async fn finish_procedure(
    State(state): State<SharedState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<FinishRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (job, outcome) = state
        .db
        .call(move |db| {
            workflow::finish_procedure(db, id, req.transition_time, req.assembly, Utc::now())
        })
        .await?;
    Ok(Json(TransitionResponse { job, outcome }))
}

async fn advance_procedure(
    State(state): State<SharedState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user = current.user.id;
    let (job, outcome) = state
        .db
        .call(move |db| workflow::advance_procedure(db, id, user, Utc::now()))
        .await?;
    Ok(Json(TransitionResponse { job, outcome }))
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::shopfloor::seed::DEMO_PASSWORD;
    use axum::http::StatusCode;
    use serde_json::{Value, json};

    fn find<'a>(list: &'a Value, key: &str, name: &str) -> &'a Value {
        list.as_array()
            .unwrap()
            .iter()
            .find(|v| v[key] == name)
            .unwrap()
    }

    fn id(v: &Value) -> String {
        v["id"].as_str().unwrap().to_string()
    }

    async fn demo_job(app: &TestApp) -> Value {
        let (_, jobs) = app.admin("GET", "/api/v1/jobs", None).await;
        find(&jobs, "name", "Job 1").clone()
    }

    #[tokio::test]
    async fn test_job_crud() {
        let app = demo_app();
        let (_, priorities) = app.admin("GET", "/api/v1/priorities", None).await;
        let (_, chains) = app.admin("GET", "/api/v1/process-chains", None).await;
        let high = find(&priorities, "name", "Hoch");
        let chain = find(&chains, "name", "Prozesskette C");

        let (status, job) = app
            .admin(
                "POST",
                "/api/v1/jobs",
                Some(json!({"name": "Guss 7", "priority": high["id"], "process_chain": chain["id"]})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(job["state"], "pending");
        assert_eq!(job["procedures"].as_array().unwrap().len(), 3);

        let (status, _) = app
            .admin(
                "POST",
                "/api/v1/jobs",
                Some(json!({"name": "Guss 7", "priority": high["id"], "process_chain": chain["id"]})),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let uri = format!("/api/v1/jobs/{}", id(&job));
        let (status, renamed) = app
            .admin(
                "PUT",
                &uri,
                Some(json!({"name": "Guss 8", "priority": high["id"], "process_chain": chain["id"]})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(renamed["name"], "Guss 8");

        let (status, _) = app.admin("DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = app.admin("GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_technologist_sees_jobs_at_own_workstations() {
        let app = demo_app();
        let driver = app.login("transport", DEMO_PASSWORD).await;
        let worker = app.login("technologist", DEMO_PASSWORD).await;
        let planner = app.login("pkp", DEMO_PASSWORD).await;
        let job = demo_job(&app).await;
        let job_uri = format!("/api/v1/jobs/{}", id(&job));
        app.admin("POST", &format!("{}/start", job_uri), None).await;

        let (status, mine) = app.send("GET", "/api/v1/jobs/mine", Some(&worker), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(mine.as_array().unwrap().is_empty());
        let (_, mine) = app
            .send("GET", "/api/v1/jobs/mine?include_transport=true", Some(&worker), None)
            .await;
        assert_eq!(mine.as_array().unwrap().len(), 1);

        app.send("POST", &format!("{}/collect", job_uri), Some(&driver), None)
            .await;
        app.send("POST", &format!("{}/deliver", job_uri), Some(&driver), None)
            .await;
        let (_, mine) = app.send("GET", "/api/v1/jobs/mine", Some(&worker), None).await;
        assert_eq!(mine.as_array().unwrap().len(), 1);
        assert_eq!(mine[0]["name"], "Job 1");

        // Admins pass the role check but staff no workstation.
        let (status, mine) = app.admin("GET", "/api/v1/jobs/mine", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(mine.as_array().unwrap().is_empty());
        let (status, _) = app.send("GET", "/api/v1/jobs/mine", Some(&planner), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_job_runs_through_the_shop_floor() {
        let app = demo_app();
        let driver = app.login("transport", DEMO_PASSWORD).await;
        let worker = app.login("technologist", DEMO_PASSWORD).await;
        let job = demo_job(&app).await;
        let job_uri = format!("/api/v1/jobs/{}", id(&job));
        let anneal = id(&job["procedures"][0]);
        let (_, workstations) = app.admin("GET", "/api/v1/workstations", None).await;
        let furnace = id(find(&workstations, "name", "Ofen"));

        let (status, started) = app.admin("POST", &format!("{}/start", job_uri), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(started["state"], "processing");

        let (_, waiting) = app.admin("GET", "/api/v1/jobs/transport", None).await;
        assert_eq!(waiting.as_array().unwrap().len(), 1);
        let (_, position) = app
            .admin("GET", &format!("{}/next-position", job_uri), None)
            .await;
        assert_eq!(position["position"], "Halle 1");

        // Only transporters move goods.
        let (status, _) = app
            .send("POST", &format!("{}/collect", job_uri), Some(&worker), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .send("POST", &format!("{}/collect", job_uri), Some(&driver), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, delivered) = app
            .send("POST", &format!("{}/deliver", job_uri), Some(&driver), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            delivered["assemblies"][0]["carriers"][0]["location"]["position"],
            "Halle 1"
        );

        let (_, queue) = app
            .admin("GET", &format!("/api/v1/workstations/{}/procedures", furnace), None)
            .await;
        assert_eq!(queue.as_array().unwrap().len(), 1);
        assert_eq!(queue[0]["job_name"], "Job 1");

        let proc_uri = format!("/api/v1/procedures/{}", anneal);
        let (status, _) = app
            .send("POST", &format!("{}/advance", proc_uri), Some(&worker), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = app
            .send("POST", &format!("{}/advance", proc_uri), Some(&worker), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("blocking"));

        let (status, finished) = app
            .send("POST", &format!("{}/finish", proc_uri), Some(&worker), Some(json!({})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(finished["outcome"]["modified_assemblies"].as_array().unwrap().len(), 1);
        let (_, procedure) = app.admin("GET", &proc_uri, None).await;
        let execs = procedure["history"]["execs"].as_array().unwrap();
        assert_eq!(execs.last().unwrap()["state"]["name"], "Transport");

        let (status, _) = app
            .send("POST", &format!("{}/collect", job_uri), Some(&driver), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app
            .send("POST", &format!("{}/deliver", job_uri), Some(&driver), None)
            .await;
        assert_eq!(status, StatusCode::OK);

        let (_, progress) = app.admin("GET", &format!("{}/progress", job_uri), None).await;
        assert_eq!(progress, json!({"current": 1, "remaining": 1, "total": 2, "percent": 50}));

        let (status, protocol) = app.admin("GET", &format!("{}/protocol", job_uri), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(protocol["procedures"][0]["states"][1]["triggered_by"], "technologist");
    }

    #[tokio::test]
    async fn test_workflow_errors_are_bad_requests() {
        let app = demo_app();
        let job = demo_job(&app).await;
        let job_uri = format!("/api/v1/jobs/{}", id(&job));

        let (status, body) = app.admin("POST", &format!("{}/stop", job_uri), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("pending"));

        let proc_uri = format!("/api/v1/procedures/{}", id(&job["procedures"][0]));
        let (status, _) = app.admin("POST", &format!("{}/exec", proc_uri), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        app.admin("POST", &format!("{}/start", job_uri), None).await;
        let (status, _) = app.admin("POST", &format!("{}/start", job_uri), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Processing jobs are neither editable nor deletable.
        let (status, _) = app.admin("DELETE", &job_uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        // The admin has no transport of their own.
        let (status, body) = app.admin("POST", &format!("{}/collect", job_uri), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("no transport"));

        let (status, stopped) = app.admin("POST", &format!("{}/stop", job_uri), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stopped["state"], "cancelled");

        let (status, _) = app
            .admin("POST", &format!("/api/v1/procedures/{}/exec", uuid::Uuid::new_v4()), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_values_round_trip_over_http() {
        let app = demo_app();
        let job = demo_job(&app).await;
        let uri = format!("/api/v1/jobs/{}/values", id(&job));

        let (status, written) = app
            .admin(
                "PUT",
                &uri,
                Some(json!([{
                    "step": "Wärmebehandlung",
                    "parameters": [{"field": "Temperatur", "value": "450 K"}]
                }])),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(written["written"], 1);

        let (status, exported) = app.admin("GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let anneal = find(&exported, "step", "Wärmebehandlung");
        let temperature = find(&anneal["parameters"], "field", "Temperatur");
        assert_eq!(temperature["value"], "450");
        assert_eq!(temperature["unit"], "K");

        let (status, _) = app
            .admin(
                "PUT",
                &uri,
                Some(json!([{"step": "Fräsen", "parameters": []}])),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_overviews() {
        let app = demo_app();
        let (status, important) = app.admin("GET", "/api/v1/jobs/important", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(important.as_array().unwrap().is_empty());

        let job = demo_job(&app).await;
        app.admin("POST", &format!("/api/v1/jobs/{}/start", id(&job)), None)
            .await;
        let (_, important) = app.admin("GET", "/api/v1/jobs/important", None).await;
        assert_eq!(important[0]["name"], "Job 1");

        let (status, old) = app.admin("GET", "/api/v1/jobs/old", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(old.as_array().unwrap().is_empty());

        let (status, _) = app
            .admin(
                "GET",
                &format!("/api/v1/workstations/{}/procedures", uuid::Uuid::new_v4()),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
