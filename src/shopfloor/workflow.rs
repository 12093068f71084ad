//! Job and procedure workflow on top of the store.
//!
//! Each operation loads the job aggregate, applies the pure transition from
//! `fabtrack_common::workflow`, then persists the outcome and any carrier
//! movement in one transaction.

use anyhow::Result;
use chrono::{DateTime, Utc};
use fabtrack_common::*;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::db::{NewAssembly, TrackerDb};
use super::validate;
use crate::errors::TrackerError;

/// GlobalConfig key holding the old-active-job threshold in minutes.
pub const OLD_ACTIVE_JOB_KEY: &str = "oldActiveJob";

/// A procedure waiting at a workstation.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub job: Uuid,
    pub job_name: String,
    pub priority: i32,
    pub procedure: Procedure,
}

pub fn load_job(db: &TrackerDb, id: Uuid) -> Result<Job> {
    db.get_job(id)?
        .ok_or_else(|| TrackerError::not_found("Job", id).into())
}

pub fn job_of_procedure(db: &TrackerDb, procedure_id: Uuid) -> Result<Job> {
    let job_id = db
        .job_for_procedure(procedure_id)?
        .ok_or_else(|| TrackerError::not_found("Procedure", procedure_id))?;
    load_job(db, job_id)
}

pub fn get_procedure(db: &TrackerDb, procedure_id: Uuid) -> Result<Procedure> {
    let job = job_of_procedure(db, procedure_id)?;
    job.procedures
        .into_iter()
        .find(|p| p.id == procedure_id)
        .ok_or_else(|| TrackerError::not_found("Procedure", procedure_id).into())
}

/// Saves `job` and returns it freshly loaded.
fn store(db: &TrackerDb, job: &Job) -> Result<Job> {
    db.save_job_progress(job)?;
    load_job(db, job.id)
}

pub fn start_job(db: &TrackerDb, id: Uuid, now: DateTime<Utc>) -> Result<Job> {
    db.transaction(|db| {
        let mut job = load_job(db, id)?;
        job.start(now).map_err(TrackerError::from)?;
        info!(job = %job.name, "job started");
        store(db, &job)
    })
}

pub fn stop_job(db: &TrackerDb, id: Uuid) -> Result<Job> {
    db.transaction(|db| {
        let mut job = load_job(db, id)?;
        job.stop().map_err(TrackerError::from)?;
        info!(job = %job.name, "job cancelled");
        store(db, &job)
    })
}

pub fn exec_procedure(db: &TrackerDb, procedure_id: Uuid, user: Uuid, now: DateTime<Utc>) -> Result<Job> {
    db.transaction(|db| {
        let mut job = job_of_procedure(db, procedure_id)?;
        job.exec_procedure(procedure_id, user, now)
            .map_err(TrackerError::from)?;
        info!(job = %job.name, procedure = %procedure_id, "state executed");
        store(db, &job)
    })
}

/// Finishes the running state of a procedure.
///
/// For a creating step `assembly` is validated and stored before the
/// procedure is finished, and rolled back with it on failure.
pub fn finish_procedure(
    db: &TrackerDb,
    procedure_id: Uuid,
    transition_time: i64,
    assembly: Option<NewAssembly>,
    now: DateTime<Utc>,
) -> Result<(Job, FinishOutcome)> {
    db.transaction(|db| {
        let mut job = job_of_procedure(db, procedure_id)?;
        let created = match assembly {
            Some(new) => {
                validate::validate_assembly(db, &new)?;
                Some(db.create_assembly(&new)?)
            }
            None => None,
        };
        let outcome = job
            .finish_procedure(procedure_id, transition_time, created, now)
            .map_err(TrackerError::from)?;
        let job = apply(db, &job, &outcome)?;
        info!(job = %job.name, procedure = %procedure_id, "state finished");
        Ok((job, outcome))
    })
}

pub fn advance_procedure(
    db: &TrackerDb,
    procedure_id: Uuid,
    user: Uuid,
    now: DateTime<Utc>,
) -> Result<(Job, FinishOutcome)> {
    db.transaction(|db| {
        let mut job = job_of_procedure(db, procedure_id)?;
        let outcome = job
            .advance_procedure(procedure_id, user, now)
            .map_err(TrackerError::from)?;
        let job = apply(db, &job, &outcome)?;
        info!(job = %job.name, procedure = %procedure_id, "state advanced");
        Ok((job, outcome))
    })
}

fn apply(db: &TrackerDb, job: &Job, outcome: &FinishOutcome) -> Result<Job> {
    db.save_job_progress(job)?;
    if !outcome.deleted_assemblies.is_empty() {
        db.remove_assemblies(&outcome.deleted_assemblies)?;
        info!(job = %job.name, count = outcome.deleted_assemblies.len(), "assemblies consumed");
    }
    load_job(db, job.id)
}

/// Moves the job's carriers onto the transport driven by `user`.
pub fn collect_job(db: &TrackerDb, id: Uuid, user: &User, now: DateTime<Utc>) -> Result<Job> {
    db.transaction(|db| {
        let transport = db.transport_for_user(user.id)?.ok_or_else(|| {
            TrackerError::from(WorkflowError::Collecting(format!(
                "User {} has no transport",
                user.username
            )))
        })?;
        let mut job = load_job(db, id)?;
        let carriers = job.collect(now).map_err(TrackerError::from)?;
        db.save_job_progress(&job)?;
        db.move_carriers(&carriers, transport.id)?;
        info!(job = %job.name, transport = %transport.position, "job collected");
        load_job(db, id)
    })
}

/// Drops the job's carriers at the next workstation or back in stock.
pub fn deliver_job(db: &TrackerDb, id: Uuid, now: DateTime<Utc>) -> Result<Job> {
    db.transaction(|db| {
        let mut job = load_job(db, id)?;
        let delivery = job.deliver(now).map_err(TrackerError::from)?;
        let location = match delivery.target {
            DeliveryTarget::Workstation(ws) => ws,
            DeliveryTarget::Stock => {
                db.default_stock()?
                    .ok_or_else(|| {
                        TrackerError::from(WorkflowError::Delivering("No stock location exists".into()))
                    })?
                    .id
            }
        };
        db.save_job_progress(&job)?;
        db.move_carriers(&delivery.carriers, location)?;
        info!(job = %job.name, target = ?delivery.target, "job delivered");
        load_job(db, id)
    })
}

/// The three processing jobs with the highest priority.
pub fn important_jobs(db: &TrackerDb) -> Result<Vec<Job>> {
    let mut jobs = db.list_jobs_in_state(JobState::Processing)?;
    jobs.sort_by(|a, b| b.priority.value.cmp(&a.priority.value));
    jobs.truncate(3);
    Ok(jobs)
}

pub fn transport_jobs(db: &TrackerDb) -> Result<Vec<Job>> {
    Ok(db
        .list_jobs()?
        .into_iter()
        .filter(|j| j.needs_transport())
        .collect())
}

/// Threshold from GlobalConfig, or `fallback` when unset or unparsable.
pub fn old_active_threshold(db: &TrackerDb, fallback: i64) -> Result<i64> {
    Ok(db
        .get_config(OLD_ACTIVE_JOB_KEY)?
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback))
}

pub fn old_jobs(db: &TrackerDb, fallback_minutes: i64, now: DateTime<Utc>) -> Result<Vec<Job>> {
    let threshold = old_active_threshold(db, fallback_minutes)?;
    Ok(db
        .list_jobs_in_state(JobState::Processing)?
        .into_iter()
        .filter(|j| j.is_old_active(threshold, now))
        .collect())
}

/// Processing jobs whose current procedure belongs to a workstation staffed
/// by `user`. Jobs waiting for collection or delivery are skipped unless
/// `include_transport` is set.
pub fn technologist_jobs(db: &TrackerDb, user: Uuid, include_transport: bool) -> Result<Vec<Job>> {
    let stations: Vec<Uuid> = db
        .workstations_for_user(user)?
        .into_iter()
        .map(|w| w.id)
        .collect();
    if stations.is_empty() {
        return Ok(Vec::new());
    }
    Ok(db
        .list_jobs_in_state(JobState::Processing)?
        .into_iter()
        .filter(|job| {
            job.current_procedure()
                .is_some_and(|p| stations.contains(&p.process_step.workstation.id))
        })
        .filter(|job| include_transport || !job.needs_transport())
        .collect())
}

/// Current procedures of processing jobs whose goods are at `workstation`.
pub fn workstation_queue(db: &TrackerDb, workstation: Uuid) -> Result<Vec<QueueEntry>> {
    if db.get_workstation(workstation)?.is_none() {
        return Err(TrackerError::not_found("Workstation", workstation).into());
    }
    let mut queue: Vec<QueueEntry> = db
        .list_jobs_in_state(JobState::Processing)?
        .into_iter()
        .filter_map(|job| {
            let procedure = job.current_procedure()?;
            if procedure.process_step.workstation.id != workstation
                || procedure.needs_delivery()
                || job.on_transport()
            {
                return None;
            }
            Some(QueueEntry {
                job: job.id,
                job_name: job.name.clone(),
                priority: job.priority.value,
                procedure: procedure.clone(),
            })
        })
        .collect();
    queue.sort_by(|a, b| b.priority.cmp(&a.priority));
    Ok(queue)
}
