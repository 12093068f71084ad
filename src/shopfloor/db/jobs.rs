use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fabtrack_common::*;
use rusqlite::params;
use serde::Deserialize;
use uuid::Uuid;

use super::TrackerDb;
use crate::errors::TrackerError;

#[derive(Debug, Clone, Deserialize)]
pub struct NewAssembly {
    pub assembly_id: String,
    pub alloy: String,
    #[serde(default)]
    pub sample_count: i32,
    #[serde(default)]
    pub position_at_carrier: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    /// Carrier ids holding the assembly, in order.
    #[serde(default)]
    pub carriers: Vec<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub priority: Uuid,
    pub process_chain: Uuid,
    #[serde(default)]
    pub assemblies: Vec<Uuid>,
}

struct AssemblyRow {
    id: Uuid,
    assembly_id: String,
    alloy: String,
    sample_count: i32,
    position_at_carrier: Option<String>,
    comment: Option<String>,
}

const ASSEMBLY_COLUMNS: &str =
    "id, assembly_id, alloy, sample_count, position_at_carrier, comment";

fn assembly_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssemblyRow> {
    Ok(AssemblyRow {
        id: row.get(0)?,
        assembly_id: row.get(1)?,
        alloy: row.get(2)?,
        sample_count: row.get(3)?,
        position_at_carrier: row.get(4)?,
        comment: row.get(5)?,
    })
}

struct JobRow {
    id: Uuid,
    name: String,
    state: String,
    priority_id: Uuid,
    process_chain_id: Uuid,
    created_at: DateTime<Utc>,
}

struct ExecRow {
    id: Uuid,
    state_id: Uuid,
    trigger: Option<Uuid>,
    transition_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    transition_time: i64,
}

impl TrackerDb {
    // ── Assemblies ────────────────────────────────────────────────────

    fn write_assembly_carriers(&self, id: Uuid, carriers: &[Uuid]) -> Result<()> {
        self.conn
            .execute("DELETE FROM assembly_carriers WHERE assembly_id = ?1", [id])
            .context("Failed to clear assembly carriers")?;
        for (position, carrier) in carriers.iter().enumerate() {
            if self.get_carrier(*carrier)?.is_none() {
                return Err(TrackerError::not_found("Carrier", carrier).into());
            }
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO assembly_carriers (assembly_id, carrier_id, position)
                     VALUES (?1, ?2, ?3)",
                    params![id, carrier, position as i64],
                )
                .context("Failed to insert assembly carrier")?;
        }
        Ok(())
    }

    pub fn create_assembly(&self, assembly: &NewAssembly) -> Result<Assembly> {
        if self.taken("assemblies", "assembly_id", &assembly.assembly_id, None)? {
            return Err(TrackerError::already_exists("Assembly", &assembly.assembly_id).into());
        }
        let id = Uuid::new_v4();
        self.transaction(|db| {
            db.conn
                .execute(
                    "INSERT INTO assemblies (id, assembly_id, alloy, sample_count, position_at_carrier, comment)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        id,
                        assembly.assembly_id,
                        assembly.alloy,
                        assembly.sample_count,
                        assembly.position_at_carrier,
                        assembly.comment,
                    ],
                )
                .context("Failed to insert assembly")?;
            db.write_assembly_carriers(id, &assembly.carriers)
        })?;
        self.get_assembly(id)?.context("Assembly not found after insert")
    }

    fn assembly_from_row(&self, row: AssemblyRow) -> Result<Assembly> {
        let carrier_ids = self.ids(
            "SELECT carrier_id FROM assembly_carriers WHERE assembly_id = ?1 ORDER BY position",
            row.id,
            "assembly carriers",
        )?;
        let carriers = carrier_ids
            .into_iter()
            .map(|c| self.get_carrier(c)?.context("Carrier of assembly missing"))
            .collect::<Result<Vec<_>>>()?;
        let modifications = self.ids(
            "SELECT procedure_id FROM assembly_modifications WHERE assembly_id = ?1 ORDER BY position",
            row.id,
            "assembly modifications",
        )?;
        Ok(Assembly {
            id: row.id,
            assembly_id: row.assembly_id,
            alloy: row.alloy,
            sample_count: row.sample_count,
            position_at_carrier: row.position_at_carrier,
            comment: row.comment,
            carriers,
            modifications,
        })
    }

    pub fn list_assemblies(&self) -> Result<Vec<Assembly>> {
        let sql = format!("SELECT {} FROM assemblies ORDER BY assembly_id", ASSEMBLY_COLUMNS);
        let rows = self.query_rows(&sql, [], "assemblies", assembly_row)?;
        rows.into_iter().map(|r| self.assembly_from_row(r)).collect()
    }

    pub fn get_assembly(&self, id: Uuid) -> Result<Option<Assembly>> {
        let sql = format!("SELECT {} FROM assemblies WHERE id = ?1", ASSEMBLY_COLUMNS);
        self.query_one(&sql, [id], "assembly", assembly_row)?
            .map(|r| self.assembly_from_row(r))
            .transpose()
    }

    pub fn update_assembly(&self, id: Uuid, assembly: &NewAssembly) -> Result<Assembly> {
        if self.get_assembly(id)?.is_none() {
            return Err(TrackerError::not_found("Assembly", id).into());
        }
        if self.taken("assemblies", "assembly_id", &assembly.assembly_id, Some(id))? {
            return Err(TrackerError::already_exists("Assembly", &assembly.assembly_id).into());
        }
        self.transaction(|db| {
            db.conn
                .execute(
                    "UPDATE assemblies SET assembly_id = ?1, alloy = ?2, sample_count = ?3,
                         position_at_carrier = ?4, comment = ?5
                     WHERE id = ?6",
                    params![
                        assembly.assembly_id,
                        assembly.alloy,
                        assembly.sample_count,
                        assembly.position_at_carrier,
                        assembly.comment,
                        id,
                    ],
                )
                .context("Failed to update assembly")?;
            db.write_assembly_carriers(id, &assembly.carriers)
        })?;
        self.get_assembly(id)?.context("Assembly not found after update")
    }

    pub fn delete_assembly(&self, id: Uuid) -> Result<bool> {
        let used = self.count(
            "SELECT COUNT(*) FROM job_assemblies WHERE assembly_id = ?1",
            id,
            "assembly references",
        )?;
        if used > 0 {
            return Err(TrackerError::in_use("assembly", "it belongs to a job").into());
        }
        self.delete_by_id("assemblies", id)
    }

    /// Drops assemblies consumed by a deleting step, detaching them from any job.
    pub fn remove_assemblies(&self, ids: &[Uuid]) -> Result<()> {
        self.transaction(|db| {
            for id in ids {
                db.conn
                    .execute("DELETE FROM job_assemblies WHERE assembly_id = ?1", [id])
                    .context("Failed to detach assembly")?;
                db.delete_by_id("assemblies", *id)?;
            }
            Ok(())
        })
    }

    /// Assemblies attached to a pending or processing job other than `except`.
    fn busy_assemblies(&self, assemblies: &[Uuid], except: Option<Uuid>) -> Result<Vec<Uuid>> {
        let mut busy = Vec::new();
        for assembly in assemblies {
            let count: i64 = self
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM job_assemblies ja JOIN jobs j ON j.id = ja.job_id
                     WHERE ja.assembly_id = ?1 AND j.state IN ('pending', 'processing')
                       AND (?2 IS NULL OR j.id != ?2)",
                    params![assembly, except],
                    |row| row.get(0),
                )
                .context("Failed to check assembly usage")?;
            if count > 0 {
                busy.push(*assembly);
            }
        }
        Ok(busy)
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    fn check_job_refs(&self, job: &NewJob, except: Option<Uuid>) -> Result<ProcessChain> {
        if self.get_priority(job.priority)?.is_none() {
            return Err(TrackerError::not_found("Priority", job.priority).into());
        }
        let chain = self
            .get_process_chain(job.process_chain)?
            .ok_or_else(|| TrackerError::not_found("Process chain", job.process_chain))?;
        chain.check_step_order().map_err(TrackerError::Validation)?;
        for assembly in &job.assemblies {
            if self.get_assembly(*assembly)?.is_none() {
                return Err(TrackerError::not_found("Assembly", assembly).into());
            }
        }
        let busy = self.busy_assemblies(&job.assemblies, except)?;
        if let Some(first) = busy.first() {
            return Err(TrackerError::in_use("assembly", format!("{} belongs to an active job", first)).into());
        }
        Ok(chain)
    }

    fn write_job_assemblies(&self, job_id: Uuid, assemblies: &[Uuid]) -> Result<()> {
        self.conn
            .execute("DELETE FROM job_assemblies WHERE job_id = ?1", [job_id])
            .context("Failed to clear job assemblies")?;
        for (position, assembly) in assemblies.iter().enumerate() {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO job_assemblies (job_id, assembly_id, position) VALUES (?1, ?2, ?3)",
                    params![job_id, assembly, position as i64],
                )
                .context("Failed to insert job assembly")?;
        }
        Ok(())
    }

    /// One procedure per chain step, each with an empty value per step parameter.
    fn write_procedures(&self, job_id: Uuid, chain: &ProcessChain) -> Result<()> {
        self.conn
            .execute("DELETE FROM procedures WHERE job_id = ?1", [job_id])
            .context("Failed to clear procedures")?;
        for (position, step) in chain.steps.iter().enumerate() {
            let procedure_id = Uuid::new_v4();
            self.conn
                .execute(
                    "INSERT INTO procedures (id, job_id, position, process_step_id) VALUES (?1, ?2, ?3, ?4)",
                    params![procedure_id, job_id, position as i64, step.id],
                )
                .context("Failed to insert procedure")?;
            for (value_pos, parameter) in step.parameters.iter().enumerate() {
                self.conn
                    .execute(
                        "INSERT INTO procedure_values (id, procedure_id, position, parameter_id)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![Uuid::new_v4(), procedure_id, value_pos as i64, parameter.id],
                    )
                    .context("Failed to insert procedure value")?;
            }
        }
        Ok(())
    }

    /// Rebuilds the procedures of pending jobs on a chain whose steps changed.
    pub(super) fn refresh_pending_jobs(&self, chain_id: Uuid) -> Result<usize> {
        let Some(chain) = self.get_process_chain(chain_id)? else {
            return Ok(0);
        };
        let jobs = self.ids(
            "SELECT id FROM jobs WHERE process_chain_id = ?1 AND state = 'pending'",
            chain_id,
            "pending jobs of chain",
        )?;
        for job in &jobs {
            self.write_procedures(*job, &chain)?;
        }
        Ok(jobs.len())
    }

    pub fn create_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<Job> {
        if self.taken("jobs", "name", &job.name, None)? {
            return Err(TrackerError::already_exists("Job", &job.name).into());
        }
        let chain = self.check_job_refs(job, None)?;
        let id = Uuid::new_v4();
        self.transaction(|db| {
            db.conn
                .execute(
                    "INSERT INTO jobs (id, name, state, priority_id, process_chain_id, created_at)
                     VALUES (?1, ?2, 'pending', ?3, ?4, ?5)",
                    params![id, job.name, job.priority, job.process_chain, now],
                )
                .context("Failed to insert job")?;
            db.write_job_assemblies(id, &job.assemblies)?;
            db.write_procedures(id, &chain)
        })?;
        self.get_job(id)?.context("Job not found after insert")
    }

    /// Only pending jobs can be edited. A changed chain rebuilds the procedures.
    pub fn update_job(&self, id: Uuid, job: &NewJob) -> Result<Job> {
        let Some(existing) = self.get_job(id)? else {
            return Err(TrackerError::not_found("Job", id).into());
        };
        if existing.state != JobState::Pending {
            return Err(TrackerError::Validation(format!(
                "Job is {} and can no longer be edited",
                existing.state.as_str()
            ))
            .into());
        }
        if self.taken("jobs", "name", &job.name, Some(id))? {
            return Err(TrackerError::already_exists("Job", &job.name).into());
        }
        let chain = self.check_job_refs(job, Some(id))?;
        self.transaction(|db| {
            db.conn
                .execute(
                    "UPDATE jobs SET name = ?1, priority_id = ?2, process_chain_id = ?3 WHERE id = ?4",
                    params![job.name, job.priority, job.process_chain, id],
                )
                .context("Failed to update job")?;
            db.write_job_assemblies(id, &job.assemblies)?;
            if existing.process_chain.id != job.process_chain {
                db.write_procedures(id, &chain)?;
            }
            Ok(())
        })?;
        self.get_job(id)?.context("Job not found after update")
    }

    pub fn delete_job(&self, id: Uuid) -> Result<bool> {
        let state: Option<String> = self.query_one(
            "SELECT state FROM jobs WHERE id = ?1",
            [id],
            "job state",
            |row| row.get(0),
        )?;
        if state.as_deref() == Some(JobState::Processing.as_str()) {
            return Err(TrackerError::in_use("job", "it is processing").into());
        }
        self.delete_by_id("jobs", id)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let ids = self.query_rows(
            "SELECT id FROM jobs ORDER BY created_at, name",
            [],
            "jobs",
            |row| row.get(0),
        )?;
        ids.into_iter()
            .map(|id| self.get_job(id)?.context("Job vanished while listing"))
            .collect()
    }

    pub fn list_jobs_in_state(&self, state: JobState) -> Result<Vec<Job>> {
        let ids = self.query_rows(
            "SELECT id FROM jobs WHERE state = ?1 ORDER BY created_at, name",
            [state.as_str()],
            "jobs by state",
            |row| row.get(0),
        )?;
        ids.into_iter()
            .map(|id| self.get_job(id)?.context("Job vanished while listing"))
            .collect()
    }

    pub fn job_for_procedure(&self, procedure_id: Uuid) -> Result<Option<Uuid>> {
        self.query_one(
            "SELECT job_id FROM procedures WHERE id = ?1",
            [procedure_id],
            "job of procedure",
            |row| row.get(0),
        )
    }

    pub fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = self.query_one(
            "SELECT id, name, state, priority_id, process_chain_id, created_at FROM jobs WHERE id = ?1",
            [id],
            "job",
            |row| {
                Ok(JobRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    state: row.get(2)?,
                    priority_id: row.get(3)?,
                    process_chain_id: row.get(4)?,
                    created_at: row.get(5)?,
                })
            },
        )?;
        row.map(|r| self.job_from_row(r)).transpose()
    }

    fn job_from_row(&self, row: JobRow) -> Result<Job> {
        let state = JobState::from_str(&row.state)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job state")?;
        let priority = self
            .get_priority(row.priority_id)?
            .context("Priority of job missing")?;
        let chain_name: String = self
            .conn
            .query_row(
                "SELECT name FROM process_chains WHERE id = ?1",
                [row.process_chain_id],
                |r| r.get(0),
            )
            .context("Process chain of job missing")?;

        let assembly_ids = self.ids(
            "SELECT assembly_id FROM job_assemblies WHERE job_id = ?1 ORDER BY position",
            row.id,
            "job assemblies",
        )?;
        let assemblies = assembly_ids
            .into_iter()
            .map(|a| self.get_assembly(a)?.context("Assembly of job missing"))
            .collect::<Result<Vec<_>>>()?;

        let procedure_rows = self.query_rows(
            "SELECT id, position, process_step_id FROM procedures WHERE job_id = ?1 ORDER BY position",
            [row.id],
            "procedures",
            |r| Ok((r.get::<_, Uuid>(0)?, r.get::<_, i32>(1)?, r.get::<_, Uuid>(2)?)),
        )?;
        let procedures = procedure_rows
            .into_iter()
            .map(|(pid, position, step)| self.load_procedure(pid, position, step))
            .collect::<Result<Vec<_>>>()?;

        Ok(Job {
            id: row.id,
            name: row.name,
            state,
            priority,
            process_chain: ChainRef {
                id: row.process_chain_id,
                name: chain_name,
            },
            procedures,
            assemblies,
            created_at: row.created_at,
        })
    }

    fn load_procedure(&self, id: Uuid, position: i32, step_id: Uuid) -> Result<Procedure> {
        let process_step = self
            .get_process_step(step_id)?
            .context("Process step of procedure missing")?;
        let exec_rows = self.query_rows(
            "SELECT id, state_id, trigger_id, transition_at, started_at, finished_at, transition_time
             FROM state_execs WHERE procedure_id = ?1 ORDER BY seq",
            [id],
            "state execs",
            |r| {
                Ok(ExecRow {
                    id: r.get(0)?,
                    state_id: r.get(1)?,
                    trigger: r.get(2)?,
                    transition_at: r.get(3)?,
                    started_at: r.get(4)?,
                    finished_at: r.get(5)?,
                    transition_time: r.get(6)?,
                })
            },
        )?;
        let execs = exec_rows
            .into_iter()
            .map(|e| {
                Ok(StateExec {
                    id: e.id,
                    state: self.get_state(e.state_id)?.context("State of exec missing")?,
                    trigger: e.trigger,
                    transition_at: e.transition_at,
                    started_at: e.started_at,
                    finished_at: e.finished_at,
                    transition_time: e.transition_time,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let values = self.query_rows(
            "SELECT v.id, p.id, p.field, v.value, v.unit FROM procedure_values v
             JOIN parameters p ON p.id = v.parameter_id
             WHERE v.procedure_id = ?1 ORDER BY v.position",
            [id],
            "procedure values",
            |r| {
                Ok(Value {
                    id: r.get(0)?,
                    parameter: Parameter {
                        id: r.get(1)?,
                        field: r.get(2)?,
                    },
                    value: r.get(3)?,
                    unit: r.get(4)?,
                })
            },
        )?;
        Ok(Procedure {
            id,
            position,
            process_step,
            history: StateHistory { execs },
            values,
        })
    }

    /// Persists everything the workflow may change on a job: its state,
    /// assemblies, state histories and assembly modifications.
    pub fn save_job_progress(&self, job: &Job) -> Result<()> {
        self.transaction(|db| {
            db.conn
                .execute(
                    "UPDATE jobs SET state = ?1 WHERE id = ?2",
                    params![job.state.as_str(), job.id],
                )
                .context("Failed to update job state")?;
            let ids: Vec<Uuid> = job.assemblies.iter().map(|a| a.id).collect();
            db.write_job_assemblies(job.id, &ids)?;

            for procedure in &job.procedures {
                for (seq, exec) in procedure.history.execs.iter().enumerate() {
                    db.conn
                        .execute(
                            "INSERT INTO state_execs (id, procedure_id, seq, state_id, trigger_id,
                                 transition_at, started_at, finished_at, transition_time)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                             ON CONFLICT(procedure_id, seq) DO UPDATE SET
                                 trigger_id = excluded.trigger_id,
                                 started_at = excluded.started_at,
                                 finished_at = excluded.finished_at,
                                 transition_time = excluded.transition_time",
                            params![
                                exec.id,
                                procedure.id,
                                seq as i64,
                                exec.state.id,
                                exec.trigger,
                                exec.transition_at,
                                exec.started_at,
                                exec.finished_at,
                                exec.transition_time,
                            ],
                        )
                        .context("Failed to save state exec")?;
                }
            }

            for assembly in &job.assemblies {
                db.conn
                    .execute(
                        "DELETE FROM assembly_modifications WHERE assembly_id = ?1",
                        [assembly.id],
                    )
                    .context("Failed to clear assembly modifications")?;
                for (position, procedure) in assembly.modifications.iter().enumerate() {
                    db.conn
                        .execute(
                            "INSERT INTO assembly_modifications (assembly_id, procedure_id, position)
                             VALUES (?1, ?2, ?3)",
                            params![assembly.id, procedure, position as i64],
                        )
                        .context("Failed to insert assembly modification")?;
                }
            }
            Ok(())
        })
    }

    /// Writes measured values of a procedure, keyed by parameter.
    pub fn set_procedure_value(
        &self,
        procedure_id: Uuid,
        parameter_id: Uuid,
        value: Option<&str>,
        unit: Option<&str>,
    ) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE procedure_values SET value = ?1, unit = ?2
                 WHERE procedure_id = ?3 AND parameter_id = ?4",
                params![value, unit, procedure_id, parameter_id],
            )
            .context("Failed to update procedure value")?;
        if affected == 0 {
            return Err(TrackerError::not_found("Value of parameter", parameter_id).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shopfloor::db::{NewProcessChain, NewProcessStep, NewStateMachine, NewWorkstation};
    use chrono::Duration;

    struct Fixture {
        db: TrackerDb,
        priority: Priority,
        chain: ProcessChain,
        carrier: Carrier,
        temperature: Parameter,
    }

    fn fixture() -> Result<Fixture> {
        let db = TrackerDb::new_in_memory()?;
        let priority = db.create_priority("Normal", 5)?;
        let work = db.create_state("Work", true)?;
        let transport = db.create_state(TRANSPORT_STATE, false)?;
        let machine = db.create_state_machine(&NewStateMachine {
            name: "Standard".into(),
            states: vec![work.id, transport.id],
        })?;
        let ws = db.create_workstation(&NewWorkstation {
            name: "Furnace".into(),
            position: "Hall A".into(),
            broken: false,
            active: true,
            users: vec![],
        })?;
        let temperature = db.create_parameter("Temperature")?;
        let step = db.create_process_step(&NewProcessStep {
            name: "Anneal".into(),
            est_duration: 45,
            state_machine: machine.id,
            workstation: ws.id,
            preparation: None,
            output: None,
            parameters: vec![temperature.id],
            creates: false,
            modifies: true,
            deletes: false,
        })?;
        let chain = db.create_process_chain(&NewProcessChain {
            name: "Heat".into(),
            steps: vec![step.id],
        })?;
        let glas = db.create_carrier_type("Glas")?;
        let stock = db.create_stock(STOCK_POSITION)?;
        let carrier = db.create_carrier("C-01", glas.id, stock.id)?;
        Ok(Fixture {
            db,
            priority,
            chain,
            carrier,
            temperature,
        })
    }

    fn new_assembly(f: &Fixture, id: &str) -> NewAssembly {
        NewAssembly {
            assembly_id: id.into(),
            alloy: "AlSi10Mg".into(),
            sample_count: 3,
            position_at_carrier: Some("A1".into()),
            comment: None,
            carriers: vec![f.carrier.id],
        }
    }

    #[test]
    fn test_assembly_crud() -> Result<()> {
        let f = fixture()?;
        let assembly = f.db.create_assembly(&new_assembly(&f, "A01.1.1"))?;
        assert_eq!(assembly.carriers.len(), 1);
        assert_eq!(assembly.carriers[0].carrier_id, "C-01");

        let mut changed = new_assembly(&f, "A01.1.2");
        changed.carriers.clear();
        let updated = f.db.update_assembly(assembly.id, &changed)?;
        assert_eq!(updated.assembly_id, "A01.1.2");
        assert!(updated.carriers.is_empty());
        assert!(f.db.delete_assembly(assembly.id)?);
        Ok(())
    }

    #[test]
    fn test_create_job_builds_procedures() -> Result<()> {
        let f = fixture()?;
        let assembly = f.db.create_assembly(&new_assembly(&f, "A01.1.1"))?;
        let job = f.db.create_job(
            &NewJob {
                name: "Job 1".into(),
                priority: f.priority.id,
                process_chain: f.chain.id,
                assemblies: vec![assembly.id],
            },
            Utc::now(),
        )?;
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.process_chain.name, "Heat");
        assert_eq!(job.procedures.len(), 1);
        let values = &job.procedures[0].values;
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].parameter.id, f.temperature.id);
        assert!(values[0].value.is_none());

        // Assembly belongs to an active job now.
        assert!(f.db.delete_assembly(assembly.id).is_err());
        let err = f
            .db
            .create_job(
                &NewJob {
                    name: "Job 2".into(),
                    priority: f.priority.id,
                    process_chain: f.chain.id,
                    assemblies: vec![assembly.id],
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(
            TrackerError::find(&err),
            Some(TrackerError::InUse { .. })
        ));
        assert_eq!(f.db.job_for_procedure(job.procedures[0].id)?, Some(job.id));
        Ok(())
    }

    #[test]
    fn test_save_job_progress_round_trip() -> Result<()> {
        let f = fixture()?;
        let assembly = f.db.create_assembly(&new_assembly(&f, "A01.1.1"))?;
        let mut job = f.db.create_job(
            &NewJob {
                name: "Job 1".into(),
                priority: f.priority.id,
                process_chain: f.chain.id,
                assemblies: vec![assembly.id],
            },
            Utc::now(),
        )?;
        let now = Utc::now();
        job.state = JobState::Processing;
        job.start_next_procedure(now)?;
        let pid = job.procedures[0].id;
        job.exec_procedure(pid, Uuid::new_v4(), now)?;
        // Unknown trigger users must not break the foreign key.
        job.procedures[0].history.execs[0].trigger = None;
        let outcome = job.finish_procedure(pid, 0, None, now + Duration::minutes(5))?;
        assert_eq!(outcome.modified_assemblies, vec![assembly.id]);
        f.db.save_job_progress(&job)?;

        let loaded = f.db.get_job(job.id)?.expect("job");
        assert_eq!(loaded.state, JobState::Processing);
        let execs = &loaded.procedures[0].history.execs;
        assert_eq!(execs.len(), 2);
        assert_eq!(execs[0].transition_time, 5);
        assert_eq!(execs[1].state.name, TRANSPORT_STATE);
        assert_eq!(loaded.assemblies[0].modifications, vec![pid]);
        assert!(loaded.procedures[0].needs_collection());

        // Saving again updates rows in place.
        f.db.save_job_progress(&loaded)?;
        assert_eq!(f.db.get_job(job.id)?.expect("job"), loaded);
        assert_eq!(f.db.list_jobs_in_state(JobState::Processing)?.len(), 1);
        assert!(f.db.delete_job(job.id).is_err());
        Ok(())
    }

    #[test]
    fn test_update_only_while_pending() -> Result<()> {
        let f = fixture()?;
        let new_job = NewJob {
            name: "Job 1".into(),
            priority: f.priority.id,
            process_chain: f.chain.id,
            assemblies: vec![],
        };
        let job = f.db.create_job(&new_job, Utc::now())?;
        let renamed = f.db.update_job(
            job.id,
            &NewJob {
                name: "Job 1b".into(),
                ..new_job.clone()
            },
        )?;
        assert_eq!(renamed.name, "Job 1b");
        assert_eq!(renamed.procedures[0].id, job.procedures[0].id);

        let mut started = renamed.clone();
        started.state = JobState::Cancelled;
        f.db.save_job_progress(&started)?;
        assert!(f.db.update_job(job.id, &new_job).is_err());
        assert!(f.db.delete_job(job.id)?);
        Ok(())
    }

    #[test]
    fn test_procedure_values() -> Result<()> {
        let f = fixture()?;
        let job = f.db.create_job(
            &NewJob {
                name: "Job 1".into(),
                priority: f.priority.id,
                process_chain: f.chain.id,
                assemblies: vec![],
            },
            Utc::now(),
        )?;
        let pid = job.procedures[0].id;
        f.db.set_procedure_value(pid, f.temperature.id, Some("450"), Some("°C"))?;
        let loaded = f.db.get_job(job.id)?.expect("job");
        assert_eq!(loaded.procedures[0].values[0].value.as_deref(), Some("450"));
        assert_eq!(loaded.procedures[0].values[0].unit.as_deref(), Some("°C"));
        assert!(
            f.db.set_procedure_value(pid, Uuid::new_v4(), Some("1"), None)
                .is_err()
        );
        Ok(())
    }
}
