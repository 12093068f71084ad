use anyhow::{Context, Result};
use fabtrack_common::*;
use rusqlite::params;
use serde::Deserialize;
use uuid::Uuid;

use super::TrackerDb;
use crate::errors::TrackerError;

#[derive(Debug, Clone, Deserialize)]
pub struct NewStateMachine {
    pub name: String,
    /// State ids in execution order.
    pub states: Vec<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProcessStep {
    pub name: String,
    #[serde(default)]
    pub est_duration: i64,
    pub state_machine: Uuid,
    pub workstation: Uuid,
    #[serde(default)]
    pub preparation: Option<Uuid>,
    #[serde(default)]
    pub output: Option<Uuid>,
    #[serde(default)]
    pub parameters: Vec<Uuid>,
    #[serde(default)]
    pub creates: bool,
    #[serde(default)]
    pub modifies: bool,
    #[serde(default)]
    pub deletes: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProcessChain {
    pub name: String,
    /// Step ids in chain order.
    pub steps: Vec<Uuid>,
}

struct StepRow {
    id: Uuid,
    name: String,
    est_duration: i64,
    state_machine_id: Uuid,
    workstation_id: Uuid,
    preparation_id: Option<Uuid>,
    output_id: Option<Uuid>,
    creates: bool,
    modifies: bool,
    deletes: bool,
}

const STEP_COLUMNS: &str = "id, name, est_duration, state_machine_id, workstation_id, \
     preparation_id, output_id, creates, modifies, deletes";

fn step_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepRow> {
    Ok(StepRow {
        id: row.get(0)?,
        name: row.get(1)?,
        est_duration: row.get(2)?,
        state_machine_id: row.get(3)?,
        workstation_id: row.get(4)?,
        preparation_id: row.get(5)?,
        output_id: row.get(6)?,
        creates: row.get(7)?,
        modifies: row.get(8)?,
        deletes: row.get(9)?,
    })
}

fn state_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<State> {
    Ok(State {
        id: row.get(0)?,
        name: row.get(1)?,
        blocking: row.get(2)?,
    })
}

impl TrackerDb {
    // ── States ────────────────────────────────────────────────────────

    pub fn create_state(&self, name: &str, blocking: bool) -> Result<State> {
        if self.taken("states", "name", name, None)? {
            return Err(TrackerError::already_exists("State", name).into());
        }
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO states (id, name, blocking) VALUES (?1, ?2, ?3)",
                params![id, name, blocking],
            )
            .context("Failed to insert state")?;
        self.get_state(id)?.context("State not found after insert")
    }

    pub fn list_states(&self) -> Result<Vec<State>> {
        self.query_rows(
            "SELECT id, name, blocking FROM states ORDER BY name",
            [],
            "states",
            state_row,
        )
    }

    pub fn get_state(&self, id: Uuid) -> Result<Option<State>> {
        self.query_one(
            "SELECT id, name, blocking FROM states WHERE id = ?1",
            [id],
            "state",
            state_row,
        )
    }

    pub fn get_state_by_name(&self, name: &str) -> Result<Option<State>> {
        self.query_one(
            "SELECT id, name, blocking FROM states WHERE name = ?1",
            [name],
            "state by name",
            state_row,
        )
    }

    pub fn update_state(&self, id: Uuid, name: &str, blocking: bool) -> Result<State> {
        let Some(existing) = self.get_state(id)? else {
            return Err(TrackerError::not_found("State", id).into());
        };
        if existing.name == TRANSPORT_STATE && name != TRANSPORT_STATE {
            return Err(TrackerError::Validation(format!(
                "State '{}' can't be renamed",
                TRANSPORT_STATE
            ))
            .into());
        }
        if self.taken("states", "name", name, Some(id))? {
            return Err(TrackerError::already_exists("State", name).into());
        }
        self.conn
            .execute(
                "UPDATE states SET name = ?1, blocking = ?2 WHERE id = ?3",
                params![name, blocking, id],
            )
            .context("Failed to update state")?;
        self.get_state(id)?.context("State not found after update")
    }

    pub fn delete_state(&self, id: Uuid) -> Result<bool> {
        let used = self.count(
            "SELECT (SELECT COUNT(*) FROM state_machine_states WHERE state_id = ?1)
                  + (SELECT COUNT(*) FROM state_execs WHERE state_id = ?1)",
            id,
            "state references",
        )?;
        if used > 0 {
            return Err(TrackerError::in_use("state", "it is used by a state machine").into());
        }
        self.delete_by_id("states", id)
    }

    // ── State machines ────────────────────────────────────────────────

    pub fn create_state_machine(&self, machine: &NewStateMachine) -> Result<StateMachine> {
        if self.taken("state_machines", "name", &machine.name, None)? {
            return Err(TrackerError::already_exists("State machine", &machine.name).into());
        }
        let id = Uuid::new_v4();
        self.transaction(|db| {
            db.conn
                .execute(
                    "INSERT INTO state_machines (id, name) VALUES (?1, ?2)",
                    params![id, machine.name],
                )
                .context("Failed to insert state machine")?;
            db.replace_machine_states(id, &machine.states)
        })?;
        self.get_state_machine(id)?
            .context("State machine not found after insert")
    }

    fn replace_machine_states(&self, id: Uuid, states: &[Uuid]) -> Result<()> {
        if states.is_empty() {
            return Err(TrackerError::Validation("State machine has no states".into()).into());
        }
        self.conn
            .execute("DELETE FROM state_machine_states WHERE machine_id = ?1", [id])
            .context("Failed to clear state machine states")?;
        for (position, state) in states.iter().enumerate() {
            if self.get_state(*state)?.is_none() {
                return Err(TrackerError::not_found("State", state).into());
            }
            self.conn
                .execute(
                    "INSERT INTO state_machine_states (machine_id, position, state_id) VALUES (?1, ?2, ?3)",
                    params![id, position as i64, state],
                )
                .context("Failed to insert state machine state")?;
        }
        Ok(())
    }

    pub fn list_state_machines(&self) -> Result<Vec<StateMachine>> {
        let ids = self.query_rows(
            "SELECT id FROM state_machines ORDER BY name",
            [],
            "state machines",
            |row| row.get(0),
        )?;
        ids.into_iter()
            .map(|id| {
                self.get_state_machine(id)?
                    .context("State machine vanished while listing")
            })
            .collect()
    }

    pub fn get_state_machine(&self, id: Uuid) -> Result<Option<StateMachine>> {
        let name: Option<String> = self.query_one(
            "SELECT name FROM state_machines WHERE id = ?1",
            [id],
            "state machine",
            |row| row.get(0),
        )?;
        let Some(name) = name else {
            return Ok(None);
        };
        let states = self.query_rows(
            "SELECT s.id, s.name, s.blocking FROM state_machine_states m
             JOIN states s ON s.id = m.state_id
             WHERE m.machine_id = ?1 ORDER BY m.position",
            [id],
            "state machine states",
            state_row,
        )?;
        Ok(Some(StateMachine { id, name, states }))
    }

    /// Machines referenced by steps of a processing job can't change shape.
    fn machine_running(&self, id: Uuid) -> Result<bool> {
        let running = self.count(
            "SELECT COUNT(*) FROM procedures p
             JOIN process_steps s ON s.id = p.process_step_id
             JOIN jobs j ON j.id = p.job_id
             WHERE s.state_machine_id = ?1 AND j.state = 'processing'",
            id,
            "running procedures",
        )?;
        Ok(running > 0)
    }

    pub fn update_state_machine(&self, id: Uuid, machine: &NewStateMachine) -> Result<StateMachine> {
        if self.get_state_machine(id)?.is_none() {
            return Err(TrackerError::not_found("State machine", id).into());
        }
        if self.taken("state_machines", "name", &machine.name, Some(id))? {
            return Err(TrackerError::already_exists("State machine", &machine.name).into());
        }
        if self.machine_running(id)? {
            return Err(TrackerError::in_use("state machine", "a processing job uses it").into());
        }
        self.transaction(|db| {
            db.conn
                .execute(
                    "UPDATE state_machines SET name = ?1 WHERE id = ?2",
                    params![machine.name, id],
                )
                .context("Failed to update state machine")?;
            db.replace_machine_states(id, &machine.states)
        })?;
        self.get_state_machine(id)?
            .context("State machine not found after update")
    }

    pub fn delete_state_machine(&self, id: Uuid) -> Result<bool> {
        let used = self.count(
            "SELECT COUNT(*) FROM process_steps WHERE state_machine_id = ?1",
            id,
            "state machine references",
        )?;
        if used > 0 {
            return Err(TrackerError::in_use("state machine", "it is used by a process step").into());
        }
        self.delete_by_id("state_machines", id)
    }

    // ── Process steps ─────────────────────────────────────────────────

    fn check_step_refs(&self, step: &NewProcessStep) -> Result<()> {
        if step.creates && step.deletes {
            return Err(TrackerError::Validation(
                "A step can't both create and delete assemblies".into(),
            )
            .into());
        }
        if self.get_state_machine(step.state_machine)?.is_none() {
            return Err(TrackerError::not_found("State machine", step.state_machine).into());
        }
        if self.get_workstation(step.workstation)?.is_none() {
            return Err(TrackerError::not_found("Workstation", step.workstation).into());
        }
        for carrier_type in step.preparation.iter().chain(step.output.iter()) {
            if self.get_carrier_type(*carrier_type)?.is_none() {
                return Err(TrackerError::not_found("Carrier type", carrier_type).into());
            }
        }
        Ok(())
    }

    fn replace_step_parameters(&self, id: Uuid, parameters: &[Uuid]) -> Result<()> {
        self.conn
            .execute("DELETE FROM process_step_parameters WHERE step_id = ?1", [id])
            .context("Failed to clear step parameters")?;
        for (position, parameter) in parameters.iter().enumerate() {
            if self.get_parameter(*parameter)?.is_none() {
                return Err(TrackerError::not_found("Parameter", parameter).into());
            }
            self.conn
                .execute(
                    "INSERT INTO process_step_parameters (step_id, position, parameter_id) VALUES (?1, ?2, ?3)",
                    params![id, position as i64, parameter],
                )
                .context("Failed to insert step parameter")?;
        }
        Ok(())
    }

    pub fn create_process_step(&self, step: &NewProcessStep) -> Result<ProcessStep> {
        if self.taken("process_steps", "name", &step.name, None)? {
            return Err(TrackerError::already_exists("Process step", &step.name).into());
        }
        self.check_step_refs(step)?;
        let id = Uuid::new_v4();
        self.transaction(|db| {
            db.conn
                .execute(
                    "INSERT INTO process_steps (id, name, est_duration, state_machine_id, workstation_id,
                         preparation_id, output_id, creates, modifies, deletes)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        id,
                        step.name,
                        step.est_duration,
                        step.state_machine,
                        step.workstation,
                        step.preparation,
                        step.output,
                        step.creates,
                        step.modifies,
                        step.deletes,
                    ],
                )
                .context("Failed to insert process step")?;
            db.replace_step_parameters(id, &step.parameters)
        })?;
        self.get_process_step(id)?
            .context("Process step not found after insert")
    }

    fn step_from_row(&self, row: StepRow) -> Result<ProcessStep> {
        let parameters = self.query_rows(
            "SELECT p.id, p.field FROM process_step_parameters sp
             JOIN parameters p ON p.id = sp.parameter_id
             WHERE sp.step_id = ?1 ORDER BY sp.position",
            [row.id],
            "step parameters",
            |r| {
                Ok(Parameter {
                    id: r.get(0)?,
                    field: r.get(1)?,
                })
            },
        )?;
        let preparation = match row.preparation_id {
            Some(id) => self.get_carrier_type(id)?,
            None => None,
        };
        let output = match row.output_id {
            Some(id) => self.get_carrier_type(id)?,
            None => None,
        };
        Ok(ProcessStep {
            id: row.id,
            name: row.name,
            est_duration: row.est_duration,
            state_machine: self
                .get_state_machine(row.state_machine_id)?
                .context("State machine of process step missing")?,
            workstation: self
                .get_workstation(row.workstation_id)?
                .context("Workstation of process step missing")?,
            preparation,
            output,
            parameters,
            creates: row.creates,
            modifies: row.modifies,
            deletes: row.deletes,
        })
    }

    pub fn list_process_steps(&self) -> Result<Vec<ProcessStep>> {
        let sql = format!("SELECT {} FROM process_steps ORDER BY name", STEP_COLUMNS);
        let rows = self.query_rows(&sql, [], "process steps", step_row)?;
        rows.into_iter().map(|r| self.step_from_row(r)).collect()
    }

    pub fn get_process_step(&self, id: Uuid) -> Result<Option<ProcessStep>> {
        let sql = format!("SELECT {} FROM process_steps WHERE id = ?1", STEP_COLUMNS);
        self.query_one(&sql, [id], "process step", step_row)?
            .map(|r| self.step_from_row(r))
            .transpose()
    }

    pub fn steps_at_workstation(&self, workstation: Uuid) -> Result<Vec<Uuid>> {
        self.ids(
            "SELECT id FROM process_steps WHERE workstation_id = ?1",
            workstation,
            "steps at workstation",
        )
    }

    /// Processing jobs read their state list through the step.
    fn step_running(&self, id: Uuid) -> Result<bool> {
        let running = self.count(
            "SELECT COUNT(*) FROM procedures p
             JOIN jobs j ON j.id = p.job_id
             WHERE p.process_step_id = ?1 AND j.state = 'processing'",
            id,
            "running procedures",
        )?;
        Ok(running > 0)
    }

    /// Updates a step. Pending jobs running through it get fresh procedures.
    pub fn update_process_step(&self, id: Uuid, step: &NewProcessStep) -> Result<ProcessStep> {
        let Some(existing) = self.get_process_step(id)? else {
            return Err(TrackerError::not_found("Process step", id).into());
        };
        if self.taken("process_steps", "name", &step.name, Some(id))? {
            return Err(TrackerError::already_exists("Process step", &step.name).into());
        }
        self.check_step_refs(step)?;
        if existing.state_machine.id != step.state_machine && self.step_running(id)? {
            return Err(TrackerError::in_use("process step", "a processing job runs it").into());
        }
        self.transaction(|db| {
            db.conn
                .execute(
                    "UPDATE process_steps SET name = ?1, est_duration = ?2, state_machine_id = ?3,
                         workstation_id = ?4, preparation_id = ?5, output_id = ?6, creates = ?7,
                         modifies = ?8, deletes = ?9
                     WHERE id = ?10",
                    params![
                        step.name,
                        step.est_duration,
                        step.state_machine,
                        step.workstation,
                        step.preparation,
                        step.output,
                        step.creates,
                        step.modifies,
                        step.deletes,
                        id,
                    ],
                )
                .context("Failed to update process step")?;
            db.replace_step_parameters(id, &step.parameters)?;
            // Chains holding the step must stay well ordered.
            let chains = db.ids(
                "SELECT DISTINCT chain_id FROM process_chain_steps WHERE step_id = ?1",
                id,
                "chains of step",
            )?;
            for chain in chains {
                if let Some(chain) = db.get_process_chain(chain)? {
                    chain
                        .check_step_order()
                        .map_err(TrackerError::Validation)?;
                    db.refresh_pending_jobs(chain.id)?;
                }
            }
            Ok(())
        })?;
        self.get_process_step(id)?
            .context("Process step not found after update")
    }

    pub fn delete_process_step(&self, id: Uuid) -> Result<bool> {
        let used = self.count(
            "SELECT (SELECT COUNT(*) FROM process_chain_steps WHERE step_id = ?1)
                  + (SELECT COUNT(*) FROM procedures WHERE process_step_id = ?1)",
            id,
            "process step references",
        )?;
        if used > 0 {
            return Err(TrackerError::in_use("process step", "it is used by a process chain").into());
        }
        self.delete_by_id("process_steps", id)
    }

    // ── Process chains ────────────────────────────────────────────────

    fn write_chain_steps(&self, id: Uuid, steps: &[Uuid]) -> Result<()> {
        self.conn
            .execute("DELETE FROM process_chain_steps WHERE chain_id = ?1", [id])
            .context("Failed to clear chain steps")?;
        for (position, step) in steps.iter().enumerate() {
            if self.get_process_step(*step)?.is_none() {
                return Err(TrackerError::not_found("Process step", step).into());
            }
            self.conn
                .execute(
                    "INSERT INTO process_chain_steps (chain_id, position, step_id) VALUES (?1, ?2, ?3)",
                    params![id, position as i64, step],
                )
                .context("Failed to insert chain step")?;
        }
        let chain = self
            .get_process_chain(id)?
            .context("Process chain not found after writing steps")?;
        chain.check_step_order().map_err(TrackerError::Validation)?;
        Ok(())
    }

    pub fn create_process_chain(&self, chain: &NewProcessChain) -> Result<ProcessChain> {
        if self.taken("process_chains", "name", &chain.name, None)? {
            return Err(TrackerError::already_exists("Process chain", &chain.name).into());
        }
        let id = Uuid::new_v4();
        self.transaction(|db| {
            db.conn
                .execute(
                    "INSERT INTO process_chains (id, name) VALUES (?1, ?2)",
                    params![id, chain.name],
                )
                .context("Failed to insert process chain")?;
            db.write_chain_steps(id, &chain.steps)
        })?;
        self.get_process_chain(id)?
            .context("Process chain not found after insert")
    }

    pub fn list_process_chains(&self) -> Result<Vec<ProcessChain>> {
        let ids = self.query_rows(
            "SELECT id FROM process_chains ORDER BY name",
            [],
            "process chains",
            |row| row.get(0),
        )?;
        ids.into_iter()
            .map(|id| {
                self.get_process_chain(id)?
                    .context("Process chain vanished while listing")
            })
            .collect()
    }

    pub fn get_process_chain(&self, id: Uuid) -> Result<Option<ProcessChain>> {
        let name: Option<String> = self.query_one(
            "SELECT name FROM process_chains WHERE id = ?1",
            [id],
            "process chain",
            |row| row.get(0),
        )?;
        let Some(name) = name else {
            return Ok(None);
        };
        let step_ids = self.ids(
            "SELECT step_id FROM process_chain_steps WHERE chain_id = ?1 ORDER BY position",
            id,
            "chain steps",
        )?;
        let steps = step_ids
            .into_iter()
            .map(|s| {
                self.get_process_step(s)?
                    .context("Process step of chain missing")
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(ProcessChain { id, name, steps }))
    }

    /// Updates a chain. Changed steps rebuild the procedures of its pending
    /// jobs and are refused while one of its jobs is processing.
    pub fn update_process_chain(&self, id: Uuid, chain: &NewProcessChain) -> Result<ProcessChain> {
        let Some(existing) = self.get_process_chain(id)? else {
            return Err(TrackerError::not_found("Process chain", id).into());
        };
        if self.taken("process_chains", "name", &chain.name, Some(id))? {
            return Err(TrackerError::already_exists("Process chain", &chain.name).into());
        }
        let steps_changed = !existing.steps.iter().map(|s| s.id).eq(chain.steps.iter().copied());
        if steps_changed {
            let running = self.count(
                "SELECT COUNT(*) FROM jobs WHERE process_chain_id = ?1 AND state = 'processing'",
                id,
                "processing jobs of chain",
            )?;
            if running > 0 {
                return Err(TrackerError::in_use("process chain", "a processing job uses it").into());
            }
        }
        self.transaction(|db| {
            db.conn
                .execute(
                    "UPDATE process_chains SET name = ?1 WHERE id = ?2",
                    params![chain.name, id],
                )
                .context("Failed to update process chain")?;
            db.write_chain_steps(id, &chain.steps)?;
            if steps_changed {
                db.refresh_pending_jobs(id)?;
            }
            Ok(())
        })?;
        self.get_process_chain(id)?
            .context("Process chain not found after update")
    }

    pub fn delete_process_chain(&self, id: Uuid) -> Result<bool> {
        if self.count("SELECT COUNT(*) FROM jobs WHERE process_chain_id = ?1", id, "jobs")? > 0 {
            return Err(TrackerError::in_use("process chain", "it is used by a job").into());
        }
        self.delete_by_id("process_chains", id)
    }
}
