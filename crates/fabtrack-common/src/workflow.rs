//! Linear state progression for procedures and jobs.
//!
//! A procedure walks the ordered state list of its step's state machine. Each
//! visited state leaves one [`StateExec`] in the procedure's history:
//!
//! ```text
//! start_next_state ──> exec ──> finish ──> start_next_state ──> ...
//!  (transition_at)   (started_at) (finished_at)
//! ```
//!
//! The trailing [`TRANSPORT_STATE`] is never executed by a worker. It waits
//! for a transporter to collect the job's carriers, and delivery then opens
//! the first state of the next procedure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::WorkflowError;
use crate::models::*;

pub fn is_transport(state: &State) -> bool {
    state.name == TRANSPORT_STATE
}

// ── State history ─────────────────────────────────────────────────────

impl StateExec {
    pub fn new(state: State, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state,
            trigger: None,
            transition_at: now,
            started_at: None,
            finished_at: None,
            transition_time: 0,
        }
    }

    /// Whole minutes since the exec was started, or -1 when it never was.
    pub fn minutes_since_start(&self, now: DateTime<Utc>) -> i64 {
        match self.started_at {
            Some(started) => (now - started).num_minutes(),
            None => -1,
        }
    }

    fn close(&mut self, transition_time: i64, now: DateTime<Utc>) {
        self.finished_at = Some(now);
        self.transition_time = if transition_time != 0 {
            transition_time
        } else {
            self.minutes_since_start(now)
        };
    }
}

impl StateHistory {
    pub fn current_exec(&self) -> Option<&StateExec> {
        self.execs.last()
    }

    pub fn current_exec_mut(&mut self) -> Option<&mut StateExec> {
        self.execs.last_mut()
    }

    pub fn is_complete(&self) -> bool {
        self.current_exec()
            .is_some_and(|e| e.finished_at.is_some())
    }

    pub fn can_execute(&self) -> bool {
        self.current_exec()
            .is_some_and(|e| e.started_at.is_none() && e.finished_at.is_none())
    }

    pub fn can_finish(&self) -> bool {
        self.current_exec()
            .is_some_and(|e| e.started_at.is_some() && e.finished_at.is_none())
    }
}

// ── Definitions ───────────────────────────────────────────────────────

impl ProcessStep {
    pub fn states(&self) -> &[State] {
        &self.state_machine.states
    }

    /// Whether the state at `index` is the last one a worker executes.
    ///
    /// That is the final state, or the one before a trailing transport state.
    /// A transport state never qualifies.
    pub fn is_last_executable_state(&self, index: usize) -> bool {
        let states = self.states();
        let Some(state) = states.get(index) else {
            return false;
        };
        if is_transport(state) {
            return false;
        }
        let len = states.len();
        index + 1 == len || (index + 2 == len && is_transport(&states[len - 1]))
    }
}

impl ProcessChain {
    pub fn is_creating(&self) -> bool {
        self.steps.first().is_some_and(|s| s.creates)
    }

    pub fn is_deleting(&self) -> bool {
        self.steps.last().is_some_and(|s| s.deletes)
    }

    pub fn is_modifying(&self) -> bool {
        self.steps.iter().any(|s| s.modifies)
    }

    /// Estimated duration of the whole chain in minutes.
    pub fn duration(&self) -> i64 {
        self.steps.iter().map(|s| s.est_duration).sum()
    }

    /// Checks step ordering: a creating step may only open the chain and a
    /// deleting step may only close it.
    pub fn check_step_order(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("Process chain has no steps".into());
        }
        let last = self.steps.len() - 1;
        for (i, step) in self.steps.iter().enumerate() {
            if step.creates && i != 0 {
                return Err(format!(
                    "Creating step '{}' must be the first step",
                    step.name
                ));
            }
            if step.deletes && i != last {
                return Err(format!(
                    "Deleting step '{}' must be the last step",
                    step.name
                ));
            }
        }
        Ok(())
    }
}

// ── Procedure ─────────────────────────────────────────────────────────

impl Procedure {
    pub fn states(&self) -> &[State] {
        self.process_step.states()
    }

    fn current_index(&self) -> Option<usize> {
        self.history.execs.len().checked_sub(1)
    }

    pub fn current_state(&self) -> Option<&State> {
        self.current_index().and_then(|i| self.states().get(i))
    }

    pub fn next_state(&self) -> Option<&State> {
        self.states().get(self.history.execs.len())
    }

    pub fn has_next_state(&self) -> bool {
        self.next_state().is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.states().len() == self.history.execs.len() && self.history.is_complete()
    }

    /// No state was opened yet, so the goods still have to arrive.
    pub fn needs_delivery(&self) -> bool {
        self.history.execs.is_empty()
    }

    /// The open state is the trailing transport state.
    pub fn needs_collection(&self) -> bool {
        self.states().len() == self.history.execs.len()
            && !self.history.is_complete()
            && self.current_state().is_some_and(is_transport)
    }

    pub fn can_execute(&self) -> bool {
        self.history.can_execute() && !self.current_state().is_some_and(is_transport)
    }

    pub fn can_finish(&self) -> bool {
        self.history.can_finish() && !self.current_state().is_some_and(is_transport)
    }

    pub fn in_last_executable_state(&self) -> bool {
        self.current_index()
            .is_some_and(|i| self.process_step.is_last_executable_state(i))
    }

    /// Opens the next state of the machine.
    ///
    /// An unfinished exec of a non-blocking state is closed on the way.
    pub fn start_next_state(&mut self, now: DateTime<Utc>) -> Result<(), WorkflowError> {
        let next = self
            .next_state()
            .cloned()
            .ok_or(WorkflowError::ProcedureFinished)?;
        if self.history.current_exec().is_some_and(|e| !e.state.blocking) {
            self.close_open(now);
        }
        self.history.execs.push(StateExec::new(next, now));
        Ok(())
    }

    /// Closes an unfinished exec, counting it as started when it was opened.
    fn close_open(&mut self, now: DateTime<Utc>) {
        if let Some(exec) = self.history.current_exec_mut()
            && exec.finished_at.is_none()
        {
            exec.started_at.get_or_insert(exec.transition_at);
            exec.close(0, now);
        }
    }

    pub fn exec(&mut self, user: Uuid, now: DateTime<Utc>) -> Result<(), WorkflowError> {
        if self.needs_collection() {
            return Err(WorkflowError::Execution(
                "Procedure is waiting for collection".into(),
            ));
        }
        if !self.can_execute() {
            return Err(WorkflowError::Execution(
                "Current state is not ready for execution".into(),
            ));
        }
        if let Some(exec) = self.history.current_exec_mut() {
            exec.trigger = Some(user);
            exec.started_at = Some(now);
        }
        Ok(())
    }

    fn finish_current(&mut self, transition_time: i64, now: DateTime<Utc>) -> Result<(), WorkflowError> {
        if self.needs_collection() {
            return Err(WorkflowError::Finish(
                "Procedure is waiting for collection".into(),
            ));
        }
        if !self.can_finish() {
            return Err(WorkflowError::Finish(
                "Current state was not started or is already finished".into(),
            ));
        }
        if let Some(exec) = self.history.current_exec_mut() {
            exec.close(transition_time, now);
        }
        Ok(())
    }

    /// Moves straight into the next state and starts it for `user`.
    ///
    /// A transport state is opened but left for collection.
    fn advance(&mut self, user: Uuid, now: DateTime<Utc>) -> Result<(), WorkflowError> {
        self.start_next_state(now)?;
        if let Some(exec) = self.history.current_exec_mut()
            && !is_transport(&exec.state)
        {
            exec.trigger = Some(user);
            exec.started_at = Some(now);
        }
        Ok(())
    }
}

// ── Job ───────────────────────────────────────────────────────────────

/// Side effects of closing the last executable state of a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinishOutcome {
    pub created_assembly: Option<Uuid>,
    pub deleted_assemblies: Vec<Uuid>,
    pub modified_assemblies: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: usize,
    pub remaining: usize,
    pub total: usize,
    pub percent: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum DeliveryTarget {
    Stock,
    Workstation(Uuid),
}

/// Where a delivery sends the job's carriers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub target: DeliveryTarget,
    pub carriers: Vec<Uuid>,
}

impl Job {
    pub fn is_creating(&self) -> bool {
        self.procedures
            .first()
            .is_some_and(|p| p.process_step.creates)
    }

    pub fn is_deleting(&self) -> bool {
        self.procedures
            .last()
            .is_some_and(|p| p.process_step.deletes)
    }

    pub fn current_procedure_index(&self) -> Option<usize> {
        self.procedures.iter().position(|p| !p.is_complete())
    }

    pub fn current_procedure(&self) -> Option<&Procedure> {
        self.current_procedure_index().map(|i| &self.procedures[i])
    }

    pub fn next_procedure(&self) -> Option<&Procedure> {
        self.current_procedure_index()
            .and_then(|i| self.procedures.get(i + 1))
    }

    pub fn has_next_procedure(&self) -> bool {
        self.next_procedure().is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.procedures.iter().all(|p| p.is_complete())
    }

    pub fn current_exec(&self) -> Option<&StateExec> {
        self.current_procedure()
            .and_then(|p| p.history.current_exec())
    }

    pub fn procedure_index(&self, procedure_id: Uuid) -> Option<usize> {
        self.procedures.iter().position(|p| p.id == procedure_id)
    }

    pub fn carriers(&self) -> impl Iterator<Item = &Carrier> {
        self.assemblies.iter().flat_map(|a| a.carriers.iter())
    }

    pub fn carrier_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = Vec::new();
        for carrier in self.carriers() {
            if !ids.contains(&carrier.id) {
                ids.push(carrier.id);
            }
        }
        ids
    }

    fn first_carrier_kind(&self) -> Option<LocationKind> {
        self.carriers().next().map(|c| c.location.kind)
    }

    pub fn on_transport(&self) -> bool {
        self.first_carrier_kind() == Some(LocationKind::Transport)
    }

    /// True when every carrier sits in a stock (vacuously for no carriers).
    pub fn in_stock(&self) -> bool {
        self.carriers()
            .all(|c| c.location.kind == LocationKind::Stock)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), WorkflowError> {
        if !self.is_creating() && self.assemblies.is_empty() {
            return Err(WorkflowError::StartJob(
                "Job has no assemblies and its chain does not create one".into(),
            ));
        }
        if self.state != JobState::Pending {
            return Err(WorkflowError::StartJob(format!(
                "Job is {}, not pending",
                self.state.as_str()
            )));
        }
        self.state = JobState::Processing;
        if self.is_creating() {
            self.start_next_procedure(now)
                .map_err(|e| WorkflowError::StartJob(e.to_string()))?;
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), WorkflowError> {
        match self.state {
            JobState::Processing => {
                self.state = JobState::Cancelled;
                Ok(())
            }
            JobState::Pending => Err(WorkflowError::StopJob("Job is pending.".into())),
            JobState::Finished => Err(WorkflowError::StopJob("Job is already finished.".into())),
            JobState::Cancelled => Err(WorkflowError::StopJob("Job is already cancelled.".into())),
        }
    }

    pub fn start_next_procedure(&mut self, now: DateTime<Utc>) -> Result<(), WorkflowError> {
        let idx = self
            .current_procedure_index()
            .ok_or(WorkflowError::JobComplete)?;
        self.procedures[idx].start_next_state(now)
    }

    fn processing_procedure(
        &self,
        procedure_id: Uuid,
        wrap: fn(String) -> WorkflowError,
    ) -> Result<usize, WorkflowError> {
        if self.state != JobState::Processing {
            return Err(wrap(format!("Job is {}", self.state.as_str())));
        }
        self.procedure_index(procedure_id)
            .ok_or_else(|| wrap("Procedure does not belong to this job".into()))
    }

    pub fn exec_procedure(
        &mut self,
        procedure_id: Uuid,
        user: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        let idx = self.processing_procedure(procedure_id, WorkflowError::Execution)?;
        self.procedures[idx].exec(user, now)
    }

    /// Closes the running state of a procedure and opens the next one.
    ///
    /// Closing the last executable state applies the step's effect on the
    /// job's assemblies. A creating step needs the freshly built
    /// `new_assembly` at that point and rejects it anywhere else.
    pub fn finish_procedure(
        &mut self,
        procedure_id: Uuid,
        transition_time: i64,
        new_assembly: Option<Assembly>,
        now: DateTime<Utc>,
    ) -> Result<FinishOutcome, WorkflowError> {
        let idx = self.processing_procedure(procedure_id, WorkflowError::Finish)?;
        let procedure = &self.procedures[idx];
        let last = procedure.can_finish() && procedure.in_last_executable_state();
        let creates = last && procedure.process_step.creates;

        let mut outcome = FinishOutcome::default();
        match (creates, new_assembly) {
            (true, Some(assembly)) => {
                outcome.created_assembly = Some(assembly.id);
                self.assemblies.push(assembly);
            }
            (true, None) => {
                return Err(WorkflowError::Finish(
                    "Step creates an assembly but none was given".into(),
                ));
            }
            (false, Some(_)) => {
                return Err(WorkflowError::Finish(
                    "Only the last state of a creating step takes an assembly".into(),
                ));
            }
            (false, None) => {}
        }

        self.procedures[idx].finish_current(transition_time, now)?;
        if last {
            self.apply_step_effects(idx, &mut outcome);
        }
        if self.state == JobState::Processing && self.procedures[idx].has_next_state() {
            self.procedures[idx].start_next_state(now)?;
        }
        Ok(outcome)
    }

    /// Opens and starts the next state in one go.
    ///
    /// The running state is closed on the way when it is non-blocking. A
    /// blocking state has to be finished explicitly first.
    pub fn advance_procedure(
        &mut self,
        procedure_id: Uuid,
        user: Uuid,
        now: DateTime<Utc>,
    ) -> Result<FinishOutcome, WorkflowError> {
        let idx = self.processing_procedure(procedure_id, WorkflowError::Execution)?;
        let procedure = &self.procedures[idx];
        if procedure.needs_delivery() {
            return Err(WorkflowError::Execution(
                "Procedure is waiting for delivery".into(),
            ));
        }
        if procedure.needs_collection() {
            return Err(WorkflowError::Execution(
                "Procedure is waiting for collection".into(),
            ));
        }
        let open = procedure
            .history
            .current_exec()
            .filter(|e| e.finished_at.is_none());
        if let Some(exec) = open
            && exec.state.blocking
        {
            return Err(WorkflowError::Execution(format!(
                "State '{}' is blocking and must be finished first",
                exec.state.name
            )));
        }
        if !procedure.has_next_state() {
            return Err(WorkflowError::ProcedureFinished);
        }
        let last = open.is_some() && procedure.in_last_executable_state();
        if last && procedure.process_step.creates {
            return Err(WorkflowError::Execution(
                "Step creates an assembly and must be finished explicitly".into(),
            ));
        }
        let consumes = last && procedure.process_step.deletes;

        let mut outcome = FinishOutcome::default();
        if consumes {
            // The job ends here, so no transport state is opened.
            self.procedures[idx].close_open(now);
        } else {
            self.procedures[idx].advance(user, now)?;
        }
        if last {
            self.apply_step_effects(idx, &mut outcome);
        }
        Ok(outcome)
    }

    fn apply_step_effects(&mut self, idx: usize, outcome: &mut FinishOutcome) {
        let procedure_id = self.procedures[idx].id;
        let step = &self.procedures[idx].process_step;
        if step.deletes {
            outcome.deleted_assemblies = self.assemblies.drain(..).map(|a| a.id).collect();
            self.state = JobState::Finished;
        }
        if step.modifies {
            for assembly in &mut self.assemblies {
                assembly.modifications.push(procedure_id);
                outcome.modified_assemblies.push(assembly.id);
            }
        }
    }

    // ── Progress ──────────────────────────────────────────────────────

    pub fn progress(&self) -> Progress {
        let total = self.procedures.len();
        let current = if self.state == JobState::Finished {
            total
        } else {
            self.current_procedure_index().unwrap_or(total)
        };
        let percent = if self.state == JobState::Finished || total == 0 {
            100
        } else {
            (current * 100 / total) as u32
        };
        Progress {
            current,
            remaining: total - current,
            total,
            percent,
        }
    }

    /// Processing job whose open state has been waiting longer than
    /// `threshold_minutes`.
    pub fn is_old_active(&self, threshold_minutes: i64, now: DateTime<Utc>) -> bool {
        if self.state != JobState::Processing {
            return false;
        }
        match self.current_exec() {
            Some(exec) => {
                let since = exec.started_at.unwrap_or(exec.transition_at);
                (now - since).num_minutes() > threshold_minutes
            }
            None => false,
        }
    }

    // ── Transport ─────────────────────────────────────────────────────

    pub fn needs_collection(&self) -> bool {
        self.state == JobState::Processing
            && self.current_procedure().is_some_and(|p| p.needs_collection())
    }

    pub fn needs_delivery(&self) -> bool {
        self.state == JobState::Processing
            && (self.on_transport() || self.current_procedure().is_some_and(|p| p.needs_delivery()))
    }

    pub fn needs_transport(&self) -> bool {
        self.needs_collection()
            || self.needs_delivery()
            || (self.state == JobState::Cancelled && !self.in_stock())
    }

    /// Position the job's carriers have to be taken to next.
    pub fn next_position(&self) -> String {
        let stock = || STOCK_POSITION.to_string();
        if self.is_complete() || (self.state == JobState::Cancelled && !self.in_stock()) {
            return stock();
        }
        match self.current_procedure() {
            Some(current) if current.needs_delivery() => {
                current.process_step.workstation.position.clone()
            }
            Some(_) => self
                .next_procedure()
                .map(|p| p.process_step.workstation.position.clone())
                .unwrap_or_else(stock),
            None => stock(),
        }
    }

    /// Picks the job's carriers up. Returns the carriers to move onto the
    /// transporter.
    pub fn collect(&mut self, now: DateTime<Utc>) -> Result<Vec<Uuid>, WorkflowError> {
        if self.assemblies.is_empty() {
            return Err(WorkflowError::Collecting("Job has no assemblies".into()));
        }
        if self.on_transport() {
            return Err(WorkflowError::Collecting(
                "Job is already on a transport".into(),
            ));
        }
        if !self.needs_transport() {
            return Err(WorkflowError::Collecting(
                "Job does not need transport".into(),
            ));
        }
        if self.needs_collection()
            && let Some(idx) = self.current_procedure_index()
            && let Some(exec) = self.procedures[idx].history.current_exec_mut()
        {
            exec.started_at.get_or_insert(exec.transition_at);
            exec.close(0, now);
        }
        Ok(self.carrier_ids())
    }

    /// Drops the job's carriers off at their next location.
    ///
    /// A finished or cancelled job goes back to the stock and releases its
    /// assemblies.
    pub fn deliver(&mut self, now: DateTime<Utc>) -> Result<Delivery, WorkflowError> {
        if !self.on_transport() {
            return Err(WorkflowError::Delivering(
                "Job's carriers are not on a transport".into(),
            ));
        }
        if self.state == JobState::Processing {
            match self.current_procedure_index() {
                Some(idx) if self.procedures[idx].needs_delivery() => {
                    self.procedures[idx]
                        .start_next_state(now)
                        .map_err(|e| WorkflowError::Delivering(e.to_string()))?;
                }
                Some(_) => {}
                None => self.state = JobState::Finished,
            }
        }

        let carriers = self.carrier_ids();
        let to_stock = matches!(self.state, JobState::Finished | JobState::Cancelled)
            || self.is_complete();
        let workstation = self
            .current_procedure()
            .filter(|_| !to_stock)
            .map(|p| p.process_step.workstation.id);
        let target = match workstation {
            Some(id) => DeliveryTarget::Workstation(id),
            None => {
                self.assemblies.clear();
                DeliveryTarget::Stock
            }
        };
        Ok(Delivery { target, carriers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn state(name: &str, blocking: bool) -> State {
        State {
            id: Uuid::new_v4(),
            name: name.into(),
            blocking,
        }
    }

    fn workstation(position: &str) -> Workstation {
        Workstation {
            id: Uuid::new_v4(),
            name: format!("WS {}", position),
            position: position.into(),
            broken: false,
            active: true,
            users: vec![],
        }
    }

    fn step(name: &str, states: Vec<State>) -> ProcessStep {
        ProcessStep {
            id: Uuid::new_v4(),
            name: name.into(),
            est_duration: 30,
            state_machine: StateMachine {
                id: Uuid::new_v4(),
                name: format!("{} machine", name),
                states,
            },
            workstation: workstation(&format!("Hall {}", name)),
            preparation: None,
            output: None,
            parameters: vec![],
            creates: false,
            modifies: false,
            deletes: false,
        }
    }

    fn standard_step(name: &str) -> ProcessStep {
        step(
            name,
            vec![
                state("Prepare", true),
                state("Run", true),
                state(TRANSPORT_STATE, false),
            ],
        )
    }

    fn procedure(step: ProcessStep, position: i32) -> Procedure {
        Procedure {
            id: Uuid::new_v4(),
            position,
            process_step: step,
            history: StateHistory::default(),
            values: vec![],
        }
    }

    fn carrier(kind: LocationKind) -> Carrier {
        Carrier {
            id: Uuid::new_v4(),
            carrier_id: "C-1".into(),
            carrier_type: CarrierType {
                id: Uuid::new_v4(),
                name: "Glas".into(),
            },
            location: Location {
                id: Uuid::new_v4(),
                kind,
                position: "somewhere".into(),
            },
        }
    }

    fn assembly(kind: LocationKind) -> Assembly {
        Assembly {
            id: Uuid::new_v4(),
            assembly_id: "A01.1.1".into(),
            alloy: "Steel".into(),
            sample_count: 1,
            position_at_carrier: None,
            comment: None,
            carriers: vec![carrier(kind)],
            modifications: vec![],
        }
    }

    fn job(steps: Vec<ProcessStep>) -> Job {
        Job {
            id: Uuid::new_v4(),
            name: "Job".into(),
            state: JobState::Pending,
            priority: Priority {
                id: Uuid::new_v4(),
                name: "High".into(),
                value: 10,
            },
            process_chain: ChainRef {
                id: Uuid::new_v4(),
                name: "Chain".into(),
            },
            procedures: steps
                .into_iter()
                .enumerate()
                .map(|(i, s)| procedure(s, i as i32))
                .collect(),
            assemblies: vec![assembly(LocationKind::Stock)],
            created_at: Utc::now(),
        }
    }

    fn move_carriers(job: &mut Job, kind: LocationKind) {
        for a in &mut job.assemblies {
            for c in &mut a.carriers {
                c.location.kind = kind;
            }
        }
    }

    /// Runs a procedure's worker states so that only the transport state is left.
    fn work_through(job: &mut Job, idx: usize, user: Uuid, now: DateTime<Utc>) {
        let id = job.procedures[idx].id;
        while !job.procedures[idx].needs_collection() {
            job.exec_procedure(id, user, now).unwrap();
            job.finish_procedure(id, 0, None, now).unwrap();
        }
    }

    #[test]
    fn test_empty_history_predicates_are_false() {
        let history = StateHistory::default();
        assert!(history.current_exec().is_none());
        assert!(!history.is_complete());
        assert!(!history.can_execute());
        assert!(!history.can_finish());
    }

    #[test]
    fn test_procedure_navigation() {
        let now = Utc::now();
        let mut p = procedure(standard_step("Cut"), 0);
        assert!(p.current_state().is_none());
        assert_eq!(p.next_state().unwrap().name, "Prepare");
        assert!(p.needs_delivery());

        p.start_next_state(now).unwrap();
        assert_eq!(p.current_state().unwrap().name, "Prepare");
        assert_eq!(p.next_state().unwrap().name, "Run");
        assert!(p.can_execute());
        assert!(!p.can_finish());
        assert!(!p.needs_delivery());
    }

    #[test]
    fn test_start_next_state_fails_at_end() {
        let now = Utc::now();
        let mut p = procedure(step("One", vec![state("Only", false)]), 0);
        p.start_next_state(now).unwrap();
        assert_eq!(
            p.start_next_state(now),
            Err(WorkflowError::ProcedureFinished)
        );
    }

    #[test]
    fn test_last_executable_state_skips_transport() {
        let s = standard_step("Cut");
        assert!(!s.is_last_executable_state(0));
        assert!(s.is_last_executable_state(1));
        assert!(!s.is_last_executable_state(2));

        let plain = step("Plain", vec![state("A", true), state("B", true)]);
        assert!(plain.is_last_executable_state(1));
        assert!(!plain.is_last_executable_state(0));
        assert!(!plain.is_last_executable_state(5));
    }

    #[test]
    fn test_exec_and_finish_record_timestamps() {
        let t0 = Utc::now();
        let user = Uuid::new_v4();
        let mut j = job(vec![standard_step("Cut")]);
        j.state = JobState::Processing;
        j.start_next_procedure(t0).unwrap();
        let pid = j.procedures[0].id;

        j.exec_procedure(pid, user, t0).unwrap();
        let exec = j.procedures[0].history.current_exec().unwrap();
        assert_eq!(exec.trigger, Some(user));
        assert_eq!(exec.started_at, Some(t0));

        let t1 = t0 + Duration::minutes(42);
        j.finish_procedure(pid, 0, None, t1).unwrap();
        let first = &j.procedures[0].history.execs[0];
        assert_eq!(first.finished_at, Some(t1));
        assert_eq!(first.transition_time, 42);
        assert_eq!(j.procedures[0].current_state().unwrap().name, "Run");
    }

    #[test]
    fn test_finish_uses_explicit_transition_time() {
        let now = Utc::now();
        let mut j = job(vec![standard_step("Cut")]);
        j.state = JobState::Processing;
        j.start_next_procedure(now).unwrap();
        let pid = j.procedures[0].id;
        j.exec_procedure(pid, Uuid::new_v4(), now).unwrap();
        j.finish_procedure(pid, 7, None, now).unwrap();
        assert_eq!(j.procedures[0].history.execs[0].transition_time, 7);
    }

    #[test]
    fn test_exec_twice_is_rejected() {
        let now = Utc::now();
        let mut j = job(vec![standard_step("Cut")]);
        j.state = JobState::Processing;
        j.start_next_procedure(now).unwrap();
        let pid = j.procedures[0].id;
        j.exec_procedure(pid, Uuid::new_v4(), now).unwrap();
        assert!(matches!(
            j.exec_procedure(pid, Uuid::new_v4(), now),
            Err(WorkflowError::Execution(_))
        ));
    }

    #[test]
    fn test_finish_without_exec_is_rejected() {
        let now = Utc::now();
        let mut j = job(vec![standard_step("Cut")]);
        j.state = JobState::Processing;
        j.start_next_procedure(now).unwrap();
        let pid = j.procedures[0].id;
        assert!(matches!(
            j.finish_procedure(pid, 0, None, now),
            Err(WorkflowError::Finish(_))
        ));
    }

    #[test]
    fn test_transport_state_needs_collection() {
        let now = Utc::now();
        let user = Uuid::new_v4();
        let mut j = job(vec![standard_step("Cut")]);
        j.state = JobState::Processing;
        j.start_next_procedure(now).unwrap();
        work_through(&mut j, 0, user, now);

        let p = &j.procedures[0];
        assert!(p.needs_collection());
        assert!(!p.can_execute());
        assert!(!p.is_complete());
        assert!(j.needs_collection());
        let pid = p.id;
        assert!(matches!(
            j.exec_procedure(pid, user, now),
            Err(WorkflowError::Execution(_))
        ));
    }

    #[test]
    fn test_start_requires_assemblies_unless_creating() {
        let now = Utc::now();
        let mut j = job(vec![standard_step("Cut")]);
        j.assemblies.clear();
        assert!(matches!(j.start(now), Err(WorkflowError::StartJob(_))));

        let mut creating = standard_step("Cast");
        creating.creates = true;
        let mut j = job(vec![creating]);
        j.assemblies.clear();
        j.start(now).unwrap();
        assert_eq!(j.state, JobState::Processing);
        assert_eq!(j.procedures[0].history.execs.len(), 1);
    }

    #[test]
    fn test_start_only_from_pending() {
        let now = Utc::now();
        let mut j = job(vec![standard_step("Cut")]);
        j.start(now).unwrap();
        assert_eq!(j.state, JobState::Processing);
        assert!(j.procedures[0].history.execs.is_empty());
        assert!(matches!(j.start(now), Err(WorkflowError::StartJob(_))));
    }

    #[test]
    fn test_stop_messages() {
        let mut j = job(vec![standard_step("Cut")]);
        assert_eq!(
            j.stop(),
            Err(WorkflowError::StopJob("Job is pending.".into()))
        );
        j.state = JobState::Processing;
        j.stop().unwrap();
        assert_eq!(j.state, JobState::Cancelled);
        assert_eq!(
            j.stop(),
            Err(WorkflowError::StopJob("Job is already cancelled.".into()))
        );
        j.state = JobState::Finished;
        assert_eq!(
            j.stop(),
            Err(WorkflowError::StopJob("Job is already finished.".into()))
        );
    }

    #[test]
    fn test_full_route_through_two_steps() {
        let now = Utc::now();
        let user = Uuid::new_v4();
        let mut j = job(vec![standard_step("Cut"), standard_step("Polish")]);
        j.start(now).unwrap();
        assert!(j.needs_delivery());
        assert_eq!(j.next_position(), "Hall Cut");

        // Pick up from stock, bring to the first workstation.
        let moved = j.collect(now).unwrap();
        assert_eq!(moved.len(), 1);
        move_carriers(&mut j, LocationKind::Transport);
        let delivery = j.deliver(now).unwrap();
        assert_eq!(
            delivery.target,
            DeliveryTarget::Workstation(j.procedures[0].process_step.workstation.id)
        );
        move_carriers(&mut j, LocationKind::Workstation);

        work_through(&mut j, 0, user, now);
        assert_eq!(j.next_position(), "Hall Polish");
        j.collect(now).unwrap();
        assert!(j.procedures[0].is_complete());
        assert_eq!(j.current_procedure_index(), Some(1));
        move_carriers(&mut j, LocationKind::Transport);
        assert!(j.needs_delivery());
        j.deliver(now).unwrap();
        move_carriers(&mut j, LocationKind::Workstation);
        assert_eq!(j.progress().current, 1);
        assert_eq!(j.progress().percent, 50);

        work_through(&mut j, 1, user, now);
        assert_eq!(j.next_position(), STOCK_POSITION);
        j.collect(now).unwrap();
        assert!(j.is_complete());
        move_carriers(&mut j, LocationKind::Transport);
        let delivery = j.deliver(now).unwrap();
        assert_eq!(delivery.target, DeliveryTarget::Stock);
        assert_eq!(delivery.carriers.len(), 1);
        assert_eq!(j.state, JobState::Finished);
        assert!(j.assemblies.is_empty());
        assert_eq!(j.progress().percent, 100);
    }

    #[test]
    fn test_deleting_step_finishes_job() {
        let now = Utc::now();
        let user = Uuid::new_v4();
        let mut scrap = standard_step("Scrap");
        scrap.deletes = true;
        let mut j = job(vec![scrap]);
        j.state = JobState::Processing;
        let assembly_id = j.assemblies[0].id;
        j.start_next_procedure(now).unwrap();
        let pid = j.procedures[0].id;

        j.exec_procedure(pid, user, now).unwrap();
        j.finish_procedure(pid, 0, None, now).unwrap();
        j.exec_procedure(pid, user, now).unwrap();
        let outcome = j.finish_procedure(pid, 0, None, now).unwrap();
        assert_eq!(outcome.deleted_assemblies, vec![assembly_id]);
        assert_eq!(j.state, JobState::Finished);
        assert!(j.assemblies.is_empty());
    }

    #[test]
    fn test_modifying_step_records_procedure() {
        let now = Utc::now();
        let user = Uuid::new_v4();
        let mut anneal = standard_step("Anneal");
        anneal.modifies = true;
        let mut j = job(vec![anneal]);
        j.state = JobState::Processing;
        j.start_next_procedure(now).unwrap();
        let pid = j.procedures[0].id;

        work_through(&mut j, 0, user, now);
        assert_eq!(j.assemblies[0].modifications, vec![pid]);
    }

    #[test]
    fn test_creating_step_requires_assembly() {
        let now = Utc::now();
        let user = Uuid::new_v4();
        let mut cast = standard_step("Cast");
        cast.creates = true;
        let mut j = job(vec![cast]);
        j.assemblies.clear();
        j.start(now).unwrap();
        let pid = j.procedures[0].id;

        j.exec_procedure(pid, user, now).unwrap();
        assert!(matches!(
            j.finish_procedure(pid, 0, Some(assembly(LocationKind::Workstation)), now),
            Err(WorkflowError::Finish(_))
        ));
        j.finish_procedure(pid, 0, None, now).unwrap();
        j.exec_procedure(pid, user, now).unwrap();
        assert!(matches!(
            j.finish_procedure(pid, 0, None, now),
            Err(WorkflowError::Finish(_))
        ));
        let new = assembly(LocationKind::Workstation);
        let outcome = j.finish_procedure(pid, 0, Some(new.clone()), now).unwrap();
        assert_eq!(outcome.created_assembly, Some(new.id));
        assert_eq!(j.assemblies.len(), 1);
        assert!(j.needs_collection());
    }

    #[test]
    fn test_advance_closes_non_blocking_state() {
        let t0 = Utc::now();
        let user = Uuid::new_v4();
        let s = step(
            "Check",
            vec![
                state("Look", false),
                state("Measure", true),
                state(TRANSPORT_STATE, false),
            ],
        );
        let mut j = job(vec![s]);
        j.state = JobState::Processing;
        j.start_next_procedure(t0).unwrap();
        let pid = j.procedures[0].id;

        let t1 = t0 + Duration::minutes(5);
        j.advance_procedure(pid, user, t1).unwrap();
        let execs = &j.procedures[0].history.execs;
        assert_eq!(execs[0].finished_at, Some(t1));
        assert_eq!(execs[0].transition_time, 5);
        assert_eq!(execs[1].state.name, "Measure");
        assert_eq!(execs[1].started_at, Some(t1));
        assert_eq!(execs[1].trigger, Some(user));

        // Measure is blocking and still running.
        assert!(matches!(
            j.advance_procedure(pid, user, t1),
            Err(WorkflowError::Execution(_))
        ));
        j.finish_procedure(pid, 0, None, t1).unwrap();
        assert!(j.procedures[0].needs_collection());
        assert!(matches!(
            j.advance_procedure(pid, user, t1),
            Err(WorkflowError::Execution(_))
        ));
    }

    fn quick_step(name: &str) -> ProcessStep {
        step(name, vec![state("Look", false), state(TRANSPORT_STATE, false)])
    }

    #[test]
    fn test_advance_applies_modifying_effects() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::minutes(3);
        let mut inspect = quick_step("Inspect");
        inspect.modifies = true;
        let mut j = job(vec![inspect]);
        j.state = JobState::Processing;
        let assembly_id = j.assemblies[0].id;
        j.start_next_procedure(t0).unwrap();
        let pid = j.procedures[0].id;

        let outcome = j.advance_procedure(pid, Uuid::new_v4(), t1).unwrap();
        assert_eq!(outcome.modified_assemblies, vec![assembly_id]);
        assert_eq!(j.assemblies[0].modifications, vec![pid]);
        let execs = &j.procedures[0].history.execs;
        assert_eq!(execs.len(), 2);
        assert_eq!(execs[0].finished_at, Some(t1));
        assert_eq!(execs[0].transition_time, 3);
        assert!(j.needs_collection());
    }

    #[test]
    fn test_advance_on_deleting_step_ends_job_without_transport() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::minutes(2);
        let mut scrap = quick_step("Scrap");
        scrap.deletes = true;
        let mut j = job(vec![scrap]);
        j.state = JobState::Processing;
        let assembly_id = j.assemblies[0].id;
        j.start_next_procedure(t0).unwrap();
        let pid = j.procedures[0].id;

        let outcome = j.advance_procedure(pid, Uuid::new_v4(), t1).unwrap();
        assert_eq!(outcome.deleted_assemblies, vec![assembly_id]);
        assert_eq!(j.state, JobState::Finished);
        assert!(j.assemblies.is_empty());
        let execs = &j.procedures[0].history.execs;
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].finished_at, Some(t1));
        assert!(!j.needs_collection());
        assert!(!j.needs_transport());
    }

    #[test]
    fn test_advance_refuses_last_state_of_creating_step() {
        let now = Utc::now();
        let mut cast = quick_step("Cast");
        cast.creates = true;
        let mut j = job(vec![cast]);
        j.assemblies.clear();
        j.start(now).unwrap();
        let pid = j.procedures[0].id;

        assert!(matches!(
            j.advance_procedure(pid, Uuid::new_v4(), now),
            Err(WorkflowError::Execution(_))
        ));
        let execs = &j.procedures[0].history.execs;
        assert_eq!(execs.len(), 1);
        assert!(execs[0].finished_at.is_none());
        assert!(j.assemblies.is_empty());
    }

    #[test]
    fn test_advance_rejects_waiting_for_delivery() {
        let now = Utc::now();
        let mut j = job(vec![standard_step("Cut")]);
        j.start(now).unwrap();
        let pid = j.procedures[0].id;
        assert!(matches!(
            j.advance_procedure(pid, Uuid::new_v4(), now),
            Err(WorkflowError::Execution(_))
        ));
    }

    #[test]
    fn test_workflow_rejects_non_processing_job() {
        let now = Utc::now();
        let mut j = job(vec![standard_step("Cut")]);
        let pid = j.procedures[0].id;
        assert!(matches!(
            j.exec_procedure(pid, Uuid::new_v4(), now),
            Err(WorkflowError::Execution(_))
        ));
        j.state = JobState::Processing;
        assert!(matches!(
            j.exec_procedure(Uuid::new_v4(), Uuid::new_v4(), now),
            Err(WorkflowError::Execution(_))
        ));
    }

    #[test]
    fn test_cancelled_job_returns_to_stock() {
        let now = Utc::now();
        let mut j = job(vec![standard_step("Cut"), standard_step("Polish")]);
        j.start(now).unwrap();
        move_carriers(&mut j, LocationKind::Workstation);
        j.stop().unwrap();
        assert!(j.needs_transport());
        assert_eq!(j.next_position(), STOCK_POSITION);

        j.collect(now).unwrap();
        move_carriers(&mut j, LocationKind::Transport);
        let delivery = j.deliver(now).unwrap();
        assert_eq!(delivery.target, DeliveryTarget::Stock);
        assert_eq!(j.state, JobState::Cancelled);
        assert!(j.procedures[0].history.execs.is_empty());
    }

    #[test]
    fn test_collect_and_deliver_guards() {
        let now = Utc::now();
        let mut j = job(vec![standard_step("Cut")]);
        assert!(matches!(j.collect(now), Err(WorkflowError::Collecting(_))));
        assert!(matches!(j.deliver(now), Err(WorkflowError::Delivering(_))));
        j.start(now).unwrap();
        move_carriers(&mut j, LocationKind::Transport);
        assert!(matches!(j.collect(now), Err(WorkflowError::Collecting(_))));
    }

    #[test]
    fn test_old_active_job_threshold() {
        let t0 = Utc::now();
        let mut j = job(vec![standard_step("Cut")]);
        j.state = JobState::Processing;
        j.start_next_procedure(t0).unwrap();
        assert!(!j.is_old_active(60, t0 + Duration::minutes(60)));
        assert!(j.is_old_active(60, t0 + Duration::minutes(61)));

        let pid = j.procedures[0].id;
        let t1 = t0 + Duration::minutes(100);
        j.exec_procedure(pid, Uuid::new_v4(), t1).unwrap();
        assert!(!j.is_old_active(60, t1 + Duration::minutes(30)));
    }

    #[test]
    fn test_progress_counts_completed_procedures() {
        let mut j = job(vec![standard_step("A"), standard_step("B"), standard_step("C")]);
        let p = j.progress();
        assert_eq!((p.current, p.remaining, p.total, p.percent), (0, 3, 3, 0));
        j.state = JobState::Finished;
        let p = j.progress();
        assert_eq!((p.current, p.remaining, p.percent), (3, 0, 100));
    }

    #[test]
    fn test_chain_order_and_flags() {
        let mut create = standard_step("Cast");
        create.creates = true;
        let mut modify = standard_step("Anneal");
        modify.modifies = true;
        modify.est_duration = 45;
        let mut delete = standard_step("Scrap");
        delete.deletes = true;

        let chain = ProcessChain {
            id: Uuid::new_v4(),
            name: "Full".into(),
            steps: vec![create.clone(), modify.clone(), delete.clone()],
        };
        assert!(chain.check_step_order().is_ok());
        assert!(chain.is_creating());
        assert!(chain.is_modifying());
        assert!(chain.is_deleting());
        assert_eq!(chain.duration(), 105);

        let bad = ProcessChain {
            id: Uuid::new_v4(),
            name: "Bad".into(),
            steps: vec![modify.clone(), create],
        };
        assert!(bad.check_step_order().is_err());
        let bad = ProcessChain {
            id: Uuid::new_v4(),
            name: "Bad".into(),
            steps: vec![delete, modify],
        };
        assert!(bad.check_step_order().is_err());
        let empty = ProcessChain {
            id: Uuid::new_v4(),
            name: "Empty".into(),
            steps: vec![],
        };
        assert!(empty.check_step_order().is_err());
    }
}
