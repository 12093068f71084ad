//! Parameter value exchange and job protocols.
//!
//! Measured values travel as a JSON array with one entry per procedure:
//!
//! ```json
//! [{"step": "Anneal", "parameters": [{"field": "Temperature", "value": "450", "unit": "K"}]}]
//! ```

use anyhow::Result;
use chrono::{DateTime, Utc};
use fabtrack_common::*;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::db::TrackerDb;
use super::validate;
use crate::errors::TrackerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepValues {
    pub step: String,
    pub parameters: Vec<ParameterValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterValue {
    pub field: String,
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Splits `"450 K"` into value and unit. The last whitespace-separated token
/// becomes the unit; blank input yields no value at all.
pub fn parse_value(raw: &str) -> (Option<String>, Option<String>) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (None, None);
    }
    match trimmed.rsplit_once(char::is_whitespace) {
        Some((value, unit)) => (Some(value.trim_end().to_string()), Some(unit.to_string())),
        None => (Some(trimmed.to_string()), None),
    }
}

pub fn export_values(job: &Job) -> Vec<StepValues> {
    job.procedures
        .iter()
        .map(|p| StepValues {
            step: p.process_step.name.clone(),
            parameters: p
                .values
                .iter()
                .map(|v| ParameterValue {
                    field: v.parameter.field.clone(),
                    value: v.value.clone(),
                    unit: v.unit.clone(),
                })
                .collect(),
        })
        .collect()
}

/// Replaces the values of every procedure named in `data`.
///
/// Values of a listed procedure that `data` leaves out are cleared. Returns
/// the number of values written.
pub fn import_values(db: &TrackerDb, job: &Job, data: &[StepValues]) -> Result<usize> {
    db.transaction(|db| {
        let mut written = 0;
        for entry in data {
            let procedure = job
                .procedures
                .iter()
                .find(|p| p.process_step.name == entry.step)
                .ok_or_else(|| {
                    TrackerError::Validation(format!("No procedure found for step '{}'", entry.step))
                })?;
            for value in &procedure.values {
                db.set_procedure_value(procedure.id, value.parameter.id, None, None)?;
            }
            for param in &entry.parameters {
                let target = procedure
                    .values
                    .iter()
                    .find(|v| v.parameter.field == param.field)
                    .ok_or_else(|| {
                        TrackerError::Validation(format!(
                            "Parameter '{}' not found for step '{}'",
                            param.field, entry.step
                        ))
                    })?;
                let (value, unit) = match (&param.value, &param.unit) {
                    (Some(v), Some(u)) => (Some(v.clone()), Some(u.clone())),
                    (Some(v), None) => parse_value(v),
                    (None, unit) => (None, unit.clone()),
                };
                validate::validate_value(db, value.as_deref(), unit.as_deref())?;
                db.set_procedure_value(
                    procedure.id,
                    target.parameter.id,
                    value.as_deref(),
                    unit.as_deref(),
                )?;
                written += 1;
            }
        }
        info!(job = %job.id, written, "imported parameter values");
        Ok(written)
    })
}

// ── Protocol ──────────────────────────────────────────────────────────

/// Printable record of a job's route through the shop floor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Protocol {
    pub job: String,
    pub state: JobState,
    pub priority: String,
    pub process_chain: String,
    pub created_at: DateTime<Utc>,
    pub assemblies: Vec<String>,
    pub progress: Progress,
    pub procedures: Vec<ProtocolStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolStep {
    pub position: i32,
    pub step: String,
    pub workstation: String,
    pub states: Vec<ProtocolState>,
    pub values: Vec<ParameterValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolState {
    pub state: String,
    pub triggered_by: Option<String>,
    pub transition_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transition_time: i64,
}

pub fn build_protocol(db: &TrackerDb, job: &Job) -> Result<Protocol> {
    let username = |id: Option<Uuid>| -> Result<Option<String>> {
        match id {
            Some(id) => Ok(db.get_user(id)?.map(|u| u.username)),
            None => Ok(None),
        }
    };
    let exported = export_values(job);
    let mut procedures = Vec::with_capacity(job.procedures.len());
    for (procedure, values) in job.procedures.iter().zip(exported) {
        let states = procedure
            .history
            .execs
            .iter()
            .map(|e| {
                Ok(ProtocolState {
                    state: e.state.name.clone(),
                    triggered_by: username(e.trigger)?,
                    transition_at: e.transition_at,
                    started_at: e.started_at,
                    finished_at: e.finished_at,
                    transition_time: e.transition_time,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        procedures.push(ProtocolStep {
            position: procedure.position,
            step: procedure.process_step.name.clone(),
            workstation: procedure.process_step.workstation.name.clone(),
            states,
            values: values.parameters,
        });
    }
    Ok(Protocol {
        job: job.name.clone(),
        state: job.state,
        priority: job.priority.name.clone(),
        process_chain: job.process_chain.name.clone(),
        created_at: job.created_at,
        assemblies: job.assemblies.iter().map(|a| a.assembly_id.clone()).collect(),
        progress: job.progress(),
        procedures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shopfloor::seed;

    #[test]
    fn test_parse_value_splits_unit() {
        assert_eq!(
            parse_value("450 K"),
            (Some("450".into()), Some("K".into()))
        );
        assert_eq!(
            parse_value("  1 200  mm "),
            (Some("1 200".into()), Some("mm".into()))
        );
        assert_eq!(parse_value("42"), (Some("42".into()), None));
        assert_eq!(parse_value("   "), (None, None));
    }

    #[test]
    fn test_export_then_import_values() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        seed::seed_defaults(&db, "Fabtrack1")?;
        seed::seed_demo(&db)?;
        let job = db
            .list_jobs()?
            .into_iter()
            .next()
            .expect("demo job");
        let with_params = job
            .procedures
            .iter()
            .find(|p| !p.values.is_empty())
            .expect("procedure with parameters");
        let step = with_params.process_step.name.clone();
        let field = with_params.values[0].parameter.field.clone();

        let written = import_values(
            &db,
            &job,
            &[StepValues {
                step: step.clone(),
                parameters: vec![ParameterValue {
                    field: field.clone(),
                    value: Some("450 K".into()),
                    unit: None,
                }],
            }],
        )?;
        assert_eq!(written, 1);

        let reloaded = db.get_job(job.id)?.expect("job");
        let exported = export_values(&reloaded);
        let entry = exported.iter().find(|e| e.step == step).expect("entry");
        let value = entry
            .parameters
            .iter()
            .find(|p| p.field == field)
            .expect("value");
        assert_eq!(value.value.as_deref(), Some("450"));
        assert_eq!(value.unit.as_deref(), Some("K"));

        let json = serde_json::to_value(&exported)?;
        assert!(json[0]["parameters"].is_array());
        Ok(())
    }

    #[test]
    fn test_import_rejects_unknown_step_and_field() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        seed::seed_defaults(&db, "Fabtrack1")?;
        seed::seed_demo(&db)?;
        let job = db.list_jobs()?.into_iter().next().expect("demo job");

        let unknown_step = import_values(
            &db,
            &job,
            &[StepValues {
                step: "Nope".into(),
                parameters: vec![],
            }],
        )
        .unwrap_err();
        assert!(matches!(
            TrackerError::find(&unknown_step),
            Some(TrackerError::Validation(_))
        ));

        let step = job.procedures[0].process_step.name.clone();
        let unknown_field = import_values(
            &db,
            &job,
            &[StepValues {
                step,
                parameters: vec![ParameterValue {
                    field: "Nope".into(),
                    value: Some("1".into()),
                    unit: None,
                }],
            }],
        );
        assert!(unknown_field.is_err());
        Ok(())
    }

    #[test]
    fn test_protocol_lists_every_procedure() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        seed::seed_defaults(&db, "Fabtrack1")?;
        seed::seed_demo(&db)?;
        let job = db.list_jobs()?.into_iter().next().expect("demo job");
        let protocol = build_protocol(&db, &job)?;
        assert_eq!(protocol.job, job.name);
        assert_eq!(protocol.procedures.len(), job.procedures.len());
        assert!(protocol.procedures.iter().all(|p| p.states.is_empty()));
        assert_eq!(protocol.progress.current, 0);
        Ok(())
    }
}
