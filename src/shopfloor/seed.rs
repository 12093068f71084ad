//! Default and demo data.
//!
//! `seed_defaults` runs on every start and only adds what is missing.
//! `seed_demo` fills an empty shop floor with a small working setup.

use anyhow::{Context, Result};
use chrono::Utc;
use fabtrack_common::*;
use tracing::{debug, info};
use uuid::Uuid;

use super::auth;
use super::db::{
    NewAssembly, NewJob, NewProcessChain, NewProcessStep, NewStateMachine, NewUser, NewWorkstation,
    TrackerDb,
};
use super::workflow::OLD_ACTIVE_JOB_KEY;

pub const ADMIN_USERNAME: &str = "admin";
pub const DEFAULT_CARRIER_TYPES: [&str; 3] = ["Glas", "Steckbrett", "Schale"];
pub const DEFAULT_OLD_ACTIVE_JOB_MINUTES: i64 = 4786;
/// Password of every demo account.
pub const DEMO_PASSWORD: &str = "Demo1234";

/// Character-class flags of a simple pattern, in the order
/// lower, upper, digits, special, dot, underscore, dash, space, slash, backslash.
type Flags = [bool; 10];

const NAME_LIKE: Flags = [true, true, true, true, true, true, true, true, false, false];

fn simple(name: &str, flags: Flags, min_length: u32, max_length: u32) -> ValidationPattern {
    let [lower, upper, digits, special, dot, underscore, dash, space, slash, backslash] = flags;
    ValidationPattern {
        name: name.into(),
        lower,
        upper,
        digits,
        special,
        dot,
        underscore,
        dash,
        space,
        slash,
        backslash,
        min_length,
        max_length,
        ..Default::default()
    }
}

fn advanced(name: &str, pattern: &str) -> ValidationPattern {
    ValidationPattern {
        name: name.into(),
        pattern: pattern.into(),
        advanced: true,
        ..Default::default()
    }
}

/// The patterns every installation starts with.
pub fn default_patterns() -> Vec<ValidationPattern> {
    vec![
        simple("CarrierType", NAME_LIKE, 1, 30),
        simple(
            "Id",
            [false, false, true, false, true, false, false, false, false, false],
            1,
            30,
        ),
        simple(
            "CarrierId",
            [true, true, true, false, true, true, true, true, false, false],
            1,
            15,
        ),
        simple("JobName", NAME_LIKE, 1, 40),
        simple("StateName", NAME_LIKE, 1, 40),
        simple("StateMachineName", NAME_LIKE, 1, 40),
        simple("WorkstationName", NAME_LIKE, 1, 40),
        simple(
            "Username",
            [true, true, true, false, true, true, true, false, false, false],
            3,
            20,
        ),
        simple("ProcessStepName", NAME_LIKE, 1, 40),
        simple("ProcessChainName", NAME_LIKE, 1, 40),
        simple(
            "Name",
            [true, true, false, true, false, false, true, true, false, false],
            1,
            40,
        ),
        advanced("Email", r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,6}$"),
        // Checked in code; the stored expression is informational.
        advanced("Password", r"^(?=.*[0-9])(?=.*[a-z])(?=.*[A-Z])(?=\S+$).{8,}$"),
        simple("AssemblyAlloy", NAME_LIKE, 1, 40),
        simple(
            "AssemblyComment",
            [true, true, true, true, true, true, true, true, true, true],
            1,
            255,
        ),
        advanced("AssemblyId", r"^[A-Z][0-9][0-9].[0-9]+(.[0-9]+)+$"),
        simple("Position", NAME_LIKE, 1, 40),
        simple(
            "ParameterField",
            [true, true, true, true, true, true, true, false, true, true],
            1,
            40,
        ),
        simple(
            "PriorityName",
            [true, true, false, true, false, true, true, true, false, false],
            1,
            20,
        ),
        simple(
            "Value",
            [true, true, true, true, true, true, true, true, true, true],
            1,
            40,
        ),
        advanced("Integer", r"^[0-9]+$"),
        simple(
            "Unit",
            [true, true, true, true, true, true, true, false, true, true],
            1,
            40,
        ),
    ]
}

/// Stores every default pattern that does not exist yet. Edited patterns are
/// left alone.
pub fn seed_patterns(db: &TrackerDb) -> Result<usize> {
    let mut created = 0;
    for pattern in default_patterns() {
        if db.get_pattern(&pattern.name)?.is_none() {
            db.upsert_pattern(&pattern)?;
            debug!(pattern = %pattern.name, "created validation pattern");
            created += 1;
        }
    }
    Ok(created)
}

/// Login of the administrator created on first start.
#[derive(Debug, Clone)]
pub struct AdminAccount {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl AdminAccount {
    pub fn with_password(password: &str) -> Self {
        Self {
            username: ADMIN_USERNAME.into(),
            email: "admin@example.com".into(),
            password: password.into(),
        }
    }
}

/// Default data with the stock `admin` account.
pub fn seed_defaults(db: &TrackerDb, admin_password: &str) -> Result<()> {
    seed_defaults_for(db, &AdminAccount::with_password(admin_password))
}

pub fn seed_defaults_for(db: &TrackerDb, admin: &AdminAccount) -> Result<()> {
    db.transaction(|db| {
        if db.get_credentials(&admin.username)?.is_none() {
            db.create_user(&NewUser {
                username: admin.username.clone(),
                password_hash: auth::hash_password(&admin.password),
                first_name: "Armin".into(),
                last_name: "Admin".into(),
                email: admin.email.clone(),
                roles: vec![Role::Admin],
                locale: "de".into(),
            })?;
            info!(username = %admin.username, "created default admin user");
        }
        for name in DEFAULT_CARRIER_TYPES {
            if db.get_carrier_type_by_name(name)?.is_none() {
                db.create_carrier_type(name)?;
            }
        }
        if db.list_stocks()?.is_empty() {
            db.create_stock(STOCK_POSITION)?;
            info!(position = STOCK_POSITION, "created default stock");
        }
        if db.get_state_by_name(TRANSPORT_STATE)?.is_none() {
            db.create_state(TRANSPORT_STATE, false)?;
        }
        if db.get_config(OLD_ACTIVE_JOB_KEY)?.is_none() {
            db.set_config(OLD_ACTIVE_JOB_KEY, &DEFAULT_OLD_ACTIVE_JOB_MINUTES.to_string())?;
        }
        let created = seed_patterns(db)?;
        if created > 0 {
            info!(created, "created default validation patterns");
        }
        Ok(())
    })
}

/// Adds demo users, workstations, a process chain and a pending job.
///
/// Does nothing when demo data is already present.
pub fn seed_demo(db: &TrackerDb) -> Result<()> {
    if db.get_credentials("transport")?.is_some() {
        debug!("demo data already present");
        return Ok(());
    }
    db.transaction(|db| {
        let mut technologist = None;
        for role in [Role::Pkp, Role::Logistician, Role::Technologist, Role::Transport] {
            let name = role.as_str();
            let user = db.create_user(&NewUser {
                username: name.into(),
                password_hash: auth::hash_password(DEMO_PASSWORD),
                first_name: "Demo".into(),
                last_name: "Nutzer".into(),
                email: format!("{}@example.com", name),
                roles: vec![role],
                locale: "de".into(),
            })?;
            db.sync_transport(&user)?;
            if role == Role::Technologist {
                technologist = Some(user.id);
            }
        }

        let furnace = db.create_workstation(&NewWorkstation {
            name: "Ofen".into(),
            position: "Halle 1".into(),
            broken: false,
            active: true,
            users: technologist.into_iter().collect(),
        })?;
        let bench = db.create_workstation(&NewWorkstation {
            name: "Werkbank".into(),
            position: "Halle 2".into(),
            broken: false,
            active: true,
            users: technologist.into_iter().collect(),
        })?;

        let prepare = db.create_state("Vorbereitung", false)?;
        let work = db.create_state("Bearbeitung", true)?;
        let transport = db
            .get_state_by_name(TRANSPORT_STATE)?
            .context("transport state missing, seed defaults first")?;
        let machine = db.create_state_machine(&NewStateMachine {
            name: "Standardablauf".into(),
            states: vec![prepare.id, work.id, transport.id],
        })?;

        let temperature = db.create_parameter("Temperatur")?;
        let duration = db.create_parameter("Haltezeit")?;
        let roughness = db.create_parameter("Rauheit")?;

        let step = |name: &str,
                    ws: Uuid,
                    est_duration: i64,
                    parameters: Vec<Uuid>,
                    (creates, modifies, deletes): (bool, bool, bool)| {
            db.create_process_step(&NewProcessStep {
                name: String::from(name),
                est_duration,
                state_machine: machine.id,
                workstation: ws,
                preparation: None,
                output: None,
                parameters,
                creates,
                modifies,
                deletes,
            })
        };
        let cast = step("Urformen", furnace.id, 1000, vec![], (true, false, false))?;
        let anneal = step(
            "Wärmebehandlung",
            furnace.id,
            420,
            vec![temperature.id, duration.id],
            (false, true, false),
        )?;
        let polish = step("Polieren", bench.id, 240, vec![roughness.id], (false, false, false))?;
        let scrap = step("Zerlegen", bench.id, 500, vec![], (false, false, true))?;

        db.create_process_chain(&NewProcessChain {
            name: "Prozesskette C".into(),
            steps: vec![cast.id, anneal.id, scrap.id],
        })?;
        let chain = db.create_process_chain(&NewProcessChain {
            name: "Prozesskette 1".into(),
            steps: vec![anneal.id, polish.id],
        })?;

        let mut normal = None;
        for (name, value) in [("Niedrig", 1), ("Normal", 5), ("Hoch", 10)] {
            let priority = db.create_priority(name, value)?;
            if name == "Normal" {
                normal = Some(priority.id);
            }
        }

        let glas = db
            .get_carrier_type_by_name("Glas")?
            .context("carrier types missing, seed defaults first")?;
        let stock = db
            .default_stock()?
            .context("stock missing, seed defaults first")?;
        let carrier = db.create_carrier("Carrier 01", glas.id, stock.id)?;
        let assembly = db.create_assembly(&NewAssembly {
            assembly_id: "A01.1.100".into(),
            alloy: "AlSi10Mg".into(),
            sample_count: 3,
            position_at_carrier: Some("links".into()),
            comment: None,
            carriers: vec![carrier.id],
        })?;

        db.create_job(
            &NewJob {
                name: "Job 1".into(),
                priority: normal.context("demo priority missing")?,
                process_chain: chain.id,
                assemblies: vec![assembly.id],
            },
            Utc::now(),
        )?;
        info!("created demo data");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shopfloor::validate;

    #[test]
    fn test_default_patterns_are_applicable() {
        let patterns = default_patterns();
        assert!(patterns.iter().any(|p| p.name == validate::PASSWORD_PATTERN));
        for pattern in &patterns {
            assert!(
                validate::check_pattern(pattern).is_ok(),
                "pattern {} should be valid",
                pattern.name
            );
        }
    }

    #[test]
    fn test_seed_defaults_is_idempotent() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        seed_defaults(&db, "Fabtrack1")?;
        seed_defaults(&db, "Other123")?;
        assert_eq!(db.list_users()?.len(), 1);
        assert_eq!(db.list_carrier_types()?.len(), 3);
        assert_eq!(db.list_stocks()?.len(), 1);
        assert_eq!(db.list_states()?.len(), 1);
        assert_eq!(db.get_config(OLD_ACTIVE_JOB_KEY)?.as_deref(), Some("4786"));
        assert_eq!(db.list_patterns()?.len(), default_patterns().len());

        // The first password sticks.
        assert!(auth::login(&db, ADMIN_USERNAME, "Fabtrack1", 5, Utc::now()).is_ok());
        Ok(())
    }

    #[test]
    fn test_seed_patterns_keeps_edits() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        seed_patterns(&db)?;
        let mut unit = db.get_pattern("Unit")?.expect("unit pattern");
        unit.max_length = 5;
        db.upsert_pattern(&unit)?;
        assert_eq!(seed_patterns(&db)?, 0);
        assert_eq!(db.get_pattern("Unit")?.expect("unit pattern").max_length, 5);
        Ok(())
    }

    #[test]
    fn test_demo_data_passes_validation() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        seed_defaults(&db, "Fabtrack1")?;
        seed_demo(&db)?;
        seed_demo(&db)?;

        let jobs = db.list_jobs()?;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::Pending);
        assert!(db.transport_for_user(
            db.get_credentials("transport")?.expect("transporter").0.id
        )?
        .is_some());

        for ws in db.list_workstations()? {
            validate::validate_position(&db, &ws.position)?;
            validate::validate_workstation(
                &db,
                &NewWorkstation {
                    name: ws.name.clone(),
                    position: ws.position.clone(),
                    broken: ws.broken,
                    active: ws.active,
                    users: ws.users.clone(),
                },
            )?;
        }
        for step in db.list_process_steps()? {
            assert!(validate::FieldValidator::new(&db).matches("ProcessStepName", &step.name)?);
        }
        for chain in db.list_process_chains()? {
            chain.check_step_order().map_err(anyhow::Error::msg)?;
        }
        for assembly in db.list_assemblies()? {
            assert!(validate::FieldValidator::new(&db).matches("AssemblyId", &assembly.assembly_id)?);
        }
        for user in db.list_users()? {
            assert!(validate::FieldValidator::new(&db).matches("Username", &user.username)?);
        }
        Ok(())
    }
}
