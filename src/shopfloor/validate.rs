//! Pattern-based field validation.
//!
//! Every named [`ValidationPattern`] resolves to one regex via
//! [`build_regex`]. Entity validators collect all violations and fail with a
//! single [`TrackerError::Validation`].

use anyhow::Result;
use fabtrack_common::*;
use regex::Regex;
use tracing::warn;

use super::db::{
    NewAssembly, NewJob, NewProcessChain, NewProcessStep, NewStateMachine, NewWorkstation,
    TrackerDb, UserUpdate,
};
use crate::errors::TrackerError;

/// Name of the pattern whose check is done in code rather than by regex.
pub const PASSWORD_PATTERN: &str = "Password";

/// Regex source for a pattern.
///
/// A simple pattern becomes a character class built from its flags with the
/// dash kept last, bounded by the length limits. An advanced pattern
/// without a stored expression accepts everything.
pub fn build_regex(pattern: &ValidationPattern) -> String {
    if pattern.pattern.is_empty() && !pattern.advanced {
        let mut class = String::new();
        let parts = [
            (pattern.lower, "a-z"),
            (pattern.upper, "A-Z"),
            (pattern.digits, "0-9"),
            (pattern.special, "äüöÄÜÖß"),
            (pattern.dot, "."),
            (pattern.underscore, "_"),
            (pattern.space, " "),
            (pattern.slash, "/"),
            (pattern.backslash, "\\\\"),
            (pattern.dash, "-"),
        ];
        for (enabled, chars) in parts {
            if enabled {
                class.push_str(chars);
            }
        }
        format!(
            "^[{}]{{{},{}}}$",
            class, pattern.min_length, pattern.max_length
        )
    } else if pattern.pattern.is_empty() {
        ".*".to_string()
    } else {
        pattern.pattern.clone()
    }
}

/// Compiles a pattern so that it has to match the whole value.
fn compile(pattern: &ValidationPattern) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", build_regex(pattern)))
}

/// Rejects patterns that could never be applied.
pub fn check_pattern(pattern: &ValidationPattern) -> Result<(), String> {
    if pattern.name.trim().is_empty() {
        return Err("Pattern name is empty".into());
    }
    if pattern.max_length < pattern.min_length {
        return Err("Max length can't be smaller than min length".into());
    }
    if pattern.name == PASSWORD_PATTERN {
        return Ok(());
    }
    compile(pattern)
        .map(|_| ())
        .map_err(|e| format!("Pattern '{}' is not a valid expression: {}", pattern.name, e))
}

/// At least 8 characters with a digit, a lower- and an uppercase letter and
/// no whitespace.
pub fn check_password(password: &str) -> Result<(), String> {
    let long_enough = password.chars().count() >= 8;
    let digit = password.chars().any(|c| c.is_ascii_digit());
    let lower = password.chars().any(|c| c.is_lowercase());
    let upper = password.chars().any(|c| c.is_uppercase());
    let blank = password.chars().any(char::is_whitespace);
    if long_enough && digit && lower && upper && !blank {
        Ok(())
    } else {
        Err("Password needs at least 8 characters including a digit, a lowercase and an \
             uppercase letter, and no whitespace"
            .into())
    }
}

/// Collects violations for one entity.
pub struct FieldValidator<'a> {
    db: &'a TrackerDb,
    errors: Vec<String>,
}

impl<'a> FieldValidator<'a> {
    pub fn new(db: &'a TrackerDb) -> Self {
        Self {
            db,
            errors: Vec::new(),
        }
    }

    /// Whether `value` satisfies the named pattern. Unknown or broken
    /// patterns accept everything.
    pub fn matches(&self, pattern_name: &str, value: &str) -> Result<bool> {
        let Some(pattern) = self.db.get_pattern(pattern_name)? else {
            warn!(pattern = pattern_name, "validation pattern missing, accepting value");
            return Ok(true);
        };
        match compile(&pattern) {
            Ok(regex) => Ok(regex.is_match(value)),
            Err(e) => {
                warn!(pattern = pattern_name, error = %e, "validation pattern invalid, accepting value");
                Ok(true)
            }
        }
    }

    pub fn field(&mut self, label: &str, pattern_name: &str, value: &str) -> Result<()> {
        if !self.matches(pattern_name, value)? {
            self.errors
                .push(format!("{} '{}' does not match pattern {}", label, value, pattern_name));
        }
        Ok(())
    }

    /// Checks the field only when it is set and not blank.
    pub fn optional(&mut self, label: &str, pattern_name: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(v) if !v.is_empty() => self.field(label, pattern_name, v),
            _ => Ok(()),
        }
    }

    pub fn require(&mut self, ok: bool, message: &str) {
        if !ok {
            self.errors.push(message.to_string());
        }
    }

    pub fn password(&mut self, password: &str) {
        if let Err(e) = check_password(password) {
            self.errors.push(e);
        }
    }

    pub fn finish(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(TrackerError::Validation(self.errors.join("; ")).into())
        }
    }
}

// ── Entity validators ─────────────────────────────────────────────────

pub fn validate_job(db: &TrackerDb, job: &NewJob) -> Result<()> {
    let mut v = FieldValidator::new(db);
    v.field("Job name", "JobName", &job.name)?;
    v.require(!job.priority.is_nil(), "Job needs a priority");
    v.require(!job.process_chain.is_nil(), "Job needs a process chain");
    v.finish()
}

pub fn validate_state(db: &TrackerDb, name: &str) -> Result<()> {
    let mut v = FieldValidator::new(db);
    v.field("State name", "StateName", name)?;
    v.finish()
}

pub fn validate_state_machine(db: &TrackerDb, machine: &NewStateMachine) -> Result<()> {
    let mut v = FieldValidator::new(db);
    v.field("State machine name", "StateMachineName", &machine.name)?;
    v.require(!machine.states.is_empty(), "State machine needs at least one state");
    v.finish()
}

pub fn validate_process_step(db: &TrackerDb, step: &NewProcessStep) -> Result<()> {
    let mut v = FieldValidator::new(db);
    v.field("Process step name", "ProcessStepName", &step.name)?;
    v.require(!step.state_machine.is_nil(), "Process step needs a state machine");
    v.require(!step.workstation.is_nil(), "Process step needs a workstation");
    v.require(step.est_duration >= 0, "Estimated duration can't be negative");
    v.finish()
}

pub fn validate_process_chain(db: &TrackerDb, chain: &NewProcessChain) -> Result<()> {
    let mut v = FieldValidator::new(db);
    v.field("Process chain name", "ProcessChainName", &chain.name)?;
    v.require(!chain.steps.is_empty(), "Process chain needs at least one step");
    v.finish()
}

/// `password` is checked when given, which it must be on create.
pub fn validate_user(db: &TrackerDb, user: &UserUpdate, password: Option<&str>) -> Result<()> {
    let mut v = FieldValidator::new(db);
    v.field("Username", "Username", &user.username)?;
    v.field("E-mail", "Email", &user.email)?;
    v.field("First name", "Name", &user.first_name)?;
    v.field("Last name", "Name", &user.last_name)?;
    v.require(!user.roles.is_empty(), "User needs at least one role");
    if let Some(password) = password {
        v.password(password);
    }
    v.finish()
}

pub fn validate_value(db: &TrackerDb, value: Option<&str>, unit: Option<&str>) -> Result<()> {
    let mut v = FieldValidator::new(db);
    v.optional("Value", "Value", value)?;
    v.optional("Unit", "Unit", unit)?;
    v.finish()
}

pub fn validate_carrier(db: &TrackerDb, carrier_id: &str) -> Result<()> {
    let mut v = FieldValidator::new(db);
    v.field("Carrier id", "CarrierId", carrier_id)?;
    v.finish()
}

pub fn validate_assembly(db: &TrackerDb, assembly: &NewAssembly) -> Result<()> {
    let mut v = FieldValidator::new(db);
    v.field("Assembly id", "AssemblyId", &assembly.assembly_id)?;
    v.field("Alloy", "AssemblyAlloy", &assembly.alloy)?;
    v.optional("Comment", "AssemblyComment", assembly.comment.as_deref())?;
    v.require(!assembly.carriers.is_empty(), "Assembly needs at least one carrier");
    v.require(assembly.sample_count >= 0, "Sample count can't be negative");
    v.finish()
}

pub fn validate_priority(db: &TrackerDb, name: &str) -> Result<()> {
    let mut v = FieldValidator::new(db);
    v.field("Priority name", "PriorityName", name)?;
    v.finish()
}

pub fn validate_position(db: &TrackerDb, position: &str) -> Result<()> {
    let mut v = FieldValidator::new(db);
    v.field("Position", "Position", position)?;
    v.finish()
}

pub fn validate_workstation(db: &TrackerDb, ws: &NewWorkstation) -> Result<()> {
    let mut v = FieldValidator::new(db);
    v.field("Workstation name", "WorkstationName", &ws.name)?;
    v.require(!ws.position.trim().is_empty(), "Workstation needs a position");
    v.optional("Position", "Position", Some(&ws.position))?;
    v.finish()
}

pub fn validate_parameter(db: &TrackerDb, field: &str) -> Result<()> {
    let mut v = FieldValidator::new(db);
    v.field("Parameter", "ParameterField", field)?;
    v.finish()
}

pub fn validate_carrier_type(db: &TrackerDb, name: &str) -> Result<()> {
    let mut v = FieldValidator::new(db);
    v.field("Carrier type", "CarrierType", name)?;
    v.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shopfloor::seed;
    use uuid::Uuid;

    fn seeded() -> Result<TrackerDb> {
        let db = TrackerDb::new_in_memory()?;
        seed::seed_patterns(&db)?;
        Ok(db)
    }

    fn is_validation(err: &anyhow::Error) -> bool {
        matches!(TrackerError::find(err), Some(TrackerError::Validation(_)))
    }

    #[test]
    fn test_build_regex_from_flags() {
        let pattern = ValidationPattern {
            name: "StateMachineName".into(),
            lower: true,
            upper: true,
            digits: true,
            special: true,
            dot: true,
            underscore: true,
            dash: true,
            space: true,
            min_length: 1,
            max_length: 40,
            ..Default::default()
        };
        assert_eq!(build_regex(&pattern), "^[a-zA-Z0-9äüöÄÜÖß._ -]{1,40}$");
    }

    #[test]
    fn test_build_regex_slash_and_backslash() {
        let pattern = ValidationPattern {
            name: "Unit".into(),
            lower: true,
            slash: true,
            backslash: true,
            dash: true,
            min_length: 1,
            max_length: 3,
            ..Default::default()
        };
        let source = build_regex(&pattern);
        assert_eq!(source, "^[a-z/\\\\-]{1,3}$");
        let regex = Regex::new(&source).unwrap();
        assert!(regex.is_match("m/s"));
        assert!(regex.is_match("a\\b"));
        assert!(!regex.is_match("m/s2"));
    }

    #[test]
    fn test_build_regex_advanced() {
        let mut pattern = ValidationPattern {
            name: "Anything".into(),
            advanced: true,
            ..Default::default()
        };
        assert_eq!(build_regex(&pattern), ".*");
        pattern.pattern = "^[0-9]+$".into();
        assert_eq!(build_regex(&pattern), "^[0-9]+$");
    }

    #[test]
    fn test_check_pattern() {
        let mut pattern = ValidationPattern {
            name: "Broken".into(),
            lower: true,
            min_length: 5,
            max_length: 2,
            ..Default::default()
        };
        assert!(check_pattern(&pattern).is_err());
        pattern.max_length = 10;
        assert!(check_pattern(&pattern).is_ok());
        pattern.advanced = true;
        pattern.pattern = "([a-z".into();
        assert!(check_pattern(&pattern).is_err());
    }

    #[test]
    fn test_password_rules() {
        assert!(check_password("Fabtrack1").is_ok());
        assert!(check_password("short1A").is_err());
        assert!(check_password("alllowercase1").is_err());
        assert!(check_password("ALLUPPERCASE1").is_err());
        assert!(check_password("NoDigitsHere").is_err());
        assert!(check_password("With Space1").is_err());
    }

    #[test]
    fn test_missing_pattern_accepts_anything() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let v = FieldValidator::new(&db);
        assert!(v.matches("Unknown", "!!!")?);
        Ok(())
    }

    #[test]
    fn test_advanced_patterns_match_whole_value() -> Result<()> {
        let db = seeded()?;
        let v = FieldValidator::new(&db);
        assert!(v.matches("Email", "erika@example.com")?);
        assert!(!v.matches("Email", "not-an-email")?);
        assert!(v.matches("AssemblyId", "A01.2.3")?);
        assert!(!v.matches("AssemblyId", "a01.2")?);
        assert!(v.matches("Integer", "42")?);
        assert!(!v.matches("Integer", "4 2")?);
        Ok(())
    }

    #[test]
    fn test_validate_user_collects_all_errors() -> Result<()> {
        let db = seeded()?;
        let user = UserUpdate {
            username: "x".into(),
            first_name: "Erika".into(),
            last_name: "Muster".into(),
            email: "broken".into(),
            roles: vec![],
            locale: "de".into(),
            dark_mode: false,
            pinned_menu: false,
        };
        let err = validate_user(&db, &user, Some("weak")).unwrap_err();
        let message = err.to_string();
        assert!(is_validation(&err));
        assert!(message.contains("Username"));
        assert!(message.contains("E-mail"));
        assert!(message.contains("role"));
        assert!(message.contains("Password"));

        let ok = UserUpdate {
            username: "erika".into(),
            email: "erika@example.com".into(),
            roles: vec![Role::Pkp],
            ..user
        };
        validate_user(&db, &ok, Some("Secret123"))?;
        validate_user(&db, &ok, None)?;
        Ok(())
    }

    #[test]
    fn test_validate_assembly() -> Result<()> {
        let db = seeded()?;
        let mut assembly = NewAssembly {
            assembly_id: "A01.1.1".into(),
            alloy: "AlSi10Mg".into(),
            sample_count: 2,
            position_at_carrier: None,
            comment: Some("Handle with care.".into()),
            carriers: vec![Uuid::new_v4()],
        };
        validate_assembly(&db, &assembly)?;
        assembly.carriers.clear();
        assert!(is_validation(&validate_assembly(&db, &assembly).unwrap_err()));
        Ok(())
    }

    #[test]
    fn test_validate_values_and_names() -> Result<()> {
        let db = seeded()?;
        validate_value(&db, Some("450"), Some("mm"))?;
        validate_value(&db, None, None)?;
        assert!(validate_value(&db, Some(&"9".repeat(41)), None).is_err());
        validate_state(&db, "Vorbereitung")?;
        assert!(validate_state(&db, "").is_err());
        validate_priority(&db, "Sehr hoch")?;
        assert!(validate_priority(&db, "Prio 1").is_err());
        validate_carrier(&db, "C-01")?;
        assert!(validate_carrier(&db, "C-0000000000000001").is_err());
        Ok(())
    }

    #[test]
    fn test_validate_workstation_needs_position() -> Result<()> {
        let db = seeded()?;
        let mut ws = NewWorkstation {
            name: "Furnace".into(),
            position: " ".into(),
            broken: false,
            active: true,
            users: vec![],
        };
        assert!(validate_workstation(&db, &ws).is_err());
        ws.position = "Hall A".into();
        validate_workstation(&db, &ws)?;
        Ok(())
    }
}
