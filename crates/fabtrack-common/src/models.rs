use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the state that closes every transport leg of a state machine.
pub const TRANSPORT_STATE: &str = "Transport";

/// Position of the stock location finished and cancelled goods return to.
pub const STOCK_POSITION: &str = "Lager";

// ── Enums ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Process chain planner.
    Pkp,
    Logistician,
    Technologist,
    Admin,
    Transport,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pkp => "pkp",
            Self::Logistician => "logistician",
            Self::Technologist => "technologist",
            Self::Admin => "admin",
            Self::Transport => "transport",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pkp" => Ok(Self::Pkp),
            "logistician" => Ok(Self::Logistician),
            "technologist" => Ok(Self::Technologist),
            "admin" => Ok(Self::Admin),
            "transport" => Ok(Self::Transport),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Finished,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "finished" => Ok(Self::Finished),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job state: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    Stock,
    Workstation,
    Transport,
}

impl LocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stock => "stock",
            Self::Workstation => "workstation",
            Self::Transport => "transport",
        }
    }
}

impl FromStr for LocationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stock" => Ok(Self::Stock),
            "workstation" => Ok(Self::Workstation),
            "transport" => Ok(Self::Transport),
            _ => Err(format!("Invalid location kind: {}", s)),
        }
    }
}

// ── People & lookup tables ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub roles: Vec<Role>,
    pub locale: String,
    pub dark_mode: bool,
    pub pinned_menu: bool,
}

impl User {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// True when the user holds at least one of `roles`.
    pub fn has_any_role(&self, roles: &[Role]) -> bool {
        roles.iter().any(|r| self.has_role(*r))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Priority {
    pub id: Uuid,
    pub name: String,
    pub value: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CarrierType {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Parameter {
    pub id: Uuid,
    pub field: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalConfig {
    pub key: String,
    pub value: String,
}

/// Named rule from which field regexes are built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ValidationPattern {
    pub name: String,
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub lower: bool,
    #[serde(default)]
    pub upper: bool,
    #[serde(default)]
    pub digits: bool,
    #[serde(default)]
    pub special: bool,
    #[serde(default)]
    pub dot: bool,
    #[serde(default)]
    pub underscore: bool,
    #[serde(default)]
    pub dash: bool,
    #[serde(default)]
    pub space: bool,
    #[serde(default)]
    pub slash: bool,
    #[serde(default)]
    pub backslash: bool,
    #[serde(default)]
    pub min_length: u32,
    #[serde(default)]
    pub max_length: u32,
    #[serde(default)]
    pub advanced: bool,
}

// ── Locations ─────────────────────────────────────────────────────────

/// Summary of any location, as seen from a carrier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub id: Uuid,
    pub kind: LocationKind,
    pub position: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stock {
    pub id: Uuid,
    pub position: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transport {
    pub id: Uuid,
    pub position: String,
    pub transporter: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workstation {
    pub id: Uuid,
    pub name: String,
    pub position: String,
    pub broken: bool,
    pub active: bool,
    pub users: Vec<Uuid>,
}

// ── Goods ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Carrier {
    pub id: Uuid,
    pub carrier_id: String,
    pub carrier_type: CarrierType,
    pub location: Location,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assembly {
    pub id: Uuid,
    pub assembly_id: String,
    pub alloy: String,
    pub sample_count: i32,
    pub position_at_carrier: Option<String>,
    pub comment: Option<String>,
    pub carriers: Vec<Carrier>,
    /// Procedures that modified this assembly, oldest first.
    pub modifications: Vec<Uuid>,
}

// ── Process definitions ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct State {
    pub id: Uuid,
    pub name: String,
    pub blocking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateMachine {
    pub id: Uuid,
    pub name: String,
    pub states: Vec<State>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessStep {
    pub id: Uuid,
    pub name: String,
    /// Estimated duration in minutes.
    pub est_duration: i64,
    pub state_machine: StateMachine,
    pub workstation: Workstation,
    pub preparation: Option<CarrierType>,
    pub output: Option<CarrierType>,
    pub parameters: Vec<Parameter>,
    pub creates: bool,
    pub modifies: bool,
    pub deletes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessChain {
    pub id: Uuid,
    pub name: String,
    pub steps: Vec<ProcessStep>,
}

// ── Execution ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateExec {
    pub id: Uuid,
    pub state: State,
    pub trigger: Option<Uuid>,
    pub transition_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Minutes spent in the state, or -1 when it was never started.
    pub transition_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StateHistory {
    pub execs: Vec<StateExec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Value {
    pub id: Uuid,
    pub parameter: Parameter,
    pub value: Option<String>,
    /// Set for cardinal values only.
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Procedure {
    pub id: Uuid,
    pub position: i32,
    pub process_step: ProcessStep,
    pub history: StateHistory,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainRef {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub state: JobState,
    pub priority: Priority,
    pub process_chain: ChainRef,
    pub procedures: Vec<Procedure>,
    pub assemblies: Vec<Assembly>,
    pub created_at: DateTime<Utc>,
}
