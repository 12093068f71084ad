//! The shop floor tracker: storage, workflow and the HTTP API.
//!
//! ```text
//! api ──> workflow ──> db (TrackerDb behind DbHandle)
//!  │         │
//!  │         └──> fabtrack_common::workflow (pure state transitions)
//!  └──> auth, validate, values
//! ```

pub mod api;
pub mod auth;
pub mod db;
pub mod seed;
pub mod server;
pub mod validate;
pub mod values;
pub mod workflow;
