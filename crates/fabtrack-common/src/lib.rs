//! Shared domain types for fabtrack.
//!
//! `models` holds the plain data records exchanged between the storage layer
//! and the HTTP API. `workflow` attaches the linear state progression rules to
//! those records so they can be exercised without a database.

pub mod errors;
pub mod models;
pub mod workflow;

pub use errors::WorkflowError;
pub use models::*;
pub use workflow::{Delivery, DeliveryTarget, FinishOutcome, Progress};
