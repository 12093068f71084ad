pub mod config;
pub mod errors;
pub mod shopfloor;
pub mod telemetry;
