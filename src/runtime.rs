//! Runtime glue that wires configs, handler contracts, fatal-error capture,
//! telemetry, and runner orchestration.

pub mod config;
pub mod fatal;
pub mod handler;
pub mod runner;
pub mod telemetry;
