//! Loads a declarative `TestProcedure` from a YAML workload file.
//!
//! The procedure format mirrors `TestProcedure`/`ParallelGroup`/`Task`'s own
//! `serde` derives directly — no separate YAML-specific schema layer, since
//! the core's data model is already the wire format here.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::model::TestProcedure;

#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("failed to read workload file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse workload YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("invalid task in workload: {0}")]
    InvalidTask(String),
}

/// Loads and validates a `TestProcedure` from the YAML file at `path`.
///
/// Every task's timing policy is validated up front so a malformed workload
/// fails at startup rather than mid-run.
pub fn load_test_procedure(path: impl AsRef<Path>) -> Result<TestProcedure, WorkloadError> {
    let contents = fs::read_to_string(path)?;
    parse_test_procedure(&contents)
}

/// Parses a `TestProcedure` from an in-memory YAML string (used by tests and
/// by callers that already have the workload contents in hand).
pub fn parse_test_procedure(yaml: &str) -> Result<TestProcedure, WorkloadError> {
    let procedure: TestProcedure = serde_yaml::from_str(yaml)?;

    for group in &procedure.groups {
        for task in &group.tasks {
            task.timing
                .validate()
                .map_err(|e| WorkloadError::InvalidTask(format!("{}: {e}", task.name)))?;
        }
    }

    Ok(procedure)
}
