//! The `ParameterSource` trait: per-iteration parameter generation for a task.
//!
//! Each scheduled iteration asks its task's `ParameterSource` for the next
//! parameter set before invoking the `Runner`. `CsvParameterSource` adapts
//! the CSV-row-per-client loading model from the crate's data source loader
//! to round-robin per-iteration rows instead of a fixed row-per-client
//! assignment.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ParameterSourceError {
    #[error("failed to read parameter file: {0}")]
    Csv(#[from] csv::Error),

    #[error("failed to open file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parameter file has no data rows")]
    EmptyData,

    #[error("parameter file has no headers")]
    NoHeaders,
}

/// Supplies the next parameter set for a task's next scheduled iteration.
/// `params` is called once per iteration, on whichever client's executor
/// task is running — implementations that aren't naturally `Sync` should
/// guard their internal state with a mutex, as `CsvParameterSource` does.
pub trait ParameterSource: Send + Sync {
    fn params(&self) -> HashMap<String, Value>;
}

/// Always returns the same fixed parameter map.
pub struct FixedParameterSource {
    params: HashMap<String, Value>,
}

impl FixedParameterSource {
    pub fn new(params: HashMap<String, Value>) -> Self {
        Self { params }
    }
}

impl ParameterSource for FixedParameterSource {
    fn params(&self) -> HashMap<String, Value> {
        self.params.clone()
    }
}

pub fn fixed(params: HashMap<String, Value>) -> FixedParameterSource {
    FixedParameterSource::new(params)
}

/// Round-robins rows from a CSV file as JSON-valued parameter maps, shared
/// across every client running the task.
pub struct CsvParameterSource {
    rows: Arc<Vec<HashMap<String, Value>>>,
    cursor: Mutex<usize>,
}

impl CsvParameterSource {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ParameterSourceError> {
        let path_ref = path.as_ref();
        info!(path = ?path_ref, "loading CSV parameter file");
        let file = File::open(path_ref)?;
        Self::from_reader(csv::Reader::from_reader(file))
    }

    pub fn from_string(content: &str) -> Result<Self, ParameterSourceError> {
        Self::from_reader(csv::Reader::from_reader(content.as_bytes()))
    }

    fn from_reader<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Self, ParameterSourceError> {
        let headers = reader.headers()?.iter().map(|h| h.to_string()).collect::<Vec<_>>();
        if headers.is_empty() {
            return Err(ParameterSourceError::NoHeaders);
        }

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result?;
            let mut row = HashMap::new();
            for (i, header) in headers.iter().enumerate() {
                if let Some(value) = record.get(i) {
                    row.insert(header.clone(), Value::String(value.to_string()));
                }
            }
            rows.push(row);
        }

        if rows.is_empty() {
            return Err(ParameterSourceError::EmptyData);
        }

        debug!(rows = rows.len(), columns = headers.len(), "CSV parameter rows loaded");

        Ok(Self {
            rows: Arc::new(rows),
            cursor: Mutex::new(0),
        })
    }
}

impl ParameterSource for CsvParameterSource {
    fn params(&self) -> HashMap<String, Value> {
        let mut cursor = self.cursor.lock().unwrap();
        let row = self.rows[*cursor % self.rows.len()].clone();
        *cursor += 1;
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_source_always_returns_same_params() {
        let mut params = HashMap::new();
        params.insert("q".to_string(), Value::String("match_all".to_string()));
        let source = fixed(params.clone());
        assert_eq!(source.params(), params);
    }

    #[test]
    fn csv_source_round_robins_rows() {
        let csv = "id,name\n1,alice\n2,bob\n";
        let source = CsvParameterSource::from_string(csv).unwrap();
        let first = source.params();
        let second = source.params();
        let third = source.params();
        assert_eq!(first.get("id"), Some(&Value::String("1".into())));
        assert_eq!(second.get("id"), Some(&Value::String("2".into())));
        assert_eq!(third.get("id"), Some(&Value::String("1".into())));
    }

    #[test]
    fn empty_csv_is_rejected() {
        let csv = "id,name\n";
        assert!(matches!(
            CsvParameterSource::from_string(csv),
            Err(ParameterSourceError::EmptyData)
        ));
    }
}
