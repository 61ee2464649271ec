//! The `Runner` trait: the seam between the core scheduling loop and whatever
//! actually issues a request for one operation type.
//!
//! The core ships one concrete implementation, `HttpRunner`, built from the
//! teacher's reqwest client builder; a real deployment registers a runner per
//! `operation_type` the same way an external operation registry would.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::CoreError;
use crate::model::{DependentTiming, OperationRef};

/// What one `Runner::run` call reports back to the executor.
#[derive(Debug, Clone)]
pub struct RunnerOutcome {
    pub service_time: Duration,
    pub client_processing_time: Duration,
    pub total_ops: f64,
    pub total_ops_unit: String,
    pub request_meta_data: HashMap<String, Value>,
    pub dependent_timings: Vec<DependentTiming>,
}

impl RunnerOutcome {
    pub fn simple(service_time: Duration) -> Self {
        Self {
            service_time,
            client_processing_time: Duration::ZERO,
            total_ops: 1.0,
            total_ops_unit: "ops".to_string(),
            request_meta_data: HashMap::new(),
            dependent_timings: Vec::new(),
        }
    }
}

/// Executes one logical request for a task's operation and reports timing.
///
/// Implementations own whatever connection/session state they need across
/// calls (an HTTP client, a DB connection, a gRPC channel) — the executor
/// calls `run` once per scheduled iteration and never inspects the runner's
/// internals.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, operation: &OperationRef, params: &HashMap<String, Value>) -> Result<RunnerOutcome, CoreError>;
}

/// Issues one HTTP request per call, built from the configured base URL,
/// method and body template on `operation.meta_data`.
pub struct HttpRunner {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRunner {
    pub fn new(base_url: impl Into<String>) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CoreError::RunnerFailure(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl Runner for HttpRunner {
    async fn run(&self, operation: &OperationRef, params: &HashMap<String, Value>) -> Result<RunnerOutcome, CoreError> {
        let path = operation
            .meta_data
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or("/");
        let method = operation
            .meta_data
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET");

        let url = format!("{}{}", self.base_url, path);
        let start = Instant::now();
        let mut builder = self.client.request(
            method
                .parse()
                .map_err(|_| CoreError::RunnerFailure(format!("invalid method: {method}")))?,
            &url,
        );
        if let Some(body) = params.get("body") {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CoreError::RunnerFailure(e.to_string()))?;
        let status = response.status();
        let _ = response.bytes().await;
        let elapsed = start.elapsed();

        let mut meta = HashMap::new();
        meta.insert("status-code".to_string(), Value::from(status.as_u16()));

        if !status.is_success() {
            return Err(CoreError::RunnerFailure(format!("http status {status}")));
        }

        Ok(RunnerOutcome {
            service_time: elapsed,
            client_processing_time: Duration::ZERO,
            total_ops: 1.0,
            total_ops_unit: "ops".to_string(),
            request_meta_data: meta,
            dependent_timings: Vec::new(),
        })
    }
}
