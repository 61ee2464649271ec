//! Write-side metrics store interface and an in-memory implementation.
//!
//! Post-processed throughput/latency numbers flow out through this trait;
//! the concrete backing store (a metrics cluster, a file, a time-series DB)
//! is an external collaborator the core doesn't need to know about.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::errors::CoreError;
use crate::model::Sample;

/// A fully-reduced metric ready to be written out: one number per
/// task/name/unit combination, e.g. `("index-append", "throughput", "ops/s")`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub task_name: String,
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub meta_data: HashMap<String, String>,
}

/// One host's point-in-time CPU reading, written by a `ProcfsCpuSampler`
/// (or an equivalent telemetry source) and read back by the redline feedback
/// actor's CPU aggregation query. Keyed by `test_execution_id` so documents
/// from a previous run never leak into the current one's aggregation.
#[derive(Debug, Clone)]
pub struct NodeStatsDoc {
    pub node_name: String,
    pub test_execution_id: String,
    pub process_cpu_percent: f64,
    pub recorded_at: Instant,
}

/// Sink for post-processed samples and derived metrics, plus the read side
/// the redline feedback actor's CPU probe queries.
pub trait MetricsStore: Send + Sync {
    fn store_samples(&self, samples: &[Sample]) -> Result<(), CoreError>;
    fn store_metric(&self, metric: MetricRecord) -> Result<(), CoreError>;
    fn flush(&self) -> Result<(), CoreError>;

    /// Records one node's CPU reading.
    fn put_doc(&self, doc: NodeStatsDoc) -> Result<(), CoreError>;

    /// Groups `node-stats` documents for `test_execution_id` recorded within
    /// `window` of now by `node_name`, averages `process_cpu_percent` per
    /// node, and returns the names of every node whose average exceeds
    /// `max_pct`.
    fn nodes_exceeding_cpu_threshold(
        &self,
        test_execution_id: &str,
        window: Duration,
        max_pct: f64,
    ) -> Result<Vec<String>, CoreError>;
}

/// Process-local `MetricsStore` used by tests and by `main` when no external
/// metrics backend is configured.
#[derive(Default)]
pub struct InMemoryMetricsStore {
    samples: Mutex<Vec<Sample>>,
    metrics: Mutex<Vec<MetricRecord>>,
    node_stats: Mutex<Vec<NodeStatsDoc>>,
}

impl InMemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().unwrap().clone()
    }

    pub fn metrics(&self) -> Vec<MetricRecord> {
        self.metrics.lock().unwrap().clone()
    }
}

impl MetricsStore for InMemoryMetricsStore {
    fn store_samples(&self, samples: &[Sample]) -> Result<(), CoreError> {
        self.samples.lock().unwrap().extend_from_slice(samples);
        Ok(())
    }

    fn store_metric(&self, metric: MetricRecord) -> Result<(), CoreError> {
        self.metrics.lock().unwrap().push(metric);
        Ok(())
    }

    fn flush(&self) -> Result<(), CoreError> {
        Ok(())
    }

    fn put_doc(&self, doc: NodeStatsDoc) -> Result<(), CoreError> {
        self.node_stats.lock().unwrap().push(doc);
        Ok(())
    }

    fn nodes_exceeding_cpu_threshold(
        &self,
        test_execution_id: &str,
        window: Duration,
        max_pct: f64,
    ) -> Result<Vec<String>, CoreError> {
        let now = Instant::now();
        let mut sums: HashMap<&str, (f64, usize)> = HashMap::new();
        let docs = self.node_stats.lock().unwrap();
        for doc in docs.iter() {
            if doc.test_execution_id != test_execution_id {
                continue;
            }
            if now.duration_since(doc.recorded_at) > window {
                continue;
            }
            let entry = sums.entry(doc.node_name.as_str()).or_insert((0.0, 0));
            entry.0 += doc.process_cpu_percent;
            entry.1 += 1;
        }

        let mut exceeding: Vec<String> = sums
            .into_iter()
            .filter_map(|(node, (sum, count))| {
                let mean = sum / count as f64;
                (mean > max_pct).then(|| node.to_string())
            })
            .collect();
        exceeding.sort();
        Ok(exceeding)
    }
}
