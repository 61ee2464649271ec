//! Sample post-processor: turns raw samples into `MetricsStore` writes.
//!
//! Ported from the original `DefaultSamplePostprocessor`: every `downsample`-th
//! raw sample contributes its latency/service-time/client-processing-time/
//! processing-time to the store (full sample count would dwarf the store's
//! write capacity on high-RPS tasks), and the full sample set feeds the
//! `ThroughputCalculator` regardless of the downsample factor since
//! throughput is already a reduction.

use std::collections::HashMap;

use tracing::debug;

use crate::errors::CoreError;
use crate::metrics_store::{MetricRecord, MetricsStore};
use crate::model::Sample;
use crate::throughput::ThroughputCalculator;

/// Metadata merged onto every metric this post-processor writes, in priority
/// order low-to-high (later entries override earlier ones on key collision).
#[derive(Debug, Clone, Default)]
pub struct MetaDataLayers {
    pub workload: HashMap<String, String>,
    pub test_procedure: HashMap<String, String>,
}

impl MetaDataLayers {
    fn merge(&self, task_meta: &HashMap<String, String>, request_meta: &HashMap<String, String>) -> HashMap<String, String> {
        let mut merged = self.workload.clone();
        merged.extend(self.test_procedure.clone());
        merged.extend(task_meta.clone());
        merged.extend(request_meta.clone());
        merged
    }
}

pub struct SamplePostprocessor {
    downsample_factor: usize,
    meta_data: MetaDataLayers,
    throughput_calculator: ThroughputCalculator,
    bucket_interval_secs: f64,
}

impl SamplePostprocessor {
    pub fn new(downsample_factor: usize, meta_data: MetaDataLayers) -> Self {
        Self {
            downsample_factor: downsample_factor.max(1),
            meta_data,
            throughput_calculator: ThroughputCalculator::new(),
            bucket_interval_secs: 1.0,
        }
    }

    /// Writes every downsampled latency/timing reading plus the full
    /// throughput series for this batch of samples to `store`.
    pub fn process(&mut self, samples: &[Sample], store: &dyn MetricsStore) -> Result<(), CoreError> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut final_sample_count = 0usize;
        for (idx, sample) in samples.iter().enumerate() {
            if idx % self.downsample_factor != 0 {
                continue;
            }
            final_sample_count += 1;
            let meta = self.meta_data.merge(&HashMap::new(), &stringify(&sample.request_meta_data));

            for (name, value) in [
                ("latency", sample.latency_s),
                ("service_time", sample.service_time_s),
                ("client_processing_time", sample.client_processing_time_s),
                ("processing_time", sample.processing_time_s),
            ] {
                store.store_metric(MetricRecord {
                    task_name: sample.task_name.clone(),
                    name: name.to_string(),
                    value: value * 1000.0,
                    unit: "ms".to_string(),
                    meta_data: meta.clone(),
                })?;
            }

            for timing in &sample.dependent_timings {
                store.store_metric(MetricRecord {
                    task_name: sample.task_name.clone(),
                    name: format!("{}.service_time", timing.name),
                    value: timing.service_time_s * 1000.0,
                    unit: "ms".to_string(),
                    meta_data: meta.clone(),
                })?;
            }

            for key in ["recall@k", "recall@1"] {
                if let Some(value) = sample.request_meta_data.get(key).and_then(|v| v.as_f64()) {
                    store.store_metric(MetricRecord {
                        task_name: sample.task_name.clone(),
                        name: key.to_string(),
                        value,
                        unit: String::new(),
                        meta_data: meta.clone(),
                    })?;
                }
            }

            if let Some(profile_metrics) = sample.request_meta_data.get("profile-metrics").and_then(|v| v.as_object()) {
                for (name, value) in profile_metrics {
                    if let Some(value) = value.as_f64() {
                        store.store_metric(MetricRecord {
                            task_name: sample.task_name.clone(),
                            name: name.clone(),
                            value,
                            unit: String::new(),
                            meta_data: meta.clone(),
                        })?;
                    }
                }
            }
        }

        let aggregates = self.throughput_calculator.calculate(samples, self.bucket_interval_secs);
        for (task_name, points) in aggregates {
            for point in points {
                store.store_metric(MetricRecord {
                    task_name: task_name.clone(),
                    name: "throughput".to_string(),
                    value: point.throughput,
                    unit: point.unit,
                    meta_data: self.meta_data.merge(&HashMap::new(), &HashMap::new()),
                })?;
            }
        }

        store.store_samples(samples)?;
        store.flush()?;

        debug!(
            raw = samples.len(),
            downsampled = final_sample_count,
            "postprocessed raw samples"
        );
        Ok(())
    }
}

fn stringify(meta: &HashMap<String, serde_json::Value>) -> HashMap<String, String> {
    meta.iter()
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_store::InMemoryMetricsStore;
    use crate::model::SampleType;

    fn sample(task: &str, t: f64, total_ops: f64) -> Sample {
        Sample {
            client_id: 0,
            absolute_time: t,
            request_start: t,
            task_start: 0.0,
            task_name: task.to_string(),
            sample_type: SampleType::Normal,
            request_meta_data: HashMap::new(),
            latency_s: 0.005,
            service_time_s: 0.004,
            client_processing_time_s: 0.0,
            processing_time_s: 0.001,
            throughput: None,
            total_ops,
            total_ops_unit: "ops".to_string(),
            time_period_s: 0.005,
            percent_completed: Some(1.0),
            dependent_timings: Vec::new(),
            skipped: false,
        }
    }

    #[test]
    fn writes_latency_and_throughput_metrics() {
        let mut post = SamplePostprocessor::new(1, MetaDataLayers::default());
        let store = InMemoryMetricsStore::new();
        let samples = vec![sample("t1", 0.0, 1.0), sample("t1", 1.5, 1.0)];
        post.process(&samples, &store).unwrap();

        let metrics = store.metrics();
        assert!(metrics.iter().any(|m| m.name == "latency"));
        assert!(metrics.iter().any(|m| m.name == "throughput"));
        assert_eq!(store.samples().len(), 2);
    }

    #[test]
    fn downsample_factor_skips_timing_metrics_but_not_throughput() {
        let mut post = SamplePostprocessor::new(2, MetaDataLayers::default());
        let store = InMemoryMetricsStore::new();
        let samples: Vec<Sample> = (0..4).map(|i| sample("t1", i as f64 * 0.5, 1.0)).collect();
        post.process(&samples, &store).unwrap();

        let latency_count = store.metrics().iter().filter(|m| m.name == "latency").count();
        assert_eq!(latency_count, 2);
    }

    #[test]
    fn recall_and_profile_metrics_are_emitted_unitless_when_present() {
        let mut post = SamplePostprocessor::new(1, MetaDataLayers::default());
        let store = InMemoryMetricsStore::new();

        let mut with_recall = sample("search", 0.0, 1.0);
        with_recall.request_meta_data.insert("recall@k".to_string(), serde_json::json!(0.92));
        with_recall.request_meta_data.insert("recall@1".to_string(), serde_json::json!(0.5));
        with_recall.request_meta_data.insert(
            "profile-metrics".to_string(),
            serde_json::json!({"query_count": 12.0, "fetch_took_ms": 3.5}),
        );

        let plain = sample("search", 1.0, 1.0);

        post.process(&[with_recall, plain], &store).unwrap();
        let metrics = store.metrics();

        let recall_k = metrics.iter().find(|m| m.name == "recall@k").expect("recall@k metric");
        assert_eq!(recall_k.unit, "");
        assert!((recall_k.value - 0.92).abs() < 1e-9);

        let recall_1 = metrics.iter().find(|m| m.name == "recall@1").expect("recall@1 metric");
        assert!((recall_1.value - 0.5).abs() < 1e-9);

        let query_count = metrics.iter().find(|m| m.name == "query_count").expect("profile-metrics entry");
        assert_eq!(query_count.unit, "");
        assert!((query_count.value - 12.0).abs() < 1e-9);

        // the second sample has no recall/profile-metrics keys, so only the
        // first sample's meta-data should have contributed these metrics.
        assert_eq!(metrics.iter().filter(|m| m.name == "recall@k").count(), 1);
    }
}
