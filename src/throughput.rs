//! Throughput calculation (throughput calculator).
//!
//! Ported from the original worker coordinator's `ThroughputCalculator`:
//! samples are grouped by task, sorted by `absolute_time`, and folded into
//! fixed-width time buckets. Each bucket yields one throughput point once
//! enough time has elapsed within it; a final point is emitted for whatever
//! sample type hasn't produced one yet, so short test runs still get at
//! least one throughput reading. When a runner already reports its own
//! `throughput` (profiling runners sometimes do), the bucket math is skipped
//! entirely and that value is passed through as-is.
//!
//! A separate process-wide `ThroughputTracker` mirrors the crate's original
//! ops/sec counters for operational dashboards; it is unrelated to the
//! report-grade numbers `ThroughputCalculator` produces.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::model::{Sample, SampleType};

/// One computed throughput reading for a task.
#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputPoint {
    pub absolute_time: f64,
    pub task_relative_time: f64,
    pub sample_type: SampleType,
    pub throughput: f64,
    pub unit: String,
}

struct TaskStats {
    unprocessed: Vec<Sample>,
    total_count: f64,
    interval: f64,
    bucket_interval: f64,
    bucket: f64,
    sample_type: SampleType,
    has_samples_in_sample_type: bool,
    start_time: f64,
}

impl TaskStats {
    fn new(bucket_interval: f64, sample_type: SampleType, start_time: f64) -> Self {
        Self {
            unprocessed: Vec::new(),
            total_count: 0.0,
            interval: 0.0,
            bucket_interval,
            bucket: bucket_interval,
            sample_type,
            has_samples_in_sample_type: false,
            start_time,
        }
    }

    fn throughput(&self) -> f64 {
        if self.interval > 0.0 {
            self.total_count / self.interval
        } else {
            0.0
        }
    }

    /// Once we've seen a `Normal` sample we never go back to reporting `Warmup`.
    fn maybe_update_sample_type(&mut self, current: SampleType) {
        if self.sample_type == SampleType::Warmup && current == SampleType::Normal {
            self.sample_type = current;
            self.has_samples_in_sample_type = false;
        }
    }

    fn update_interval(&mut self, absolute_sample_time: f64) {
        self.interval = self.interval.max(absolute_sample_time - self.start_time);
    }

    fn can_calculate_throughput(&self) -> bool {
        self.interval > 0.0 && self.interval >= self.bucket
    }

    fn can_add_final_throughput_sample(&self) -> bool {
        self.interval > 0.0 && !self.has_samples_in_sample_type
    }

    fn finish_bucket(&mut self, new_total: f64) {
        self.unprocessed.clear();
        self.total_count = new_total;
        self.has_samples_in_sample_type = true;
        self.bucket = self.interval.trunc() + self.bucket_interval;
    }
}

/// Folds a stream of per-task samples into throughput points, maintaining
/// per-task state across successive calls (one coordinator owns one of these
/// for the whole benchmark run).
#[derive(Default)]
pub struct ThroughputCalculator {
    task_stats: HashMap<String, TaskStats>,
}

impl ThroughputCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Groups `samples` by task name, folds each group into the running
    /// per-task bucket state, and returns every throughput point produced
    /// across all tasks in this call.
    pub fn calculate(&mut self, samples: &[Sample], bucket_interval_secs: f64) -> HashMap<String, Vec<ThroughputPoint>> {
        let mut by_task: HashMap<String, Vec<Sample>> = HashMap::new();
        for sample in samples {
            by_task.entry(sample.task_name.clone()).or_default().push(sample.clone());
        }

        let mut result: HashMap<String, Vec<ThroughputPoint>> = HashMap::new();
        for (task, mut task_samples) in by_task {
            if let Some(stats) = self.task_stats.get(&task) {
                task_samples.extend(stats.unprocessed.iter().cloned());
            }
            task_samples.sort_by(|a, b| a.absolute_time.partial_cmp(&b.absolute_time).unwrap());

            let first = &task_samples[0];
            let points = if first.throughput.is_some() {
                map_task_throughput(&task_samples)
            } else {
                self.calculate_task_throughput(&task, &task_samples, bucket_interval_secs)
            };
            result.entry(task).or_default().extend(points);
        }
        result
    }

    fn calculate_task_throughput(&mut self, task: &str, samples: &[Sample], bucket_interval_secs: f64) -> Vec<ThroughputPoint> {
        let mut points = Vec::new();

        if !self.task_stats.contains_key(task) {
            let first = &samples[0];
            self.task_stats.insert(
                task.to_string(),
                TaskStats::new(bucket_interval_secs, first.sample_type, first.absolute_time - first.time_period_s),
            );
        }
        let stats = self.task_stats.get_mut(task).unwrap();

        let mut count = stats.total_count;
        let mut last_sample: Option<&Sample> = None;
        for sample in samples {
            last_sample = Some(sample);
            stats.maybe_update_sample_type(sample.sample_type);
            count += sample.total_ops;
            stats.update_interval(sample.absolute_time);

            if stats.can_calculate_throughput() {
                stats.finish_bucket(count);
                points.push(ThroughputPoint {
                    absolute_time: sample.absolute_time,
                    task_relative_time: sample.absolute_time - sample.task_start,
                    sample_type: stats.sample_type,
                    throughput: stats.throughput(),
                    unit: format!("{}/s", sample.total_ops_unit),
                });
            } else {
                stats.unprocessed.push(sample.clone());
            }
        }

        if let Some(last) = last_sample {
            if stats.can_add_final_throughput_sample() {
                stats.finish_bucket(count);
                points.push(ThroughputPoint {
                    absolute_time: last.absolute_time,
                    task_relative_time: last.absolute_time - last.task_start,
                    sample_type: stats.sample_type,
                    throughput: stats.throughput(),
                    unit: format!("{}/s", last.total_ops_unit),
                });
            }
        }

        debug!(task, points = points.len(), "throughput points calculated");
        points
    }
}

fn map_task_throughput(samples: &[Sample]) -> Vec<ThroughputPoint> {
    samples
        .iter()
        .map(|sample| {
            let (value, unit) = sample.throughput.clone().unwrap_or((0.0, "ops/s".to_string()));
            ThroughputPoint {
                absolute_time: sample.absolute_time,
                task_relative_time: sample.absolute_time - sample.task_start,
                sample_type: sample.sample_type,
                throughput: value,
                unit,
            }
        })
        .collect()
}

/// Process-wide ops/sec counters for operational dashboards, independent of
/// the report-grade `ThroughputCalculator` above.
#[derive(Clone)]
pub struct ThroughputTracker {
    start_time: Instant,
    counts: Arc<Mutex<HashMap<String, u64>>>,
    total_times: Arc<Mutex<HashMap<String, Duration>>>,
}

impl ThroughputTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counts: Arc::new(Mutex::new(HashMap::new())),
            total_times: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn record(&self, task_name: &str, duration: Duration) {
        *self.counts.lock().unwrap().entry(task_name.to_string()).or_insert(0) += 1;
        *self
            .total_times
            .lock()
            .unwrap()
            .entry(task_name.to_string())
            .or_insert(Duration::ZERO) += duration;
    }

    pub fn total_throughput(&self) -> f64 {
        let total: u64 = self.counts.lock().unwrap().values().sum();
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            total as f64 / elapsed
        } else {
            0.0
        }
    }
}

impl Default for ThroughputTracker {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    pub static ref GLOBAL_THROUGHPUT_TRACKER: ThroughputTracker = ThroughputTracker::new();
}
