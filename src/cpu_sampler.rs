//! CPU telemetry feeding the redline feedback actor's threshold check.
//!
//! The original worker coordinator reads `psutil.cpu_percent()` per worker
//! process; the closest Linux-native equivalent available here is `/proc/stat`
//! deltas via `procfs`, following the same cfg-gated, best-effort pattern
//! `memory_guard.rs` uses for its own `/proc` reads (return `None` instead of
//! erroring when telemetry can't be collected, since a stalled CPU reading
//! should never crash a benchmark run).
//!
//! Unlike `memory_guard.rs`'s self-monitoring, a CPU reading is only useful
//! to the feedback actor in aggregate across every host in the fleet, so the
//! sampler doesn't answer "what's my CPU percent" directly — it pushes
//! `node-stats` documents into the shared `MetricsStore`, and the feedback
//! actor's aggregation query (`MetricsStore::nodes_exceeding_cpu_threshold`)
//! is the only reader.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tracing::debug;

use crate::metrics_store::{MetricsStore, NodeStatsDoc};

#[cfg(target_os = "linux")]
pub struct ProcfsCpuSampler {
    last: std::sync::Mutex<Option<procfs::CpuTime>>,
}

#[cfg(target_os = "linux")]
impl ProcfsCpuSampler {
    pub fn new() -> Self {
        Self {
            last: std::sync::Mutex::new(None),
        }
    }

    fn current_cpu_percent(&self) -> Option<f64> {
        let kstat = procfs::KernelStats::new().ok()?;
        let current = kstat.total;

        let mut guard = self.last.lock().unwrap();
        let percent = match guard.take() {
            Some(prev) => cpu_percent_delta(&prev, &current),
            None => None,
        };
        *guard = Some(current);

        if percent.is_none() {
            debug!("no prior cpu sample yet, skipping this tick");
        }
        percent
    }
}

#[cfg(target_os = "linux")]
impl Default for ProcfsCpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn cpu_percent_delta(prev: &procfs::CpuTime, current: &procfs::CpuTime) -> Option<f64> {
    let prev_idle = prev.idle + prev.iowait.unwrap_or(0);
    let curr_idle = current.idle + current.iowait.unwrap_or(0);

    let prev_total = prev.user
        + prev.nice
        + prev.system
        + prev.idle
        + prev.iowait.unwrap_or(0)
        + prev.irq.unwrap_or(0)
        + prev.softirq.unwrap_or(0)
        + prev.steal.unwrap_or(0);
    let curr_total = current.user
        + current.nice
        + current.system
        + current.idle
        + current.iowait.unwrap_or(0)
        + current.irq.unwrap_or(0)
        + current.softirq.unwrap_or(0)
        + current.steal.unwrap_or(0);

    let total_delta = curr_total.saturating_sub(prev_total) as f64;
    if total_delta == 0.0 {
        return None;
    }
    let idle_delta = curr_idle.saturating_sub(prev_idle) as f64;
    Some(((total_delta - idle_delta) / total_delta) * 100.0)
}

#[cfg(not(target_os = "linux"))]
pub struct ProcfsCpuSampler;

#[cfg(not(target_os = "linux"))]
impl ProcfsCpuSampler {
    pub fn new() -> Self {
        Self
    }

    fn current_cpu_percent(&self) -> Option<f64> {
        None
    }
}

#[cfg(not(target_os = "linux"))]
impl Default for ProcfsCpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// One host's raw CPU reading source, sampled by `spawn_cpu_telemetry` and
/// pushed into a `MetricsStore` as a `node-stats` document.
pub trait CpuReadingSource: Send + Sync {
    fn current_cpu_percent(&self) -> Option<f64>;
}

impl CpuReadingSource for ProcfsCpuSampler {
    fn current_cpu_percent(&self) -> Option<f64> {
        ProcfsCpuSampler::current_cpu_percent(self)
    }
}

/// Samples `source` on `interval_duration` and writes one `node-stats`
/// document per successful reading into `store`, tagged with `node_name`
/// and `test_execution_id` so the feedback actor's aggregation query can
/// find it. Runs until the returned handle is dropped or aborted.
pub fn spawn_cpu_telemetry(
    source: Arc<dyn CpuReadingSource>,
    store: Arc<dyn MetricsStore>,
    node_name: String,
    test_execution_id: String,
    interval_duration: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(interval_duration);
        loop {
            ticker.tick().await;
            let Some(process_cpu_percent) = source.current_cpu_percent() else {
                continue;
            };
            let doc = NodeStatsDoc {
                node_name: node_name.clone(),
                test_execution_id: test_execution_id.clone(),
                process_cpu_percent,
                recorded_at: Instant::now(),
            };
            if let Err(e) = store.put_doc(doc) {
                tracing::warn!(error = %e, "failed to record node CPU telemetry");
            }
        }
    })
}

/// Test double returning a fixed sequence of readings.
pub struct FixedCpuSampler {
    readings: std::sync::Mutex<std::collections::VecDeque<f64>>,
}

impl FixedCpuSampler {
    pub fn new(readings: Vec<f64>) -> Self {
        Self {
            readings: std::sync::Mutex::new(readings.into()),
        }
    }
}

impl CpuReadingSource for FixedCpuSampler {
    fn current_cpu_percent(&self) -> Option<f64> {
        self.readings.lock().unwrap().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_store::InMemoryMetricsStore;

    #[test]
    fn fixed_sampler_returns_readings_in_order() {
        let sampler = FixedCpuSampler::new(vec![10.0, 95.0]);
        assert_eq!(sampler.current_cpu_percent(), Some(10.0));
        assert_eq!(sampler.current_cpu_percent(), Some(95.0));
        assert_eq!(sampler.current_cpu_percent(), None);
    }

    #[tokio::test]
    async fn spawned_telemetry_writes_a_node_stats_doc_per_tick() {
        let source: Arc<dyn CpuReadingSource> = Arc::new(FixedCpuSampler::new(vec![42.0, 77.0]));
        let store = Arc::new(InMemoryMetricsStore::new());
        let handle = spawn_cpu_telemetry(
            source,
            store.clone() as Arc<dyn MetricsStore>,
            "host-a".into(),
            "run-1".into(),
            Duration::from_millis(5),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.abort();

        let exceeding = store
            .nodes_exceeding_cpu_threshold("run-1", Duration::from_secs(30), 50.0)
            .unwrap();
        assert_eq!(exceeding, vec!["host-a".to_string()], "mean of 42 and 77 exceeds 50");
    }
}
