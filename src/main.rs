//! Binary entry point: loads configuration and a workload file, builds the
//! allocation matrix, and drives the coordinator/worker/feedback actors to
//! completion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mimalloc::MiMalloc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use redline_loadcore::cluster::{start_health_server, ClusterConfig, ClusterHandle};
use redline_loadcore::config::Config;
use redline_loadcore::coordinator::{Coordinator, CoordinatorConfig, WorkerHandle};
use redline_loadcore::cpu_sampler::{spawn_cpu_telemetry, ProcfsCpuSampler};
use redline_loadcore::feedback::{run_feedback_actor, FeedbackActor};
use redline_loadcore::memory_guard::{init_percentile_tracking_flag, spawn_memory_guard, MemoryGuardConfig};
use redline_loadcore::messages::{BenchmarkOutcome, CoordinatorMessage, ErrorRecord, FeedbackMessage, FeedbackScalingConfig};
use redline_loadcore::metrics::{register_metrics, start_metrics_server};
use redline_loadcore::metrics_store::{InMemoryMetricsStore, MetricsStore};
use redline_loadcore::model::{ClientActivationTable, OperationRef, TestProcedure};
use redline_loadcore::parameter_source::{fixed, CsvParameterSource, ParameterSource};
use redline_loadcore::post_processor::MetaDataLayers;
use redline_loadcore::runner::{HttpRunner, Runner};
use redline_loadcore::worker::{run_worker, OperationRegistry, WorkerConfig};
use redline_loadcore::workload::load_test_procedure;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Maps every task's `operation_type` to an `HttpRunner` hitting `TARGET_URL`
/// and, when the matching task's operation carries a `params_file` meta-data
/// entry, a `CsvParameterSource` loaded from it; otherwise an empty fixed
/// source. Runners and parameter sources are built once per operation type
/// and shared across every client executor that uses them.
struct HttpOperationRegistry {
    target_url: String,
    procedure: Arc<TestProcedure>,
    runners: Mutex<HashMap<String, Arc<dyn Runner>>>,
    parameter_sources: Mutex<HashMap<String, Arc<dyn ParameterSource>>>,
}

impl HttpOperationRegistry {
    fn new(target_url: String, procedure: Arc<TestProcedure>) -> Self {
        Self {
            target_url,
            procedure,
            runners: Mutex::new(HashMap::new()),
            parameter_sources: Mutex::new(HashMap::new()),
        }
    }

    fn operation_for(&self, operation_type: &str) -> Option<OperationRef> {
        self.procedure
            .groups
            .iter()
            .flat_map(|g| g.tasks.iter())
            .map(|t| &t.operation)
            .find(|op| op.operation_type == operation_type)
            .cloned()
    }
}

impl OperationRegistry for HttpOperationRegistry {
    fn runner_for(&self, operation_type: &str) -> Arc<dyn Runner> {
        let mut runners = self.runners.lock().unwrap();
        runners
            .entry(operation_type.to_string())
            .or_insert_with(|| {
                Arc::new(
                    HttpRunner::new(self.target_url.clone())
                        .expect("failed to build HTTP client for runner"),
                )
            })
            .clone()
    }

    fn parameter_source_for(&self, operation_type: &str) -> Arc<dyn ParameterSource> {
        let mut sources = self.parameter_sources.lock().unwrap();
        sources
            .entry(operation_type.to_string())
            .or_insert_with(|| {
                let params_file = self
                    .operation_for(operation_type)
                    .and_then(|op| op.meta_data.get("params_file").cloned())
                    .and_then(|v| v.as_str().map(str::to_string));

                match params_file {
                    Some(path) => match CsvParameterSource::from_file(&path) {
                        Ok(source) => Arc::new(source) as Arc<dyn ParameterSource>,
                        Err(e) => {
                            error!(operation_type, path, error = %e, "failed to load CSV parameter file, falling back to empty params");
                            Arc::new(fixed(HashMap::<String, Value>::new()))
                        }
                    },
                    None => Arc::new(fixed(HashMap::<String, Value>::new())),
                }
            })
            .clone()
    }
}

/// Splits the allocation matrix's rows evenly across `worker_count` workers.
fn partition_rows(max_clients: usize, worker_count: usize) -> Vec<Vec<usize>> {
    let mut partitions = vec![Vec::new(); worker_count.max(1)];
    for row in 0..max_clients {
        partitions[row % worker_count.max(1)].push(row);
    }
    partitions
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = register_metrics() {
        warn!(error = %e, "failed to register prometheus metrics (already registered?)");
    }
    init_percentile_tracking_flag(!config.test_mode_enabled);

    let procedure = match load_test_procedure(&config.workload_path) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            error!(error = %e, path = %config.workload_path, "failed to load workload");
            std::process::exit(1);
        }
    };
    info!(name = %procedure.name, groups = procedure.groups.len(), "workload loaded");

    let target_url = std::env::var("TARGET_URL").unwrap_or_else(|_| "http://localhost:9200".to_string());
    let registry: Arc<dyn OperationRegistry> = Arc::new(HttpOperationRegistry::new(target_url, procedure.clone()));

    let matrix = redline_loadcore::allocator::allocate(&procedure);
    let row_partitions = partition_rows(matrix.max_clients, config.worker_count);

    let metrics_registry = Arc::new(Mutex::new(prometheus::default_registry().clone()));
    tokio::spawn(start_metrics_server(9090, metrics_registry));
    tokio::spawn(spawn_memory_guard(MemoryGuardConfig::default()));

    let cluster_config = ClusterConfig::from_env();
    let node_id = cluster_config.node_id.clone();
    let cluster_handle = ClusterHandle::new(cluster_config);
    tokio::spawn(start_health_server(cluster_handle));

    let (coord_tx, coord_rx) = mpsc::channel::<CoordinatorMessage>(config.sample_queue_size);
    let mut worker_handles = Vec::with_capacity(row_partitions.len());
    let mut client_states: ClientActivationTable = HashMap::new();

    // Only allocated when redline scaling can actually drain it; wiring a
    // sender with nowhere to read from would only mask a full queue behind
    // a silent `try_send` failure.
    let (error_tx, error_rx) = if config.redline.enabled {
        let (tx, rx) = mpsc::channel::<ErrorRecord>(1024);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let benchmark_start = std::time::Instant::now();
    for (worker_id, rows) in row_partitions.into_iter().enumerate() {
        if rows.is_empty() {
            continue;
        }
        let (worker_tx, worker_rx) = mpsc::channel(1024);
        client_states.insert(worker_id, rows.iter().map(|&r| (r, true)).collect());

        let worker_config = WorkerConfig {
            worker_id,
            sample_buffer_capacity: config.sample_queue_size,
            flush_interval: config.flush_interval,
            percentile_sampling_rate: config.percentile_sampling_rate,
            on_error: config.on_error,
            redline_enabled: config.redline.enabled,
            error_tx: error_tx.clone(),
        };
        let worker_registry = registry.clone();
        let worker_coord_tx = coord_tx.clone();
        tokio::spawn(run_worker(worker_config, worker_registry, worker_rx, worker_coord_tx, benchmark_start));

        worker_handles.push(WorkerHandle {
            worker_id,
            rows,
            outbox: worker_tx,
        });
    }
    drop(coord_tx);
    drop(error_tx);

    let active_clients = if config.redline.enabled {
        Some(Arc::new(std::sync::RwLock::new(client_states)))
    } else {
        None
    };

    let store: Arc<dyn MetricsStore> = Arc::new(InMemoryMetricsStore::new());

    if config.redline.enabled {
        let shared_states = active_clients.clone().expect("active_clients is Some whenever redline is enabled");
        let error_rx = error_rx.expect("error_rx is Some whenever redline is enabled");
        let (feedback_tx, feedback_rx) = mpsc::channel::<FeedbackMessage>(16);
        // Every node in the fleet tags its readings with the same id so the
        // feedback actor's aggregation query only ever sees this run's data.
        let test_execution_id = format!("{}-{}", procedure.name, rand::random::<u64>());

        tokio::spawn(spawn_cpu_telemetry(
            Arc::new(ProcfsCpuSampler::new()),
            store.clone(),
            node_id.clone(),
            test_execution_id.clone(),
            Duration::from_secs(config.redline.cpu_check_interval_seconds),
        ));

        let actor = FeedbackActor::new(shared_states).with_metrics_store(store.clone(), test_execution_id);

        let scaling_config = FeedbackScalingConfig {
            scale_step: Some(config.redline.scale_step),
            scale_down_pct: Some(config.redline.scale_down_pct),
            sleep_seconds: Some(config.redline.sleep_seconds),
            max_clients: Some(config.redline.max_clients),
            cpu_max_pct: Some(config.redline.max_cpu_usage_pct),
            cpu_window_seconds: Some(config.redline.cpu_window_seconds),
            cpu_check_interval_seconds: Some(config.redline.cpu_check_interval_seconds),
        };
        let _ = feedback_tx.try_send(FeedbackMessage::ConfigureFeedbackScaling(scaling_config));
        let _ = feedback_tx.try_send(FeedbackMessage::EnableFeedbackScaling);
        tokio::spawn(run_feedback_actor(actor, feedback_rx, error_rx));
    }

    let coordinator_config = CoordinatorConfig {
        downsample_factor: config.metrics_downsample_factor,
        meta_data: MetaDataLayers::default(),
        active_clients,
        ..CoordinatorConfig::default()
    };
    let coordinator = Coordinator::new(worker_handles, coord_rx, store, coordinator_config, benchmark_start);

    let (outcome_tx, outcome_rx) = oneshot::channel();
    tokio::spawn(redline_loadcore::coordinator::spawn_coordinator(coordinator, procedure, outcome_tx));

    match outcome_rx.await {
        Ok(BenchmarkOutcome::Complete { metrics }) => {
            info!(?metrics, "benchmark complete");
        }
        Ok(BenchmarkOutcome::Failure { reason, details }) => {
            error!(reason, details, "benchmark failed");
            std::process::exit(1);
        }
        Ok(BenchmarkOutcome::Cancelled) => {
            warn!("benchmark cancelled");
        }
        Err(_) => {
            error!("coordinator dropped without reporting an outcome");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_rows_round_robin_across_workers() {
        let partitions = partition_rows(7, 3);
        assert_eq!(partitions.len(), 3);
        assert_eq!(partitions[0], vec![0, 3, 6]);
        assert_eq!(partitions[1], vec![1, 4]);
        assert_eq!(partitions[2], vec![2, 5]);
    }

    #[test]
    fn partitions_rows_with_single_worker() {
        let partitions = partition_rows(4, 1);
        assert_eq!(partitions, vec![vec![0, 1, 2, 3]]);
    }
}
