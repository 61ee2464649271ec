//! The worker actor: owns a client pool, spawns one executor per client, and
//! reports samples/join-point arrivals back to the coordinator (worker).
//!
//! Modeled on the original worker loop's task-spawn and staggered-start
//! machinery, restructured around the coordinator/worker message set instead
//! of a single fixed HTTP request loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

use crate::config::OnError;
use crate::errors::CoreError;
use crate::executor::{ClientExecutor, RunSignal};
use crate::messages::{
    CoordinatorMessage, ErrorRecord, JoinPointReached, TaskCompletesParent, UpdateSamples, WorkerId, WorkerMessage,
};
use crate::model::{SharedActivationTable, TaskAllocation};
use crate::parameter_source::ParameterSource;
use crate::runner::Runner;
use crate::sampler::Sampler;

/// Deterministic sample-rate gate for the operational percentile histograms
/// (not the benchmark's own `Sample` stream, which is always recorded in
/// full): every Nth request is sampled so every worker gets even coverage
/// without cross-worker coordination.
static PERCENTILE_SAMPLE_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn should_sample_for_percentiles(rate: u8) -> bool {
    if rate >= 100 {
        return true;
    }
    let counter = PERCENTILE_SAMPLE_COUNTER.fetch_add(1, Ordering::Relaxed);
    counter % 100 < rate as u64
}

/// How a worker picks the `Runner`/`ParameterSource` pair for a task's
/// operation type — an external registry the core depends on but doesn't own.
pub trait OperationRegistry: Send + Sync {
    fn runner_for(&self, operation_type: &str) -> Arc<dyn Runner>;
    fn parameter_source_for(&self, operation_type: &str) -> Arc<dyn ParameterSource>;
}

/// Flush cadence for batching samples into `UpdateSamples` messages.
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

pub struct WorkerConfig {
    pub worker_id: WorkerId,
    pub sample_buffer_capacity: usize,
    pub flush_interval: Duration,
    pub percentile_sampling_rate: u8,
    /// How a fatal (non-timeout) request failure is handled outside redline
    /// mode; see `ClientExecutor::should_abort_on`.
    pub on_error: OnError,
    pub redline_enabled: bool,
    /// Structured-error sink for the redline feedback actor; `None` outside
    /// redline runs.
    pub error_tx: Option<mpsc::Sender<ErrorRecord>>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: 0,
            sample_buffer_capacity: 16_384,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            percentile_sampling_rate: 100,
            on_error: OnError::Continue,
            redline_enabled: false,
            error_tx: None,
        }
    }
}

/// Runs the worker actor loop: waits for `StartWorker`, then drives each
/// successive parallel group's allocation to completion — reporting a
/// join-point arrival after every group and waiting for the coordinator's
/// `Drive` to hand it the next one — until `ActorExitRequest` or the
/// coordinator's final signal closes the inbox.
pub async fn run_worker(
    config: WorkerConfig,
    registry: Arc<dyn OperationRegistry>,
    mut inbox: mpsc::Receiver<WorkerMessage>,
    outbox: mpsc::Sender<CoordinatorMessage>,
    benchmark_start: Instant,
) {
    let worker_id = config.worker_id;
    info!(worker_id, "worker actor starting");

    let (allocations, active_clients) = loop {
        match inbox.recv().await {
            Some(WorkerMessage::StartWorker(msg)) => break (msg.allocations, msg.active_clients),
            Some(WorkerMessage::ActorExitRequest) | None => {
                debug!(worker_id, "worker exiting before receiving an allocation");
                return;
            }
            Some(_) => continue,
        }
    };

    let sampler = Arc::new(Sampler::new(config.sample_buffer_capacity));

    let task_allocations = run_column(
        &config,
        &registry,
        allocations,
        active_clients.clone(),
        &sampler,
        &outbox,
        &mut inbox,
        benchmark_start,
    )
    .await;
    notify_join_point(worker_id, &outbox, task_allocations).await;

    loop {
        match inbox.recv().await {
            Some(WorkerMessage::Drive(drive)) => {
                let task_allocations = if drive.allocations.is_empty() {
                    Vec::new()
                } else {
                    run_column(
                        &config,
                        &registry,
                        drive.allocations,
                        drive.active_clients,
                        &sampler,
                        &outbox,
                        &mut inbox,
                        benchmark_start,
                    )
                    .await
                };
                notify_join_point(worker_id, &outbox, task_allocations).await;
            }
            Some(WorkerMessage::ActorExitRequest) | None => break,
            Some(_) => continue,
        }
    }

    info!(worker_id, "worker actor finished");
}

/// Spawns one `ClientExecutor` per allocation, runs them to completion while
/// also servicing `CompleteCurrentTask`/`ActorExitRequest` and the periodic
/// sample flush, and returns the allocations this column ran (for the
/// `JoinPointReached` report).
async fn run_column(
    config: &WorkerConfig,
    registry: &Arc<dyn OperationRegistry>,
    allocations: Vec<TaskAllocation>,
    active_clients: Option<SharedActivationTable>,
    sampler: &Arc<Sampler>,
    outbox: &mpsc::Sender<CoordinatorMessage>,
    inbox: &mut mpsc::Receiver<WorkerMessage>,
    benchmark_start: Instant,
) -> Vec<TaskAllocation> {
    let worker_id = config.worker_id;
    let (stop_tx, stop_rx) = watch::channel(RunSignal::Running);

    let mut running = tokio::task::JoinSet::new();
    let mut task_allocations = Vec::with_capacity(allocations.len());
    for (client_id, allocation) in allocations.into_iter().enumerate() {
        task_allocations.push(allocation.clone());
        let completes_parent = allocation.task.completes_parent;
        let global_client_index = allocation.global_client_index;
        let runner = registry.runner_for(&allocation.task.operation.operation_type);
        let parameter_source = registry.parameter_source_for(&allocation.task.operation.operation_type);
        let pacer = crate::scheduler::pacer_for(&allocation.task.scheduler, None, allocation.task.ramp_up_time_period);
        let executor = ClientExecutor::new(
            worker_id,
            client_id,
            allocation,
            runner,
            parameter_source,
            pacer,
            sampler.clone(),
            stop_rx.clone(),
            benchmark_start,
        )
        .with_percentile_sampling_rate(config.percentile_sampling_rate)
        .with_active_clients(active_clients.clone())
        .with_error_tx(config.error_tx.clone())
        .with_on_error(config.on_error, config.redline_enabled);
        running.spawn(async move {
            let summary = executor.run().await;
            (completes_parent, global_client_index, summary)
        });
    }

    let mut flush_interval = time::interval(config.flush_interval);

    while !running.is_empty() {
        tokio::select! {
            _ = flush_interval.tick() => {
                flush_samples(worker_id, sampler, outbox).await;
            }
            msg = inbox.recv() => {
                match msg {
                    Some(WorkerMessage::CompleteCurrentTask) => {
                        let _ = stop_tx.send(RunSignal::CompleteCurrentTask);
                    }
                    Some(WorkerMessage::ActorExitRequest) => {
                        let _ = stop_tx.send(RunSignal::Cancelled);
                    }
                    Some(WorkerMessage::Drive(_)) | Some(WorkerMessage::StartWorker(_)) | None => {}
                }
            }
            joined = running.join_next() => {
                match joined {
                    Some(Ok((completes_parent, global_client_index, summary))) => {
                        if let Some(fatal) = summary.fatal_error {
                            error!(worker_id, error = %fatal, "client executor aborting the run");
                            let _ = outbox
                                .send(CoordinatorMessage::BenchmarkFailure {
                                    reason: fatal.to_string(),
                                    details: format!("worker {worker_id} client {global_client_index} aborted on a fatal request failure"),
                                })
                                .await;
                            let _ = stop_tx.send(RunSignal::Cancelled);
                        } else if completes_parent {
                            let _ = outbox
                                .send(CoordinatorMessage::TaskCompletesParent(TaskCompletesParent {
                                    worker_id,
                                    global_client_index,
                                }))
                                .await;
                        }
                    }
                    Some(Err(e)) => {
                        error!(worker_id, error = %e, "client executor task panicked");
                        let _ = outbox
                            .send(CoordinatorMessage::BenchmarkFailure {
                                reason: CoreError::WorkerCrashed(worker_id).to_string(),
                                details: e.to_string(),
                            })
                            .await;
                    }
                    None => {}
                }
            }
        }
    }

    flush_samples(worker_id, sampler, outbox).await;
    task_allocations
}

async fn notify_join_point(worker_id: WorkerId, outbox: &mpsc::Sender<CoordinatorMessage>, task_allocations: Vec<TaskAllocation>) {
    let reached = JoinPointReached {
        worker_id,
        worker_ts: Instant::now(),
        task_allocations,
    };
    if outbox
        .send(CoordinatorMessage::JoinPointReached(reached))
        .await
        .is_err()
    {
        error!(worker_id, "failed to notify coordinator of join-point arrival");
    }
}

async fn flush_samples(worker_id: WorkerId, sampler: &Arc<Sampler>, outbox: &mpsc::Sender<CoordinatorMessage>) {
    let (samples, profile_samples) = sampler.drain();
    if samples.is_empty() && profile_samples.is_empty() {
        return;
    }
    let count = samples.len();
    let msg = UpdateSamples {
        worker_id,
        samples,
        profile_samples,
    };
    if outbox.send(CoordinatorMessage::UpdateSamples(msg)).await.is_err() {
        error!(worker_id, "coordinator channel closed, dropping {count} samples");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OperationRef, Task, TaskAllocation, TimingPolicy};
    use crate::parameter_source::fixed;
    use crate::runner::RunnerOutcome;
    use async_trait::async_trait;

    struct NoopRunner;

    #[async_trait]
    impl Runner for NoopRunner {
        async fn run(
            &self,
            _operation: &OperationRef,
            _params: &HashMap<String, serde_json::Value>,
        ) -> Result<RunnerOutcome, crate::errors::CoreError> {
            Ok(RunnerOutcome::simple(Duration::from_micros(100)))
        }
    }

    struct FixedRegistry;

    impl OperationRegistry for FixedRegistry {
        fn runner_for(&self, _operation_type: &str) -> Arc<dyn Runner> {
            Arc::new(NoopRunner)
        }

        fn parameter_source_for(&self, _operation_type: &str) -> Arc<dyn ParameterSource> {
            Arc::new(fixed(HashMap::new()))
        }
    }

    fn allocation(iterations: u64) -> TaskAllocation {
        let op = OperationRef {
            operation_type: "noop".into(),
            name: "t1".into(),
            meta_data: HashMap::new(),
        };
        let task = Task::new(
            "t1",
            op,
            1,
            TimingPolicy::Iterations {
                warmup_iterations: 0,
                iterations: Some(iterations),
            },
        );
        TaskAllocation {
            task,
            client_index_in_task: 0,
            global_client_index: 0,
            total_clients_in_parallel_group: 1,
        }
    }

    #[tokio::test]
    async fn worker_reports_join_point_after_finishing_its_clients() {
        let (worker_tx, worker_rx) = mpsc::channel(8);
        let (coord_tx, mut coord_rx) = mpsc::channel(8);

        worker_tx
            .send(WorkerMessage::StartWorker(crate::messages::StartWorker {
                worker_id: 0,
                allocations: vec![allocation(3)],
                active_clients: None,
            }))
            .await
            .unwrap();

        let cfg = WorkerConfig {
            flush_interval: Duration::from_millis(10),
            ..WorkerConfig::default()
        };

        tokio::spawn(run_worker(cfg, Arc::new(FixedRegistry), worker_rx, coord_tx, Instant::now()));

        let mut saw_join_point = false;
        for _ in 0..20 {
            match tokio::time::timeout(Duration::from_millis(200), coord_rx.recv()).await {
                Ok(Some(CoordinatorMessage::JoinPointReached(_))) => {
                    saw_join_point = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_join_point, "worker should report a join-point once its clients finish");
    }

    #[test]
    fn percentile_sampling_gate_is_deterministic_at_full_rate() {
        for _ in 0..10 {
            assert!(should_sample_for_percentiles(100));
        }
    }

    #[tokio::test]
    async fn reports_task_completes_parent_once_its_completing_client_finishes() {
        let (worker_tx, worker_rx) = mpsc::channel(8);
        let (coord_tx, mut coord_rx) = mpsc::channel(8);

        let mut completing = allocation(1);
        completing.task = completing.task.completes_parent(true);

        worker_tx
            .send(WorkerMessage::StartWorker(crate::messages::StartWorker {
                worker_id: 7,
                allocations: vec![completing],
                active_clients: None,
            }))
            .await
            .unwrap();

        let cfg = WorkerConfig {
            flush_interval: Duration::from_millis(10),
            ..WorkerConfig::default()
        };

        tokio::spawn(run_worker(cfg, Arc::new(FixedRegistry), worker_rx, coord_tx, Instant::now()));

        let mut saw_completes_parent = false;
        for _ in 0..20 {
            match tokio::time::timeout(Duration::from_millis(200), coord_rx.recv()).await {
                Ok(Some(CoordinatorMessage::TaskCompletesParent(msg))) => {
                    assert_eq!(msg.worker_id, 7);
                    saw_completes_parent = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_completes_parent, "worker should report TaskCompletesParent once its completing client finishes");
    }
}
