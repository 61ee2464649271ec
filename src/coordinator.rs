//! The coordinator: owns the allocation matrix and drives every worker
//! through it one join point at a time.
//!
//! Modeled on the original `WorkerCoordinator`'s `joinpoint_reached` /
//! `move_to_next_task` pair: the coordinator hands each worker its column
//! slice of the matrix, waits for every worker to report `JoinPointReached`
//! for the current column, merges their samples, and either advances to the
//! next column or declares the run finished.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{error, info, warn};

use crate::messages::{
    BenchmarkOutcome, CoordinatorMessage, Drive, StartWorker, WorkerId, WorkerMessage,
};
use crate::metrics_store::MetricsStore;
use crate::model::{AllocationCell, SharedActivationTable, TestProcedure};
use crate::post_processor::{MetaDataLayers, SamplePostprocessor};
use crate::{allocator, throughput::ThroughputTracker};

/// Cadence at which buffered raw samples are handed to the post-processor.
const DEFAULT_POST_PROCESS_INTERVAL: Duration = Duration::from_secs(30);

/// One worker's channel handle plus the physical rows it owns.
pub struct WorkerHandle {
    pub worker_id: WorkerId,
    pub rows: Vec<usize>,
    pub outbox: mpsc::Sender<WorkerMessage>,
}

pub struct CoordinatorConfig {
    pub downsample_factor: usize,
    pub meta_data: MetaDataLayers,
    /// Cadence at which buffered raw samples are post-processed; the
    /// original coordinator invokes the post-processor every 30 s rather
    /// than on every sample flush.
    pub post_process_interval: Duration,
    /// Shared pause map handed to every worker; `None` when redline scaling
    /// is disabled.
    pub active_clients: Option<SharedActivationTable>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            downsample_factor: 1,
            meta_data: MetaDataLayers::default(),
            post_process_interval: DEFAULT_POST_PROCESS_INTERVAL,
            active_clients: None,
        }
    }
}

/// Drives a benchmark run to completion: prepare, start, advance through
/// every join-point column, finish.
pub struct Coordinator {
    workers: Vec<WorkerHandle>,
    inbox: mpsc::Receiver<CoordinatorMessage>,
    post_processor: SamplePostprocessor,
    store: Arc<dyn MetricsStore>,
    throughput_tracker: ThroughputTracker,
    benchmark_start: Instant,
    active_clients: Option<SharedActivationTable>,
    /// Raw samples accumulated since the last post-process flush.
    raw_samples: Vec<crate::model::Sample>,
    post_process_interval: Duration,
}

impl Coordinator {
    pub fn new(
        workers: Vec<WorkerHandle>,
        inbox: mpsc::Receiver<CoordinatorMessage>,
        store: Arc<dyn MetricsStore>,
        config: CoordinatorConfig,
        benchmark_start: Instant,
    ) -> Self {
        Self {
            workers,
            inbox,
            post_processor: SamplePostprocessor::new(config.downsample_factor, config.meta_data),
            store,
            throughput_tracker: ThroughputTracker::new(),
            benchmark_start,
            active_clients: config.active_clients,
            raw_samples: Vec::new(),
            post_process_interval: config.post_process_interval,
        }
    }

    /// Hands every buffered raw sample to the post-processor and clears the
    /// buffer; called on the 30s ticker and once more before every return
    /// path so short runs still get a final report.
    fn flush_post_processor(&mut self) {
        if self.raw_samples.is_empty() {
            return;
        }
        if let Err(e) = self.post_processor.process(&self.raw_samples, self.store.as_ref()) {
            warn!(error = %e, "failed to post-process buffered samples");
        }
        self.raw_samples.clear();
    }

    /// Builds the allocation matrix, assigns each worker its rows, and
    /// drives the run column by column until every join point is crossed.
    pub async fn run(mut self, procedure: Arc<TestProcedure>) -> BenchmarkOutcome {
        let matrix = allocator::allocate(&procedure);
        info!(
            max_clients = matrix.max_clients,
            width = matrix.width(),
            "allocation matrix built"
        );

        if let Err(e) = self.dispatch_group(&matrix, 0) {
            return BenchmarkOutcome::Failure {
                reason: "dispatch".into(),
                details: e,
            };
        }

        let group_count = procedure.groups.len();
        let mut column = 0usize;
        let mut post_process_ticker = time::interval(self.post_process_interval);

        while column < group_count {
            match self.await_join_point(&matrix, column, &mut post_process_ticker).await {
                Ok(()) => {
                    info!(column, "join point reached by all workers");
                    column += 1;
                    if column < group_count {
                        self.advance_all_workers(&matrix, column);
                    }
                }
                Err(CoordinatorStop::Failure { reason, details }) => {
                    self.signal_cancel();
                    self.flush_post_processor();
                    return BenchmarkOutcome::Failure { reason, details };
                }
                Err(CoordinatorStop::Cancelled) => {
                    self.signal_cancel();
                    self.flush_post_processor();
                    return BenchmarkOutcome::Cancelled;
                }
            }
        }

        self.signal_exit();
        self.flush_post_processor();
        let mut metrics = HashMap::new();
        metrics.insert("throughput_ops_per_sec".to_string(), self.throughput_tracker.total_throughput());
        BenchmarkOutcome::Complete { metrics }
    }

    /// This group's task column is at matrix index `2*group_index+1` — the
    /// allocator always places a join point at index 0 and after every group.
    fn rows_for_group<'a>(matrix: &'a allocator::AllocationMatrix, rows: &[usize], group_index: usize) -> Vec<&'a AllocationCell> {
        let column = 2 * group_index + 1;
        rows.iter()
            .filter_map(|&row| matrix.rows.get(row).and_then(|r| r.get(column)))
            .collect()
    }

    fn dispatch_group(&self, matrix: &allocator::AllocationMatrix, group_index: usize) -> Result<(), String> {
        for worker in &self.workers {
            let allocations = Self::rows_for_group(matrix, &worker.rows, group_index)
                .into_iter()
                .filter_map(|cell| match cell {
                    AllocationCell::Task(task_alloc) => Some(task_alloc.clone()),
                    _ => None,
                })
                .collect();
            worker
                .outbox
                .try_send(WorkerMessage::StartWorker(StartWorker {
                    worker_id: worker.worker_id,
                    allocations,
                    active_clients: self.active_clients.clone(),
                }))
                .map_err(|e| format!("worker {} unreachable: {e}", worker.worker_id))?;
        }
        Ok(())
    }

    fn advance_all_workers(&self, matrix: &allocator::AllocationMatrix, group_index: usize) {
        for worker in &self.workers {
            let allocations = Self::rows_for_group(matrix, &worker.rows, group_index)
                .into_iter()
                .filter_map(|cell| match cell {
                    AllocationCell::Task(task_alloc) => Some(task_alloc.clone()),
                    _ => None,
                })
                .collect();
            let _ = worker.outbox.try_send(WorkerMessage::Drive(Drive {
                client_start_ts: Instant::now(),
                allocations,
                active_clients: self.active_clients.clone(),
            }));
        }
    }

    fn signal_cancel(&self) {
        for worker in &self.workers {
            let _ = worker.outbox.try_send(WorkerMessage::ActorExitRequest);
        }
    }

    fn signal_exit(&self) {
        for worker in &self.workers {
            let _ = worker.outbox.try_send(WorkerMessage::ActorExitRequest);
        }
    }

    /// The join point ending this group's column is at matrix index
    /// `2*group_index+2` — every row carries an identical copy of it, so row
    /// 0 is as good as any for reading `clients_executing_completing_task`.
    fn completing_rows_for_group(matrix: &allocator::AllocationMatrix, group_index: usize) -> Vec<usize> {
        let column = 2 * group_index + 2;
        matrix
            .rows
            .first()
            .and_then(|row| row.get(column))
            .and_then(|cell| cell.as_join())
            .map(|jp| jp.clients_executing_completing_task.clone())
            .unwrap_or_default()
    }

    fn broadcast_complete_current_task(&self) {
        for worker in &self.workers {
            let _ = worker.outbox.try_send(WorkerMessage::CompleteCurrentTask);
        }
    }

    /// Waits until every worker in `expected` has reported `JoinPointReached`
    /// for the current column, merging `UpdateSamples` as they arrive and
    /// broadcasting `CompleteCurrentTask` the moment every client running
    /// this column's `completes_parent` task has finished — so an
    /// open-ended sibling task on another worker stops instead of hanging.
    async fn await_join_point(
        &mut self,
        matrix: &allocator::AllocationMatrix,
        group_index: usize,
        post_process_ticker: &mut time::Interval,
    ) -> Result<(), CoordinatorStop> {
        let mut arrived: HashMap<WorkerId, bool> = self.workers.iter().map(|w| (w.worker_id, false)).collect();

        let completing_rows = Self::completing_rows_for_group(matrix, group_index);
        let mut reported_rows: HashSet<usize> = HashSet::new();
        let mut broadcast_sent = completing_rows.is_empty();

        while arrived.values().any(|&done| !done) {
            tokio::select! {
                _ = post_process_ticker.tick() => {
                    self.flush_post_processor();
                }
                msg = self.inbox.recv() => {
                    match msg {
                        Some(CoordinatorMessage::UpdateSamples(update)) => {
                            for sample in &update.samples {
                                self.throughput_tracker.record(&sample.task_name, std::time::Duration::from_secs_f64(sample.latency_s));
                            }
                            self.raw_samples.extend(update.samples);
                        }
                        Some(CoordinatorMessage::JoinPointReached(reached)) => {
                            arrived.insert(reached.worker_id, true);
                        }
                        Some(CoordinatorMessage::TaskCompletesParent(msg)) => {
                            let row = matrix.row_for_client(msg.global_client_index);
                            reported_rows.insert(row);
                            if !broadcast_sent && completing_rows.iter().all(|r| reported_rows.contains(r)) {
                                broadcast_sent = true;
                                self.broadcast_complete_current_task();
                            }
                        }
                        Some(CoordinatorMessage::BenchmarkFailure { reason, details }) => {
                            return Err(CoordinatorStop::Failure { reason, details });
                        }
                        Some(CoordinatorMessage::BenchmarkCancelled) => return Err(CoordinatorStop::Cancelled),
                        Some(CoordinatorMessage::PrepareBenchmark { .. }) | Some(CoordinatorMessage::StartBenchmark) => {}
                        None => {
                            error!("coordinator inbox closed before every worker reached the join point");
                            return Err(CoordinatorStop::Failure {
                                reason: "channel closed".into(),
                                details: "all worker senders dropped".into(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

enum CoordinatorStop {
    Failure { reason: String, details: String },
    Cancelled,
}

/// Runs a coordinator to completion and returns its outcome over `reply`,
/// for callers that want a future-style handle instead of awaiting the
/// actor's future directly.
pub async fn spawn_coordinator(
    coordinator: Coordinator,
    procedure: Arc<TestProcedure>,
    reply: oneshot::Sender<BenchmarkOutcome>,
) {
    let outcome = coordinator.run(procedure).await;
    let _ = reply.send(outcome);
}
