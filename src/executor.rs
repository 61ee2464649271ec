//! Per-client async execution loop for one task (executor).
//!
//! One `ClientExecutor` drives one client through one `TaskAllocation`:
//! paced iterations, runner invocation, error classification, and sample
//! emission into a shared `Sampler`. `schedule_handle` owns the sequence of
//! allocations a client moves through across parallel groups; this module
//! only knows how to run a single one to completion (or until stopped).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::OnError;
use crate::errors::{CoreError, RequestErrorType};
use crate::memory_guard::is_percentile_tracking_active;
use crate::messages::{ErrorRecord, WorkerId};
use crate::model::{DependentTiming, Sample, SharedActivationTable, TaskAllocation};
use crate::parameter_source::ParameterSource;
use crate::percentiles::GLOBAL_TASK_PERCENTILES;
use crate::runner::Runner;
use crate::sampler::Sampler;
use crate::scheduler::{Pacer, ProgressController};

/// Cooperative stop signal a worker broadcasts to every client executor it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    Running,
    /// Finish the in-flight iteration, then stop scheduling new ones.
    CompleteCurrentTask,
    /// Stop before the next iteration.
    Cancelled,
}

/// Default per-request timeout when a task doesn't set one; matches the
/// default HTTP client timeout used elsewhere in the crate.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ClientExecutor {
    worker_id: WorkerId,
    client_id: usize,
    allocation: TaskAllocation,
    runner: Arc<dyn Runner>,
    parameter_source: Arc<dyn ParameterSource>,
    pacer: Box<dyn Pacer>,
    sampler: Arc<Sampler>,
    stop: watch::Receiver<RunSignal>,
    request_timeout: Duration,
    benchmark_start: Instant,
    /// Percentage of iterations (0-100) fed into the live operator-visibility
    /// percentile tracker; does not affect sample emission or the final report.
    percentile_sampling_rate: u8,
    /// Shared pause map; `None` means every client always runs (redline
    /// scaling disabled).
    active_clients: Option<SharedActivationTable>,
    /// Structured-error sink for the redline feedback actor; `None` outside
    /// redline runs.
    error_tx: Option<mpsc::Sender<ErrorRecord>>,
    on_error: OnError,
    /// Fatal-abort escalation only applies when redline scaling is off — a
    /// redline run treats request failures as scale-down signal instead.
    redline_enabled: bool,
}

/// Outcome of running one client through one task allocation to completion.
#[derive(Debug, Default)]
pub struct ExecutorSummary {
    pub iterations_completed: u64,
    pub errors: u64,
    pub cancelled: bool,
    /// Set when `on_error=abort` escalation fired; the worker actor turns
    /// this into a `BenchmarkFailure` and the executor stops immediately.
    pub fatal_error: Option<CoreError>,
}

impl ClientExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: WorkerId,
        client_id: usize,
        allocation: TaskAllocation,
        runner: Arc<dyn Runner>,
        parameter_source: Arc<dyn ParameterSource>,
        pacer: Box<dyn Pacer>,
        sampler: Arc<Sampler>,
        stop: watch::Receiver<RunSignal>,
        benchmark_start: Instant,
    ) -> Self {
        Self {
            worker_id,
            client_id,
            allocation,
            runner,
            parameter_source,
            pacer,
            sampler,
            stop,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            benchmark_start,
            percentile_sampling_rate: 100,
            active_clients: None,
            error_tx: None,
            on_error: OnError::Continue,
            redline_enabled: false,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_percentile_sampling_rate(mut self, rate: u8) -> Self {
        self.percentile_sampling_rate = rate.min(100);
        self
    }

    pub fn with_active_clients(mut self, active_clients: Option<SharedActivationTable>) -> Self {
        self.active_clients = active_clients;
        self
    }

    pub fn with_error_tx(mut self, error_tx: Option<mpsc::Sender<ErrorRecord>>) -> Self {
        self.error_tx = error_tx;
        self
    }

    pub fn with_on_error(mut self, on_error: OnError, redline_enabled: bool) -> Self {
        self.on_error = on_error;
        self.redline_enabled = redline_enabled;
        self
    }

    /// Whether this iteration should feed the live percentile tracker, gated
    /// by the memory guard's kill switch and the worker's deterministic
    /// sampling-rate gate.
    fn should_record_percentile(&self) -> bool {
        is_percentile_tracking_active() && crate::worker::should_sample_for_percentiles(self.percentile_sampling_rate)
    }

    /// Mirrors the original `AsyncExecutor`'s per-iteration
    /// `shared_states.get(client_id, True)` read: defaults to active when no
    /// shared table is attached or the worker/client pair isn't present yet.
    fn is_active(&self) -> bool {
        match &self.active_clients {
            None => true,
            Some(table) => table
                .read()
                .unwrap()
                .get(&self.worker_id)
                .and_then(|clients| clients.get(&self.client_id))
                .copied()
                .unwrap_or(true),
        }
    }

    fn send_error_record(&self, error_type: RequestErrorType, task_name: &str, details: String) {
        if let Some(tx) = &self.error_tx {
            let _ = tx.try_send(ErrorRecord {
                error_type: error_type.as_str().to_string(),
                client_id: Some(self.client_id),
                task: Some(task_name.to_string()),
                details,
            });
        }
    }

    /// `on_error=abort` escalates any non-timeout failure into a fatal run
    /// abort, but only outside redline mode — a redline run treats failures
    /// as scale-down pressure instead of something to abort over.
    fn should_abort_on(&self, error_type: RequestErrorType) -> bool {
        self.on_error == OnError::Abort && !self.redline_enabled && error_type != RequestErrorType::Timeout
    }

    /// Drives the client through its allocated task until the timing policy
    /// is satisfied or a stop signal arrives.
    pub async fn run(mut self) -> ExecutorSummary {
        let task = self.allocation.task.clone();
        let mut progress = ProgressController::new(&task.timing);
        let task_start = Instant::now();

        let ramp_offset = ProgressController::ramp_up_offset(
            self.allocation.total_clients_in_parallel_group,
            self.allocation.client_index_in_task,
            task.ramp_up_time_period.unwrap_or(Duration::ZERO),
        );
        if !ramp_offset.is_zero() {
            tokio::time::sleep(ramp_offset).await;
        }

        let mut summary = ExecutorSummary::default();
        let mut next_fire = tokio::time::Instant::now();

        loop {
            match *self.stop.borrow() {
                RunSignal::Cancelled => {
                    summary.cancelled = true;
                    break;
                }
                RunSignal::CompleteCurrentTask => break,
                RunSignal::Running => {}
            }

            if progress.is_complete() {
                break;
            }

            let delay = self.pacer.next_delay(summary.iterations_completed);
            next_fire += delay;
            tokio::time::sleep_until(next_fire).await;

            if *self.stop.borrow() == RunSignal::Cancelled {
                summary.cancelled = true;
                break;
            }

            let sample_type = progress.current_sample_type();
            let request_start = Instant::now();

            if !self.is_active() {
                let now = Instant::now();
                self.sampler.add(build_sample(
                    &self,
                    &task.name,
                    sample_type,
                    task_start,
                    request_start,
                    0.0,
                    0.0,
                    0.0,
                    0.0,
                    Some((0.0, "ops".to_string())),
                    skipped_meta(),
                    Vec::new(),
                    progress.percent_completed(),
                ));
                progress.record_iteration();
                progress.record_elapsed(now.duration_since(request_start));
                summary.iterations_completed += 1;
                continue;
            }

            let params = self.parameter_source.params();
            let result = timeout(self.request_timeout, self.runner.run(&task.operation, &params)).await;

            let now = Instant::now();
            let latency_s = now.duration_since(request_start).as_secs_f64();

            if self.should_record_percentile() {
                GLOBAL_TASK_PERCENTILES.record(&task.name, (latency_s * 1000.0) as u64);
            }

            match result {
                Ok(Ok(outcome)) => {
                    let service_time_s = outcome.service_time.as_secs_f64();
                    let client_processing_time_s = outcome.client_processing_time.as_secs_f64();
                    self.sampler.add(build_sample(
                        &self,
                        &task.name,
                        sample_type,
                        task_start,
                        request_start,
                        latency_s,
                        service_time_s,
                        client_processing_time_s,
                        (latency_s - service_time_s - client_processing_time_s).max(0.0),
                        Some((outcome.total_ops, outcome.total_ops_unit.clone())),
                        outcome.request_meta_data.clone(),
                        outcome.dependent_timings.clone(),
                        progress.percent_completed(),
                    ));
                }
                Ok(Err(core_err)) => {
                    summary.errors += 1;
                    let error_type = classify(&core_err);
                    warn!(
                        client_id = self.client_id,
                        task = %task.name,
                        error = error_type.as_str(),
                        "request failed"
                    );
                    self.send_error_record(error_type, &task.name, core_err.to_string());
                    self.sampler.add(build_sample(
                        &self,
                        &task.name,
                        sample_type,
                        task_start,
                        request_start,
                        latency_s,
                        latency_s,
                        0.0,
                        latency_s,
                        None,
                        error_meta(error_type),
                        Vec::new(),
                        progress.percent_completed(),
                    ));
                    if self.should_abort_on(error_type) {
                        summary.fatal_error = Some(core_err);
                        break;
                    }
                }
                Err(_) => {
                    summary.errors += 1;
                    warn!(client_id = self.client_id, task = %task.name, "request timed out");
                    self.send_error_record(RequestErrorType::Timeout, &task.name, "request timed out".to_string());
                    self.sampler.add(build_sample(
                        &self,
                        &task.name,
                        sample_type,
                        task_start,
                        request_start,
                        latency_s,
                        latency_s,
                        0.0,
                        latency_s,
                        None,
                        error_meta(RequestErrorType::Timeout),
                        Vec::new(),
                        progress.percent_completed(),
                    ));
                }
            }

            progress.record_iteration();
            progress.record_elapsed(now.duration_since(request_start));
            summary.iterations_completed += 1;
        }

        debug!(
            client_id = self.client_id,
            task = %task.name,
            iterations = summary.iterations_completed,
            errors = summary.errors,
            "client executor finished"
        );
        summary
    }
}

fn error_meta(error_type: RequestErrorType) -> HashMap<String, serde_json::Value> {
    let mut meta = HashMap::new();
    meta.insert(
        "error-type".to_string(),
        serde_json::Value::String(error_type.as_str().to_string()),
    );
    meta
}

/// Mirrors the original's `{"success": True, "skipped_request": True}`
/// result for a paused client's iteration.
fn skipped_meta() -> HashMap<String, serde_json::Value> {
    let mut meta = HashMap::new();
    meta.insert("skipped_request".to_string(), serde_json::Value::Bool(true));
    meta
}

#[allow(clippy::too_many_arguments)]
fn build_sample(
    exec: &ClientExecutor,
    task_name: &str,
    sample_type: crate::model::SampleType,
    task_start: Instant,
    request_start: Instant,
    latency_s: f64,
    service_time_s: f64,
    client_processing_time_s: f64,
    processing_time_s: f64,
    throughput: Option<(f64, String)>,
    request_meta_data: HashMap<String, serde_json::Value>,
    dependent_timings: Vec<DependentTiming>,
    percent_completed: Option<f64>,
) -> Sample {
    let skipped = request_meta_data.contains_key("skipped_request");
    Sample {
        client_id: exec.client_id,
        absolute_time: request_start.duration_since(exec.benchmark_start).as_secs_f64(),
        request_start: request_start.duration_since(exec.benchmark_start).as_secs_f64(),
        task_start: task_start.duration_since(exec.benchmark_start).as_secs_f64(),
        task_name: task_name.to_string(),
        sample_type,
        request_meta_data,
        latency_s,
        service_time_s,
        client_processing_time_s,
        processing_time_s,
        throughput,
        total_ops: 1.0,
        total_ops_unit: "ops".to_string(),
        time_period_s: latency_s,
        percent_completed,
        dependent_timings,
        skipped,
    }
}

/// Maps a runner/timeout failure onto the coarse error taxonomy the redline
/// actor and error queue use. A connection-refused-shaped message is treated
/// as a transport failure; anything else reported by a runner is its own
/// failure rather than a network condition.
fn classify(err: &CoreError) -> RequestErrorType {
    match err {
        CoreError::Timeout(_) => RequestErrorType::Timeout,
        CoreError::RunnerFailure(msg) => {
            let lower = msg.to_lowercase();
            if lower.contains("connection refused") || lower.contains("connect") || lower.contains("dns") {
                RequestErrorType::Transport
            } else {
                RequestErrorType::Runner
            }
        }
        _ => RequestErrorType::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OperationRef, Task, TimingPolicy};
    use crate::parameter_source::fixed;
    use crate::runner::RunnerOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingRunner {
        calls: AtomicU64,
    }

    #[async_trait]
    impl Runner for CountingRunner {
        async fn run(
            &self,
            _operation: &OperationRef,
            _params: &HashMap<String, serde_json::Value>,
        ) -> Result<RunnerOutcome, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RunnerOutcome::simple(Duration::from_millis(1)))
        }
    }

    fn allocation(name: &str, iterations: u64) -> TaskAllocation {
        let op = OperationRef {
            operation_type: "noop".into(),
            name: name.into(),
            meta_data: HashMap::new(),
        };
        let task = Task::new(
            name,
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
    async fn runs_exactly_the_configured_iteration_budget() {
        let runner = Arc::new(CountingRunner { calls: AtomicU64::new(0) });
        let (_tx, rx) = watch::channel(RunSignal::Running);
        let sampler = Arc::new(Sampler::new(100));
        let executor = ClientExecutor::new(
            0,
            0,
            allocation("t1", 5),
            runner.clone(),
            Arc::new(fixed(HashMap::new())),
            Box::new(crate::scheduler::UnitRatePacer),
            sampler.clone(),
            rx,
            Instant::now(),
        );
        let summary = executor.run().await;
        assert_eq!(summary.iterations_completed, 5);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 5);
        assert_eq!(sampler.len(), 5);
    }

    #[tokio::test]
    async fn complete_current_task_stops_scheduling_new_iterations() {
        let runner = Arc::new(CountingRunner { calls: AtomicU64::new(0) });
        let (tx, rx) = watch::channel(RunSignal::Running);
        let sampler = Arc::new(Sampler::new(100));
        let executor = ClientExecutor::new(
            0,
            0,
            allocation("t1", 1_000_000),
            runner,
            Arc::new(fixed(HashMap::new())),
            Box::new(crate::scheduler::UnitRatePacer),
            sampler,
            rx,
            Instant::now(),
        );
        let handle = tokio::spawn(executor.run());
        tokio::time::sleep(Duration::from_millis(5)).await;
        tx.send(RunSignal::CompleteCurrentTask).unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("executor should stop promptly")
            .unwrap();
        assert!(!summary.cancelled);
        assert!(summary.iterations_completed < 1_000_000);
    }

    struct FailingRunner;

    #[async_trait]
    impl Runner for FailingRunner {
        async fn run(
            &self,
            _operation: &OperationRef,
            _params: &HashMap<String, serde_json::Value>,
        ) -> Result<RunnerOutcome, CoreError> {
            Err(CoreError::RunnerFailure("connection refused".into()))
        }
    }

    fn paused_table(worker_id: usize, client_id: usize) -> SharedActivationTable {
        let mut clients = HashMap::new();
        clients.insert(client_id, false);
        let mut table = std::collections::HashMap::new();
        table.insert(worker_id, clients);
        Arc::new(std::sync::RwLock::new(table))
    }

    #[tokio::test]
    async fn a_paused_client_is_skipped_without_calling_the_runner() {
        let runner = Arc::new(CountingRunner { calls: AtomicU64::new(0) });
        let (_tx, rx) = watch::channel(RunSignal::Running);
        let sampler = Arc::new(Sampler::new(100));
        let executor = ClientExecutor::new(
            0,
            0,
            allocation("t1", 5),
            runner.clone(),
            Arc::new(fixed(HashMap::new())),
            Box::new(crate::scheduler::UnitRatePacer),
            sampler.clone(),
            rx,
            Instant::now(),
        )
        .with_active_clients(Some(paused_table(0, 0)));
        let summary = executor.run().await;
        assert_eq!(summary.iterations_completed, 5);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0, "a paused client must never invoke the runner");
        assert!(sampler.drain().0.iter().all(|s| s.skipped));
    }

    #[tokio::test]
    async fn on_error_abort_stops_the_executor_after_a_fatal_failure() {
        let (_tx, rx) = watch::channel(RunSignal::Running);
        let sampler = Arc::new(Sampler::new(100));
        let executor = ClientExecutor::new(
            0,
            0,
            allocation("t1", 1_000_000),
            Arc::new(FailingRunner),
            Arc::new(fixed(HashMap::new())),
            Box::new(crate::scheduler::UnitRatePacer),
            sampler,
            rx,
            Instant::now(),
        )
        .with_on_error(OnError::Abort, false);
        let summary = executor.run().await;
        assert!(summary.fatal_error.is_some());
        assert!(summary.iterations_completed < 1_000_000);
    }

    #[tokio::test]
    async fn redline_mode_never_aborts_on_request_failures() {
        let (_tx, rx) = watch::channel(RunSignal::Running);
        let sampler = Arc::new(Sampler::new(100));
        let executor = ClientExecutor::new(
            0,
            0,
            allocation("t1", 3),
            Arc::new(FailingRunner),
            Arc::new(fixed(HashMap::new())),
            Box::new(crate::scheduler::UnitRatePacer),
            sampler,
            rx,
            Instant::now(),
        )
        .with_on_error(OnError::Abort, true);
        let summary = executor.run().await;
        assert!(summary.fatal_error.is_none());
        assert_eq!(summary.iterations_completed, 3);
    }
}
