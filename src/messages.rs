//! Message types exchanged between the coordinator, workers and the feedback
//! actor. Each actor in topology is a Tokio task; these enums travel
//! over the `tokio::sync::mpsc` channels that connect them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::model::{Sample, SharedActivationTable, TaskAllocation, TestProcedure};
use crate::sampler::ProfileSample;

pub type WorkerId = usize;
pub type ClientId = usize;

/// Sent to a worker to hand it its slice of the allocation matrix.
#[derive(Debug)]
pub struct StartWorker {
    pub worker_id: WorkerId,
    pub allocations: Vec<TaskAllocation>,
    /// Shared pause map; `None` when redline scaling is disabled, in which
    /// case every client always runs.
    pub active_clients: Option<SharedActivationTable>,
}

/// Advances a worker past its current join point into the next parallel
/// group; `client_start_ts` is in the *receiving worker's own* monotonic
/// clock domain. `allocations` is that worker's row slice of the next
/// group's task column — empty if none of its rows participate in it.
#[derive(Debug)]
pub struct Drive {
    pub client_start_ts: Instant,
    pub allocations: Vec<TaskAllocation>,
    pub active_clients: Option<SharedActivationTable>,
}

/// Soft-stop: executors finish their in-flight request then stop scheduling.
#[derive(Debug, Clone, Copy)]
pub struct CompleteCurrentTask;

/// A worker's periodic sample flush.
#[derive(Debug)]
pub struct UpdateSamples {
    pub worker_id: WorkerId,
    pub samples: Vec<Sample>,
    pub profile_samples: Vec<ProfileSample>,
}

/// Sent by a worker once every client it owns has reached the join point that
/// ends the current step.
#[derive(Debug)]
pub struct JoinPointReached {
    pub worker_id: WorkerId,
    pub worker_ts: Instant,
    pub task_allocations: Vec<TaskAllocation>,
}

/// Messages a worker task can receive.
#[derive(Debug)]
pub enum WorkerMessage {
    StartWorker(StartWorker),
    Drive(Drive),
    CompleteCurrentTask,
    ActorExitRequest,
}

/// Sent by a worker the moment one of its clients finishes a
/// `completes_parent` task, identified by that client's global index — lets
/// the coordinator broadcast `CompleteCurrentTask` as soon as every such
/// client across every worker has reported, without waiting for those
/// workers' whole column to finish first.
#[derive(Debug, Clone, Copy)]
pub struct TaskCompletesParent {
    pub worker_id: WorkerId,
    pub global_client_index: usize,
}

/// Messages the coordinator can receive.
#[derive(Debug)]
pub enum CoordinatorMessage {
    PrepareBenchmark {
        test_procedure: Arc<TestProcedure>,
    },
    StartBenchmark,
    UpdateSamples(UpdateSamples),
    JoinPointReached(JoinPointReached),
    TaskCompletesParent(TaskCompletesParent),
    BenchmarkFailure { reason: String, details: String },
    BenchmarkCancelled,
}

/// Outcome the coordinator hands back to whoever started the run.
#[derive(Debug)]
pub enum BenchmarkOutcome {
    Complete { metrics: HashMap<String, f64> },
    Failure { reason: String, details: String },
    Cancelled,
}

/// Messages the feedback actor can receive.
#[derive(Debug, Clone)]
pub enum FeedbackMessage {
    StartFeedbackActor,
    ConfigureFeedbackScaling(FeedbackScalingConfig),
    EnableFeedbackScaling,
    DisableFeedbackScaling,
    /// Resets `max_error_threshold` to unbounded. The conditions under which
    /// a caller sends this are not evident in the core — it is an
    /// externally-driven override.
    ResetErrorThreshold,
}

/// Tunable knobs for the redline controller.
#[derive(Debug, Clone)]
pub struct FeedbackScalingConfig {
    pub scale_step: Option<usize>,
    pub scale_down_pct: Option<f64>,
    pub sleep_seconds: Option<u64>,
    pub max_clients: Option<usize>,
    pub cpu_max_pct: Option<f64>,
    /// Window the CPU aggregation query averages `process_cpu_percent` over.
    pub cpu_window_seconds: Option<u64>,
    /// Minimum gap between CPU aggregation queries.
    pub cpu_check_interval_seconds: Option<u64>,
}

impl Default for FeedbackScalingConfig {
    fn default() -> Self {
        Self {
            scale_step: None,
            scale_down_pct: None,
            sleep_seconds: None,
            max_clients: None,
            cpu_max_pct: None,
            cpu_window_seconds: None,
            cpu_check_interval_seconds: None,
        }
    }
}

/// One structured error-queue entry.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub error_type: String,
    pub client_id: Option<ClientId>,
    pub task: Option<String>,
    pub details: String,
}
