//! Core data model: tasks, test procedures, join points, allocations and samples.
//!
//! These types carry no behavior beyond small accessors — the algorithms that
//! operate on them (allocation, scheduling, sampling, throughput) live in their
//! own modules.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-(worker, client) active/paused flag, shared with every worker so a
/// paused client's executor can be told to stop scheduling new iterations.
/// A `true` entry means the client is currently allowed to run.
pub type ClientActivationTable = HashMap<usize, HashMap<usize, bool>>;

/// Shared handle onto the activation table: lock-free-ish reads from every
/// client executor, serialized writes from the feedback actor's scale-down
/// and scale-up passes.
pub type SharedActivationTable = Arc<RwLock<ClientActivationTable>>;

/// Mutually exclusive timing policy for a [`Task`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimingPolicy {
    /// Run a fixed iteration budget: `warmup_iterations` discarded, then
    /// `iterations` counted ones.
    Iterations {
        warmup_iterations: u64,
        iterations: Option<u64>,
    },
    /// Run for a wall-clock duration: `warmup_time_period` discarded, then
    /// `time_period` counted.
    TimePeriod {
        #[serde(with = "crate::utils::duration_str")]
        warmup_time_period: Duration,
        #[serde(with = "crate::utils::option_duration_str")]
        time_period: Option<Duration>,
    },
}

impl TimingPolicy {
    /// Rejects the `warmup + total == 0` configuration error.
    pub fn validate(&self) -> Result<(), crate::errors::CoreError> {
        match self {
            TimingPolicy::Iterations {
                warmup_iterations,
                iterations,
            } => {
                if *warmup_iterations == 0 && matches!(iterations, Some(0)) {
                    return Err(crate::errors::CoreError::Configuration(
                        "warmup_iterations + iterations must not both be zero".into(),
                    ));
                }
                Ok(())
            }
            TimingPolicy::TimePeriod {
                warmup_time_period,
                time_period,
            } => {
                if warmup_time_period.is_zero() && matches!(time_period, Some(d) if d.is_zero()) {
                    return Err(crate::errors::CoreError::Configuration(
                        "warmup_time_period + time_period must not both be zero".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// A reference to the operation a task exercises; the operation's own
/// definition, parameter source construction, and runner registry are an
/// external collaborator — the core only needs the name/type/meta-data
/// triple to label samples and look the runner up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRef {
    pub operation_type: String,
    pub name: String,
    #[serde(default)]
    pub meta_data: HashMap<String, Value>,
}

/// A named unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub operation: OperationRef,
    pub clients: usize,
    #[serde(default)]
    pub completes_parent: bool,
    pub timing: TimingPolicy,
    #[serde(default, with = "crate::utils::option_duration_str")]
    pub ramp_up_time_period: Option<Duration>,
    #[serde(default = "default_scheduler_name")]
    pub scheduler: String,
}

fn default_scheduler_name() -> String {
    "deterministic".to_string()
}

impl Task {
    pub fn new(name: impl Into<String>, operation: OperationRef, clients: usize, timing: TimingPolicy) -> Self {
        Self {
            name: name.into(),
            operation,
            clients,
            completes_parent: false,
            timing,
            ramp_up_time_period: None,
            scheduler: default_scheduler_name(),
        }
    }

    pub fn completes_parent(mut self, value: bool) -> Self {
        self.completes_parent = value;
        self
    }

    pub fn ramp_up(mut self, period: Duration) -> Self {
        self.ramp_up_time_period = Some(period);
        self
    }
}

/// A set of tasks executed concurrently; consecutive groups are separated by
/// an implicit [`JoinPoint`] inserted by the allocator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ParallelGroup {
    pub tasks: Vec<Task>,
}

impl ParallelGroup {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    /// Total client count requested across every sub-task in this group.
    pub fn clients_sum(&self) -> usize {
        self.tasks.iter().map(|t| t.clients).sum()
    }
}

/// An ordered sequence of parallel groups.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TestProcedure {
    pub name: String,
    pub groups: Vec<ParallelGroup>,
}

/// A global barrier synchronizing all clients at the end of a parallel group.
///
/// Equality is by id only, per spec — two `JoinPoint`s with the same id but
/// different completing-task sets should never arise in a well-formed matrix,
/// but equality intentionally ignores the set anyway.
#[derive(Debug, Clone)]
pub struct JoinPoint {
    pub id: u64,
    pub clients_executing_completing_task: Vec<usize>,
}

impl JoinPoint {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            clients_executing_completing_task: Vec::new(),
        }
    }
}

impl PartialEq for JoinPoint {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for JoinPoint {}

/// One cell's worth of work for one client within one parallel group.
///
/// Identity is `(task, global_client_index)`.
#[derive(Debug, Clone)]
pub struct TaskAllocation {
    pub task: Task,
    pub client_index_in_task: usize,
    pub global_client_index: usize,
    pub total_clients_in_parallel_group: usize,
}

impl PartialEq for TaskAllocation {
    fn eq(&self, other: &Self) -> bool {
        self.task.name == other.task.name && self.global_client_index == other.global_client_index
    }
}

/// A matrix cell: either a task slice, a join point, or nothing (padding).
#[derive(Debug, Clone)]
pub enum AllocationCell {
    Task(TaskAllocation),
    Join(JoinPoint),
    None,
}

impl AllocationCell {
    pub fn as_task(&self) -> Option<&TaskAllocation> {
        match self {
            AllocationCell::Task(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_join(&self) -> Option<&JoinPoint> {
        match self {
            AllocationCell::Join(j) => Some(j),
            _ => None,
        }
    }
}

/// Warmup vs. normal sample-type label, controlled by the progress controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleType {
    Warmup,
    Normal,
}

/// One timed outcome of one request.
#[derive(Debug, Clone)]
pub struct Sample {
    pub client_id: usize,
    pub absolute_time: f64,
    pub request_start: f64,
    pub task_start: f64,
    pub task_name: String,
    pub sample_type: SampleType,
    pub request_meta_data: HashMap<String, Value>,
    pub latency_s: f64,
    pub service_time_s: f64,
    pub client_processing_time_s: f64,
    pub processing_time_s: f64,
    pub throughput: Option<(f64, String)>,
    pub total_ops: f64,
    pub total_ops_unit: String,
    pub time_period_s: f64,
    pub percent_completed: Option<f64>,
    pub dependent_timings: Vec<DependentTiming>,
    /// Set when the client that produced this sample was paused in the
    /// activation table at the time — the runner was never invoked.
    pub skipped: bool,
}

/// An additional named timing reported alongside a sample's primary timing
/// (e.g. a multi-phase operation reporting per-phase service times).
#[derive(Debug, Clone)]
pub struct DependentTiming {
    pub name: String,
    pub service_time_s: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_iteration_budget() {
        let policy = TimingPolicy::Iterations {
            warmup_iterations: 0,
            iterations: Some(0),
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn accepts_nonzero_iteration_budget() {
        let policy = TimingPolicy::Iterations {
            warmup_iterations: 0,
            iterations: Some(10),
        };
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn group_clients_sum() {
        let op = OperationRef {
            operation_type: "search".into(),
            name: "default".into(),
            meta_data: HashMap::new(),
        };
        let t1 = Task::new(
            "t1",
            op.clone(),
            4,
            TimingPolicy::Iterations {
                warmup_iterations: 0,
                iterations: Some(10),
            },
        );
        let t2 = Task::new(
            "t2",
            op,
            2,
            TimingPolicy::Iterations {
                warmup_iterations: 0,
                iterations: Some(10),
            },
        );
        let group = ParallelGroup::new(vec![t1, t2]);
        assert_eq!(group.clients_sum(), 6);
    }

    #[test]
    fn join_point_equality_is_by_id() {
        let mut a = JoinPoint::new(1);
        a.clients_executing_completing_task.push(3);
        let b = JoinPoint::new(1);
        assert_eq!(a, b);
        let c = JoinPoint::new(2);
        assert_ne!(a, c);
    }
}
