//! Pacing and progress tracking for a single client's run of one task.
//!
//! A [`Pacer`] answers "when should the next request start, relative to task
//! start?" for a single client. A [`ProgressController`] tracks how far
//! through its warmup/measurement budget a client is and whether the next
//! iteration should be labeled `Warmup` or `Normal`. Both are driven by
//! `schedule_handle`'s per-client loop; neither performs I/O itself.

use std::time::Duration;

use rand::Rng;
use rand_distr::Distribution;

use crate::model::{SampleType, TimingPolicy};

/// Decides the delay, relative to the task's own start instant, before the
/// Nth request (0-indexed) for one client should fire.
pub trait Pacer: Send {
    /// `completed` is the number of requests this client has already issued
    /// for the current task (warmup + measured).
    fn next_delay(&mut self, completed: u64) -> Duration;
}

/// Issues requests back-to-back, uncapped.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnitRatePacer;

impl Pacer for UnitRatePacer {
    fn next_delay(&mut self, _completed: u64) -> Duration {
        Duration::ZERO
    }
}

/// Evenly spaced requests at a fixed target rate, ramping linearly from zero
/// to `target_rps` over `ramp_up_time_period` if one was configured.
#[derive(Debug, Clone)]
pub struct DeterministicPacer {
    target_rps: f64,
    ramp_up: Option<Duration>,
    start: Duration,
}

impl DeterministicPacer {
    pub fn new(target_rps: f64, ramp_up: Option<Duration>) -> Self {
        Self {
            target_rps,
            ramp_up,
            start: Duration::ZERO,
        }
    }

    fn rps_at(&self, elapsed: Duration) -> f64 {
        match self.ramp_up {
            Some(ramp) if !ramp.is_zero() && elapsed < ramp => {
                self.target_rps * (elapsed.as_secs_f64() / ramp.as_secs_f64())
            }
            _ => self.target_rps,
        }
    }
}

impl Pacer for DeterministicPacer {
    fn next_delay(&mut self, completed: u64) -> Duration {
        let elapsed = self.start;
        let rps = self.rps_at(elapsed).max(0.001);
        let interval = Duration::from_secs_f64(1.0 / rps);
        self.start += interval;
        let _ = completed;
        interval
    }
}

/// Poisson-distributed inter-arrival times around a mean rate — models open
/// workloads where arrivals are independent of service time, unlike
/// `DeterministicPacer`'s fixed cadence.
pub struct PoissonPacer {
    target_rps: f64,
    rng: rand::rngs::ThreadRng,
}

impl PoissonPacer {
    pub fn new(target_rps: f64) -> Self {
        Self {
            target_rps: target_rps.max(0.001),
            rng: rand::thread_rng(),
        }
    }
}

impl Pacer for PoissonPacer {
    fn next_delay(&mut self, _completed: u64) -> Duration {
        let exp = rand_distr::Exp::new(self.target_rps).expect("rate must be positive");
        let secs: f64 = exp.sample(&mut self.rng);
        Duration::from_secs_f64(secs)
    }
}

impl std::fmt::Debug for PoissonPacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoissonPacer").field("target_rps", &self.target_rps).finish()
    }
}

/// Builds the right [`Pacer`] for a scheduler name recorded on a [`crate::model::Task`].
pub fn pacer_for(scheduler_name: &str, target_rps: Option<f64>, ramp_up: Option<Duration>) -> Box<dyn Pacer> {
    match (scheduler_name, target_rps) {
        ("poisson", Some(rps)) => Box::new(PoissonPacer::new(rps)),
        ("deterministic", Some(rps)) => Box::new(DeterministicPacer::new(rps, ramp_up)),
        _ => Box::new(UnitRatePacer),
    }
}

/// Tracks a single client's progress through a task's warmup/measurement
/// budget and decides the `SampleType` of the next iteration.
#[derive(Debug, Clone)]
pub enum ProgressController {
    IterationBased {
        warmup_iterations: u64,
        total_iterations: Option<u64>,
        completed: u64,
    },
    TimeBased {
        warmup: Duration,
        total: Option<Duration>,
        elapsed: Duration,
    },
}

impl ProgressController {
    pub fn new(policy: &TimingPolicy) -> Self {
        match policy {
            TimingPolicy::Iterations {
                warmup_iterations,
                iterations,
            } => ProgressController::IterationBased {
                warmup_iterations: *warmup_iterations,
                total_iterations: *iterations,
                completed: 0,
            },
            TimingPolicy::TimePeriod {
                warmup_time_period,
                time_period,
            } => ProgressController::TimeBased {
                warmup: *warmup_time_period,
                total: *time_period,
                elapsed: Duration::ZERO,
            },
        }
    }

    /// `true` once the client has exhausted its warmup + measurement budget.
    pub fn is_complete(&self) -> bool {
        match self {
            ProgressController::IterationBased {
                warmup_iterations,
                total_iterations,
                completed,
            } => match total_iterations {
                Some(total) => completed >= &(warmup_iterations + total),
                None => false,
            },
            ProgressController::TimeBased { warmup, total, elapsed } => match total {
                Some(total) => elapsed >= &(*warmup + *total),
                None => false,
            },
        }
    }

    /// The `SampleType` the next iteration should be labeled with, before
    /// recording it via [`ProgressController::record_iteration`] /
    /// [`ProgressController::record_elapsed`].
    pub fn current_sample_type(&self) -> SampleType {
        match self {
            ProgressController::IterationBased {
                warmup_iterations,
                completed,
                ..
            } => {
                if completed < warmup_iterations {
                    SampleType::Warmup
                } else {
                    SampleType::Normal
                }
            }
            ProgressController::TimeBased { warmup, elapsed, .. } => {
                if elapsed < warmup {
                    SampleType::Warmup
                } else {
                    SampleType::Normal
                }
            }
        }
    }

    pub fn record_iteration(&mut self) {
        if let ProgressController::IterationBased { completed, .. } = self {
            *completed += 1;
        }
    }

    pub fn record_elapsed(&mut self, delta: Duration) {
        if let ProgressController::TimeBased { elapsed, .. } = self {
            *elapsed += delta;
        }
    }

    /// Fraction of the measurement (non-warmup) budget completed, if the
    /// budget is bounded — feeds `Sample::percent_completed`.
    pub fn percent_completed(&self) -> Option<f64> {
        match self {
            ProgressController::IterationBased {
                warmup_iterations,
                total_iterations,
                completed,
            } => {
                let total = (*total_iterations)?;
                if total == 0 {
                    return Some(1.0);
                }
                let measured = completed.saturating_sub(*warmup_iterations);
                Some((measured as f64 / total as f64).min(1.0))
            }
            ProgressController::TimeBased { warmup, total, elapsed } => {
                let total = (*total)?;
                if total.is_zero() {
                    return Some(1.0);
                }
                let measured = elapsed.saturating_sub(*warmup);
                Some((measured.as_secs_f64() / total.as_secs_f64()).min(1.0))
            }
        }
    }

    /// Jittered ramp-up wait before this client's first request, for staircase
    /// client start staggering — same `rand::thread_rng` idiom the
    /// redline actor's client-selection code uses.
    pub fn ramp_up_offset(total_clients: usize, client_index: usize, ramp_up_time_period: Duration) -> Duration {
        if total_clients <= 1 || ramp_up_time_period.is_zero() {
            return Duration::ZERO;
        }
        let fraction = client_index as f64 / total_clients as f64;
        Duration::from_secs_f64(ramp_up_time_period.as_secs_f64() * fraction)
    }
}

/// Picks a uniformly random jitter in `[0, max)`, used to avoid thundering-herd
/// request bursts across clients sharing a pacer target.
pub fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let mut rng = rand::thread_rng();
    Duration::from_secs_f64(rng.gen_range(0.0..max.as_secs_f64()))
}
