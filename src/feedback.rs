//! Redline feedback actor: ramps client concurrency up while the system under
//! test stays healthy, and scales it back down the moment errors or CPU
//! pressure appear, converging on the highest client count the target can
//! sustain (`max_stable_clients`).
//!
//! Ported closely from the original `FeedbackActor`'s state machine: the
//! same five states, the same `ceil(active * scale_down_pct)` scale-down
//! arithmetic, the same OR'd probe policy (random probability OR a fixed
//! cycle interval) once the scale-up ceiling is reached, and the same
//! "sleep after scale-down, then return to neutral" cooldown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::errors::CoreError;
use crate::messages::{ErrorRecord, FeedbackMessage, FeedbackScalingConfig};
use crate::metrics_store::MetricsStore;
use crate::model::{ClientActivationTable, SharedActivationTable};

const WAKEUP_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_POST_SCALEDOWN_SECONDS: u64 = 30;
const DEFAULT_PROBE_PROBABILITY: f64 = 0.05;
const DEFAULT_PROBE_INTERVAL_CYCLES: u32 = 10;
const DEFAULT_CPU_WINDOW_SECONDS: u64 = 30;
const DEFAULT_CPU_CHECK_INTERVAL_SECONDS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackState {
    Disabled,
    Neutral,
    ScalingUp,
    ScalingDown,
    Sleep,
}

pub struct FeedbackActor {
    state: FeedbackState,
    client_states: SharedActivationTable,
    total_client_count: usize,
    total_active_client_count: usize,
    scale_step: usize,
    scale_down_pct: f64,
    post_scaledown: Duration,
    sleep_start_time: Instant,
    last_error_time: Instant,
    last_scaleup_time: Instant,
    max_stable_clients: usize,
    max_error_threshold: f64,
    probe_probability: f64,
    probe_interval_cycles: u32,
    cycles_since_probe: u32,
    cpu_max_pct: Option<f64>,
    cpu_window: Duration,
    cpu_check_interval: Duration,
    last_cpu_check: Instant,
    metrics_store: Option<Arc<dyn MetricsStore>>,
    test_execution_id: String,
    rng: rand::rngs::ThreadRng,
}

impl FeedbackActor {
    pub fn new(client_states: SharedActivationTable) -> Self {
        let (total_client_count, total_active_client_count) = {
            let table = client_states.read().unwrap();
            let total = table.values().map(|m| m.len()).sum();
            let active = table.values().flat_map(|m| m.values()).filter(|&&active| active).count();
            (total, active)
        };
        let now = Instant::now();
        Self {
            state: FeedbackState::Disabled,
            client_states,
            total_client_count,
            total_active_client_count,
            scale_step: 5,
            scale_down_pct: 0.10,
            post_scaledown: Duration::from_secs(DEFAULT_POST_SCALEDOWN_SECONDS),
            sleep_start_time: now,
            last_error_time: now.checked_sub(Duration::from_secs(DEFAULT_POST_SCALEDOWN_SECONDS)).unwrap_or(now),
            last_scaleup_time: now.checked_sub(Duration::from_secs(DEFAULT_POST_SCALEDOWN_SECONDS)).unwrap_or(now),
            max_stable_clients: 0,
            max_error_threshold: 10_000.0,
            probe_probability: DEFAULT_PROBE_PROBABILITY,
            probe_interval_cycles: DEFAULT_PROBE_INTERVAL_CYCLES,
            cycles_since_probe: 0,
            cpu_max_pct: None,
            cpu_window: Duration::from_secs(DEFAULT_CPU_WINDOW_SECONDS),
            cpu_check_interval: Duration::from_secs(DEFAULT_CPU_CHECK_INTERVAL_SECONDS),
            last_cpu_check: now,
            metrics_store: None,
            test_execution_id: "default".to_string(),
            rng: rand::thread_rng(),
        }
    }

    /// Wires the CPU aggregation query's backing store and the
    /// `test_execution_id` this run's `node-stats` documents are tagged
    /// with. The feedback actor never samples CPU itself; a `ProcfsCpuSampler`
    /// (or equivalent) writes into the same store on its own schedule.
    pub fn with_metrics_store(mut self, store: Arc<dyn MetricsStore>, test_execution_id: impl Into<String>) -> Self {
        self.metrics_store = Some(store);
        self.test_execution_id = test_execution_id.into();
        self
    }

    pub fn state(&self) -> FeedbackState {
        self.state
    }

    pub fn total_active_client_count(&self) -> usize {
        self.total_active_client_count
    }

    pub fn max_stable_clients(&self) -> usize {
        self.max_stable_clients
    }

    fn configure(&mut self, cfg: FeedbackScalingConfig) {
        if let Some(step) = cfg.scale_step {
            self.scale_step = step;
        }
        if let Some(pct) = cfg.scale_down_pct {
            self.scale_down_pct = pct;
        }
        if let Some(secs) = cfg.sleep_seconds {
            self.post_scaledown = Duration::from_secs(secs);
        }
        if let Some(max_clients) = cfg.max_clients {
            self.total_client_count = max_clients;
        }
        if let Some(secs) = cfg.cpu_window_seconds {
            self.cpu_window = Duration::from_secs(secs);
        }
        if let Some(secs) = cfg.cpu_check_interval_seconds {
            self.cpu_check_interval = Duration::from_secs(secs);
        }
        self.cpu_max_pct = cfg.cpu_max_pct;
        info!(
            max_clients = self.total_client_count,
            scale_step = self.scale_step,
            scale_down_pct = self.scale_down_pct,
            sleep_seconds = self.post_scaledown.as_secs(),
            "feedback actor configured"
        );
    }

    /// One tick of the controller, called on `WAKEUP_INTERVAL`: checks CPU
    /// pressure, drains the error queue, and advances the state machine.
    pub fn handle_state(&mut self, errors: &[ErrorRecord]) {
        let now = Instant::now();

        if let (Some(max_cpu), Some(store)) = (self.cpu_max_pct, self.metrics_store.as_ref()) {
            if now.duration_since(self.last_cpu_check) >= self.cpu_check_interval {
                match store.nodes_exceeding_cpu_threshold(&self.test_execution_id, self.cpu_window, max_cpu) {
                    Ok(nodes) if !nodes.is_empty() => {
                        info!(?nodes, limit = max_cpu, "cpu threshold exceeded, triggering scale-down");
                        self.state = FeedbackState::ScalingDown;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "cpu aggregation query failed"),
                }
                self.last_cpu_check = now;
            }
        }

        match self.state {
            FeedbackState::Disabled => {}
            FeedbackState::Sleep => {
                if now.duration_since(self.sleep_start_time) >= self.post_scaledown {
                    debug!("sleep period complete, returning to neutral");
                    self.state = FeedbackState::Neutral;
                    self.sleep_start_time = now;
                }
            }
            _ if !errors.is_empty() => {
                info!(errors = errors.len(), "errors detected, scaling down");
                self.state = FeedbackState::ScalingDown;
                self.scale_down();
                self.last_error_time = now;
            }
            FeedbackState::Neutral => {
                self.max_stable_clients = self.max_stable_clients.max(self.total_active_client_count);
                if now.duration_since(self.last_error_time) >= self.post_scaledown
                    && now.duration_since(self.last_scaleup_time) >= WAKEUP_INTERVAL
                {
                    debug!("no errors recently, scaling up");
                    self.state = FeedbackState::ScalingUp;
                }
            }
            FeedbackState::ScalingUp => {
                self.scale_up();
                self.state = FeedbackState::Neutral;
            }
            FeedbackState::ScalingDown => {
                self.scale_down();
                self.last_error_time = now;
            }
        }
    }

    /// Pauses `ceil(active * scale_down_pct)` randomly chosen active clients
    /// and drops the scale-up ceiling to the new (lower) active count.
    fn scale_down(&mut self) {
        self.max_error_threshold = self.total_active_client_count as f64;
        info!(threshold = self.max_error_threshold, "new max error threshold");

        let clients_to_pause = (self.total_active_client_count as f64 * self.scale_down_pct).ceil() as usize;
        if clients_to_pause == 0 {
            info!("no clients to pause during scale down");
        } else {
            let mut table = self.client_states.write().unwrap();
            let mut active: Vec<(usize, usize)> = table
                .iter()
                .flat_map(|(&worker_id, clients)| {
                    clients
                        .iter()
                        .filter(|&(_, &is_active)| is_active)
                        .map(move |(&client_id, _)| (worker_id, client_id))
                })
                .collect();

            let to_pause = clients_to_pause.min(active.len());
            active.partial_shuffle(&mut self.rng, to_pause);
            for &(worker_id, client_id) in active.iter().take(to_pause) {
                if let Some(clients) = table.get_mut(&worker_id) {
                    clients.insert(client_id, false);
                    self.total_active_client_count -= 1;
                }
            }
            info!(paused = to_pause, "scaling down complete");
        }

        self.state = FeedbackState::Sleep;
        let now = Instant::now();
        self.sleep_start_time = now;
        self.last_scaleup_time = now;
    }

    /// Activates up to `scale_step` paused clients, capped by how far below
    /// `max_error_threshold` the active count currently sits. Once the
    /// ceiling is reached, occasionally probes one client above it anyway —
    /// either at random or after `probe_interval_cycles` consecutive cycles
    /// without a probe — so a transient error doesn't permanently cap
    /// concurrency below the target's real capacity.
    fn scale_up(&mut self) {
        let gap = self.max_error_threshold - self.total_active_client_count as f64;
        let mut max_clients_to_add = (self.scale_step as f64).min(gap.max(0.0)) as i64;
        if gap <= 0.0 {
            max_clients_to_add = 0;
        }

        if max_clients_to_add <= 0 {
            let mut probe = self.rng.gen::<f64>() < self.probe_probability;
            self.cycles_since_probe += 1;
            if self.cycles_since_probe >= self.probe_interval_cycles {
                probe = true;
                self.cycles_since_probe = 0;
            }
            if probe {
                info!(ceiling = self.max_error_threshold, "probing above ceiling, forcing 1 extra client");
                max_clients_to_add = 1;
            } else {
                debug!("ceiling reached, skipping scale up");
                self.last_scaleup_time = Instant::now();
                return;
            }
        }

        let mut table = self.client_states.write().unwrap();
        let mut inactive: Vec<(usize, usize)> = table
            .iter()
            .flat_map(|(&worker_id, clients)| {
                clients
                    .iter()
                    .filter(|&(_, &is_active)| !is_active)
                    .map(move |(&client_id, _)| (worker_id, client_id))
            })
            .collect();
        inactive.shuffle(&mut self.rng);

        let mut activated = 0i64;
        for (worker_id, client_id) in inactive {
            if activated >= max_clients_to_add {
                break;
            }
            if let Some(clients) = table.get_mut(&worker_id) {
                clients.insert(client_id, true);
                self.total_active_client_count += 1;
                activated += 1;
                info!(worker_id, client_id, "unpaused client");
            }
        }

        if activated < max_clients_to_add {
            info!(activated, requested = max_clients_to_add, "not enough inactive clients to activate");
        }

        self.last_scaleup_time = Instant::now();
    }
}

/// Runs the feedback actor loop until `ActorExitRequest`-equivalent shutdown:
/// ticks `handle_state` on `WAKEUP_INTERVAL`, applying `FeedbackMessage`s as
/// they arrive in between ticks.
pub async fn run_feedback_actor(
    mut actor: FeedbackActor,
    mut inbox: mpsc::Receiver<FeedbackMessage>,
    mut error_inbox: mpsc::Receiver<ErrorRecord>,
) -> Result<usize, CoreError> {
    let mut ticker = interval(WAKEUP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut errors = Vec::new();
                while let Ok(err) = error_inbox.try_recv() {
                    errors.push(err);
                }
                actor.handle_state(&errors);
            }
            msg = inbox.recv() => {
                match msg {
                    Some(FeedbackMessage::StartFeedbackActor) => {}
                    Some(FeedbackMessage::ConfigureFeedbackScaling(cfg)) => actor.configure(cfg),
                    Some(FeedbackMessage::EnableFeedbackScaling) => {
                        actor.max_error_threshold = 10_000.0;
                        actor.cycles_since_probe = 0;
                        actor.state = FeedbackState::ScalingUp;
                    }
                    Some(FeedbackMessage::DisableFeedbackScaling) => actor.state = FeedbackState::Disabled,
                    Some(FeedbackMessage::ResetErrorThreshold) => {
                        actor.max_error_threshold = f64::INFINITY;
                        info!("error threshold reset, allowing full scale-up");
                    }
                    None => break,
                }
            }
        }
    }
    info!(max_stable_clients = actor.max_stable_clients, "feedback actor finished");
    Ok(actor.max_stable_clients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::RwLock;

    fn all_active(workers: usize, clients_per_worker: usize) -> SharedActivationTable {
        let table: ClientActivationTable = (0..workers)
            .map(|w| (w, (0..clients_per_worker).map(|c| (c, true)).collect()))
            .collect();
        Arc::new(RwLock::new(table))
    }

    #[test]
    fn scale_down_pauses_ceil_percentage_of_active_clients() {
        let mut actor = FeedbackActor::new(all_active(1, 20));
        actor.scale_down_pct = 0.10;
        actor.scale_down();
        // ceil(20 * 0.10) == 2
        assert_eq!(actor.total_active_client_count(), 18);
        assert_eq!(actor.state(), FeedbackState::Sleep);
    }

    #[test]
    fn scale_up_respects_the_ceiling_set_by_the_last_scale_down() {
        let table = all_active(1, 10);
        // pause 5 to simulate a prior scale-down
        for v in table.write().unwrap().get_mut(&0).unwrap().values_mut().take(5) {
            *v = false;
        }
        let mut actor = FeedbackActor::new(table);
        actor.total_active_client_count = 5;
        actor.max_error_threshold = 7.0;
        actor.scale_step = 10;
        actor.scale_up();
        assert_eq!(actor.total_active_client_count(), 7);
    }

    #[test]
    fn neutral_state_tracks_max_stable_clients() {
        let mut actor = FeedbackActor::new(all_active(1, 4));
        actor.state = FeedbackState::Neutral;
        actor.total_active_client_count = 4;
        actor.handle_state(&[]);
        assert_eq!(actor.max_stable_clients(), 4);
    }

    #[test]
    fn errors_in_any_state_except_disabled_and_sleep_trigger_scale_down() {
        let mut actor = FeedbackActor::new(all_active(1, 10));
        actor.state = FeedbackState::Neutral;
        let errors = vec![ErrorRecord {
            error_type: "transport".into(),
            client_id: Some(3),
            task: Some("t1".into()),
            details: "connection refused".into(),
        }];
        actor.handle_state(&errors);
        assert_eq!(actor.state(), FeedbackState::Sleep);
        assert!(actor.total_active_client_count() < 10);
    }

    #[test]
    fn disabled_state_ignores_errors() {
        let mut actor = FeedbackActor::new(all_active(1, 10));
        assert_eq!(actor.state(), FeedbackState::Disabled);
        let errors = vec![ErrorRecord {
            error_type: "transport".into(),
            client_id: None,
            task: None,
            details: "x".into(),
        }];
        actor.handle_state(&errors);
        assert_eq!(actor.state(), FeedbackState::Disabled);
        assert_eq!(actor.total_active_client_count(), 10);
    }

    #[test]
    fn a_node_exceeding_the_cpu_threshold_triggers_scale_down_even_without_errors() {
        use crate::metrics_store::{InMemoryMetricsStore, NodeStatsDoc};

        let store = Arc::new(InMemoryMetricsStore::new());
        store
            .put_doc(NodeStatsDoc {
                node_name: "host-a".into(),
                test_execution_id: "run-1".into(),
                process_cpu_percent: 98.0,
                recorded_at: Instant::now(),
            })
            .unwrap();

        let mut actor = FeedbackActor::new(all_active(1, 10))
            .with_metrics_store(store as Arc<dyn crate::metrics_store::MetricsStore>, "run-1");
        actor.cpu_max_pct = Some(90.0);
        actor.cpu_check_interval = Duration::from_secs(0);
        actor.state = FeedbackState::Neutral;

        actor.handle_state(&[]);
        assert_eq!(actor.state(), FeedbackState::Sleep);
    }

    #[test]
    fn cpu_below_threshold_does_not_interrupt_a_healthy_neutral_state() {
        use crate::metrics_store::{InMemoryMetricsStore, NodeStatsDoc};

        let store = Arc::new(InMemoryMetricsStore::new());
        store
            .put_doc(NodeStatsDoc {
                node_name: "host-a".into(),
                test_execution_id: "run-1".into(),
                process_cpu_percent: 20.0,
                recorded_at: Instant::now(),
            })
            .unwrap();

        let mut actor = FeedbackActor::new(all_active(1, 10))
            .with_metrics_store(store as Arc<dyn crate::metrics_store::MetricsStore>, "run-1");
        actor.cpu_max_pct = Some(90.0);
        actor.cpu_check_interval = Duration::from_secs(0);
        actor.state = FeedbackState::Neutral;
        actor.total_active_client_count = 10;

        actor.handle_state(&[]);
        assert_eq!(actor.state(), FeedbackState::Neutral);
    }
}
