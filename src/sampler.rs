//! Bounded, lossy sample buffering.
//!
//! Executors push completed samples onto a `Sampler` as they finish; a worker
//! drains it on its flush interval and ships the batch to the coordinator as
//! an `UpdateSamples` message. The buffer is bounded and lossy: a full buffer
//! drops the incoming sample rather than blocking the calling executor, the
//! same trade-off `ThroughputTracker`'s callers already accept for metrics
//! bookkeeping over exactness under load.

use std::sync::Mutex;

use tracing::warn;

use crate::model::Sample;

/// A named timing sampled for profiling purposes, independent of the
/// benchmark-result `Sample` stream.
#[derive(Debug, Clone)]
pub struct ProfileSample {
    pub task_name: String,
    pub label: String,
    pub duration_s: f64,
}

/// Fixed-capacity sample buffer. `push` never blocks: once `capacity` samples
/// are queued it drops the newest one and counts the drop.
pub struct Sampler {
    capacity: usize,
    samples: Mutex<Vec<Sample>>,
    profile_samples: Mutex<Vec<ProfileSample>>,
    dropped: std::sync::atomic::AtomicU64,
}

impl Sampler {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: Mutex::new(Vec::with_capacity(capacity.min(1024))),
            profile_samples: Mutex::new(Vec::new()),
            dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Appends a sample, dropping it (and logging) if the buffer is full.
    pub fn add(&self, sample: Sample) {
        let mut guard = self.samples.lock().unwrap();
        if guard.len() >= self.capacity {
            self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            warn!(task = %sample.task_name, "sample buffer full, dropping sample");
            return;
        }
        guard.push(sample);
    }

    pub fn add_profile(&self, sample: ProfileSample) {
        let mut guard = self.profile_samples.lock().unwrap();
        if guard.len() >= self.capacity {
            self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        }
        guard.push(sample);
    }

    /// Drains and returns everything buffered so far, leaving the buffer empty.
    pub fn drain(&self) -> (Vec<Sample>, Vec<ProfileSample>) {
        let samples = std::mem::take(&mut *self.samples.lock().unwrap());
        let profile = std::mem::take(&mut *self.profile_samples.lock().unwrap());
        (samples, profile)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
