//! Counters the worker thread updates and the HTTP API reads.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub batches: AtomicU64,
    pub chunks_applied: AtomicU64,
    pub samples_applied: AtomicU64,
    pub samples_dropped: AtomicU64,
    pub inference_attempts: AtomicU64,
    pub gate_rejections: AtomicU64,
    pub inferences: AtomicU64,
    pub inference_ms_total: AtomicU64,
    pub suppressed: AtomicU64,
    pub deliveries: AtomicU64,
    pub delivery_failures: AtomicU64,
    pub engine_failures: AtomicU64,
    pub releases: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatsSnapshot {
    pub batches: u64,
    pub chunks_applied: u64,
    pub samples_applied: u64,
    pub samples_dropped: u64,
    pub inference_attempts: u64,
    pub gate_rejections: u64,
    pub inferences: u64,
    pub average_inference_ms: f64,
    pub suppressed: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
    pub engine_failures: u64,
    pub releases: u64,
}

impl WorkerStats {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let inferences = load(&self.inferences);

        WorkerStatsSnapshot {
            batches: load(&self.batches),
            chunks_applied: load(&self.chunks_applied),
            samples_applied: load(&self.samples_applied),
            samples_dropped: load(&self.samples_dropped),
            inference_attempts: load(&self.inference_attempts),
            gate_rejections: load(&self.gate_rejections),
            inferences,
            average_inference_ms: if inferences > 0 {
                load(&self.inference_ms_total) as f64 / inferences as f64
            } else {
                0.0
            },
            suppressed: load(&self.suppressed),
            deliveries: load(&self.deliveries),
            delivery_failures: load(&self.delivery_failures),
            engine_failures: load(&self.engine_failures),
            releases: load(&self.releases),
        }
    }
}
