//! # Telemetry Module
//!
//! Per-stream counters exposed to observability collaborators. Counters are
//! plain atomics so the audio path never blocks on them; only the rolling
//! latency window sits behind a lock.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Maximum number of latency samples to keep
const LATENCY_SAMPLE_WINDOW: usize = 1000;

/// Latency statistics in microseconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    pub last_us: u64,
    pub avg_us: f64,
    pub p99_us: f64,
    pub max_us: f64,
    pub min_us: f64,
}

/// Serializable point-in-time view of one stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Timestamp of snapshot (ms since Unix epoch)
    pub timestamp: u64,
    pub stream_id: u64,
    pub frames_processed: u64,
    pub overflow_count: u64,
    pub breaker_trips: u64,
    pub inference_failures: u64,
    pub inference_timeouts: u64,
    pub feature_substitutions: u64,
    pub rejected_batches: u64,
    pub handoff_drops: u64,
    pub latency: LatencyStats,
    pub uptime_seconds: u64,
}

/// Lock-free counters for one audio stream
pub struct StreamTelemetry {
    stream_id: u64,
    frames_processed: AtomicU64,
    overflow_count: AtomicU64,
    breaker_trips: AtomicU64,
    inference_failures: AtomicU64,
    inference_timeouts: AtomicU64,
    feature_substitutions: AtomicU64,
    rejected_batches: AtomicU64,
    handoff_drops: AtomicU64,
    last_latency_us: AtomicU64,
    latency_samples: RwLock<VecDeque<u64>>,
    start_time: Instant,
}

impl StreamTelemetry {
    pub fn new(stream_id: u64) -> Arc<Self> {
        Arc::new(Self {
            stream_id,
            frames_processed: AtomicU64::new(0),
            overflow_count: AtomicU64::new(0),
            breaker_trips: AtomicU64::new(0),
            inference_failures: AtomicU64::new(0),
            inference_timeouts: AtomicU64::new(0),
            feature_substitutions: AtomicU64::new(0),
            rejected_batches: AtomicU64::new(0),
            handoff_drops: AtomicU64::new(0),
            last_latency_us: AtomicU64::new(0),
            latency_samples: RwLock::new(VecDeque::with_capacity(LATENCY_SAMPLE_WINDOW)),
            start_time: Instant::now(),
        })
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Record one processed frame and its latency
    pub fn record_frame(&self, latency_us: u64) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.last_latency_us.store(latency_us, Ordering::Relaxed);
        if let Ok(mut samples) = self.latency_samples.write() {
            if samples.len() >= LATENCY_SAMPLE_WINDOW {
                samples.pop_front();
            }
            samples.push_back(latency_us);
        }
    }

    pub fn record_overflow(&self) {
        self.overflow_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_trip(&self) {
        self.breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inference_failure(&self, timed_out: bool) {
        self.inference_failures.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.inference_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_feature_substitution(&self) {
        self.feature_substitutions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_batch(&self) {
        self.rejected_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handoff_drop(&self) {
        self.handoff_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn breaker_trips(&self) -> u64 {
        self.breaker_trips.load(Ordering::Relaxed)
    }

    pub fn inference_failures(&self) -> u64 {
        self.inference_failures.load(Ordering::Relaxed)
    }

    pub fn feature_substitutions(&self) -> u64 {
        self.feature_substitutions.load(Ordering::Relaxed)
    }

    pub fn rejected_batches(&self) -> u64 {
        self.rejected_batches.load(Ordering::Relaxed)
    }

    pub fn handoff_drops(&self) -> u64 {
        self.handoff_drops.load(Ordering::Relaxed)
    }

    pub fn last_latency_us(&self) -> u64 {
        self.last_latency_us.load(Ordering::Relaxed)
    }

    /// Get complete telemetry snapshot
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            stream_id: self.stream_id,
            frames_processed: self.frames_processed(),
            overflow_count: self.overflow_count(),
            breaker_trips: self.breaker_trips(),
            inference_failures: self.inference_failures(),
            inference_timeouts: self.inference_timeouts.load(Ordering::Relaxed),
            feature_substitutions: self.feature_substitutions(),
            rejected_batches: self.rejected_batches(),
            handoff_drops: self.handoff_drops(),
            latency: self.latency_stats(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Calculate latency statistics from samples
    fn latency_stats(&self) -> LatencyStats {
        let last_us = self.last_latency_us();
        let Ok(samples) = self.latency_samples.read() else {
            return LatencyStats { last_us, ..Default::default() };
        };
        if samples.is_empty() {
            return LatencyStats { last_us, ..Default::default() };
        }

        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();

        let sum: u64 = sorted.iter().sum();
        let p99_idx = ((sorted.len() as f64 * 0.99) as usize).min(sorted.len() - 1);

        LatencyStats {
            last_us,
            avg_us: sum as f64 / sorted.len() as f64,
            p99_us: sorted[p99_idx] as f64,
            max_us: *sorted.last().unwrap_or(&0) as f64,
            min_us: *sorted.first().unwrap_or(&0) as f64,
        }
    }
}
