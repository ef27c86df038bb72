//! # Degradation Event Log
//!
//! Bounded ring of recent degradation events (substituted features, inference
//! fallbacks, overflows, breaker trips, rejected input). Every event is also
//! emitted through `tracing` at `warn`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Default number of events kept per stream
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationKind {
    FeatureSubstituted,
    InferenceFallback,
    Overflow,
    BreakerTripped,
    InputRejected,
}

impl DegradationKind {
    const ALL: [DegradationKind; 5] = [
        DegradationKind::FeatureSubstituted,
        DegradationKind::InferenceFallback,
        DegradationKind::Overflow,
        DegradationKind::BreakerTripped,
        DegradationKind::InputRejected,
    ];

    fn index(self) -> usize {
        match self {
            DegradationKind::FeatureSubstituted => 0,
            DegradationKind::InferenceFallback => 1,
            DegradationKind::Overflow => 2,
            DegradationKind::BreakerTripped => 3,
            DegradationKind::InputRejected => 4,
        }
    }
}

impl std::fmt::Display for DegradationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DegradationKind::FeatureSubstituted => "feature_substituted",
            DegradationKind::InferenceFallback => "inference_fallback",
            DegradationKind::Overflow => "overflow",
            DegradationKind::BreakerTripped => "breaker_tripped",
            DegradationKind::InputRejected => "input_rejected",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationEvent {
    /// Milliseconds since Unix epoch
    pub timestamp: u64,
    pub stream_id: u64,
    pub frame_index: u64,
    pub kind: DegradationKind,
    pub message: String,
}

struct EventRing {
    entries: VecDeque<DegradationEvent>,
    max_size: usize,
    counts: [u64; 5],
}

impl EventRing {
    fn push(&mut self, event: DegradationEvent) {
        if self.entries.len() >= self.max_size {
            self.entries.pop_front();
        }
        self.counts[event.kind.index()] += 1;
        self.entries.push_back(event);
    }
}

/// Cloneable handle to one stream's degradation ring
#[derive(Clone)]
pub struct DegradationLog {
    stream_id: u64,
    ring: Arc<Mutex<EventRing>>,
}

impl DegradationLog {
    pub fn new(stream_id: u64, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            stream_id,
            ring: Arc::new(Mutex::new(EventRing {
                entries: VecDeque::with_capacity(max_size),
                max_size,
                counts: [0; 5],
            })),
        }
    }

    pub fn record(&self, frame_index: u64, kind: DegradationKind, message: impl Into<String>) {
        let message = message.into();
        warn!(stream = self.stream_id, frame = frame_index, %kind, "{}", message);

        let event = DegradationEvent {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            stream_id: self.stream_id,
            frame_index,
            kind,
            message,
        };
        if let Ok(mut ring) = self.ring.lock() {
            ring.push(event);
        }
    }

    /// Most recent events, newest first
    pub fn recent(&self, count: usize) -> Vec<DegradationEvent> {
        self.ring
            .lock()
            .map(|ring| ring.entries.iter().rev().take(count).cloned().collect())
            .unwrap_or_default()
    }

    /// Total events of one kind ever recorded, including evicted ones
    pub fn count(&self, kind: DegradationKind) -> u64 {
        self.ring.lock().map(|ring| ring.counts[kind.index()]).unwrap_or(0)
    }

    pub fn counts(&self) -> Vec<(DegradationKind, u64)> {
        DegradationKind::ALL
            .iter()
            .map(|&kind| (kind, self.count(kind)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().map(|ring| ring.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn export_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.recent(usize::MAX))
    }
}
