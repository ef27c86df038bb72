//! # Buffer Manager
//!
//! Turns irregular sample batches into overlapping `fft_size` analysis
//! frames, one per hop, while keeping the pending queue bounded.
//!
//! Overflow is decided on the projected size before anything is appended.
//! An overflowing batch drops the oldest excess samples and splices the
//! remainder in with a short linear crossfade. Too many consecutive
//! overflows trip a circuit breaker that suspends ingestion for a cooldown.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{BufferConfig, StreamConfig};
use crate::error::{Result, VocanaError};
use crate::transform::AnalysisFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowInfo {
    /// Queue length the batch would have produced
    pub projected: usize,
    /// Samples discarded to stay within capacity
    pub dropped: usize,
    pub consecutive: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Ingest {
    Ready {
        frames: Vec<AnalysisFrame>,
        overflow: Option<OverflowInfo>,
    },
    /// Breaker open; the batch was not buffered
    Suspended { until: Instant, tripped_now: bool },
}

/// Overflow bookkeeping for one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CircuitBreakerState {
    pub consecutive_overflows: u32,
    pub suspended_until: Option<Instant>,
    pub trips: u64,
}

pub struct BufferManager {
    fft_size: usize,
    hop_size: usize,
    max_samples: usize,
    overflow_threshold: u32,
    cooldown: Duration,
    crossfade: usize,
    queue: VecDeque<f32>,
    /// Tail of the previous frame (`fft_size - hop_size` samples)
    history: Vec<f32>,
    breaker: CircuitBreakerState,
    overflows: u64,
    rejected: u64,
}

impl BufferManager {
    pub fn new(stream: &StreamConfig, buffer: &BufferConfig) -> Result<Self> {
        if stream.hop_size == 0 || stream.hop_size > stream.fft_size {
            return Err(VocanaError::config("hop_size", stream.hop_size, "must be in 1..=fft_size"));
        }
        if buffer.max_buffer_samples < stream.hop_size {
            return Err(VocanaError::config(
                "max_buffer_samples",
                buffer.max_buffer_samples,
                "must hold at least one hop",
            ));
        }
        if buffer.overflow_threshold == 0 {
            return Err(VocanaError::config("overflow_threshold", 0, "must be positive"));
        }

        info!(
            "Buffer manager: capacity={} samples, breaker after {} overflows, cooldown={}ms",
            buffer.max_buffer_samples, buffer.overflow_threshold, buffer.circuit_breaker_cooldown_ms
        );

        Ok(Self {
            fft_size: stream.fft_size,
            hop_size: stream.hop_size,
            max_samples: buffer.max_buffer_samples,
            overflow_threshold: buffer.overflow_threshold,
            cooldown: Duration::from_millis(buffer.circuit_breaker_cooldown_ms),
            crossfade: buffer.crossfade_samples,
            queue: VecDeque::with_capacity(buffer.max_buffer_samples),
            history: vec![0.0; stream.fft_size - stream.hop_size],
            breaker: CircuitBreakerState::default(),
            overflows: 0,
            rejected: 0,
        })
    }

    pub fn append(&mut self, samples: &[f32]) -> Result<Ingest> {
        self.append_at(samples, Instant::now())
    }

    /// Append with an explicit clock reading
    pub fn append_at(&mut self, samples: &[f32], now: Instant) -> Result<Ingest> {
        if let Some(until) = self.breaker.suspended_until {
            if now < until {
                return Ok(Ingest::Suspended {
                    until,
                    tripped_now: false,
                });
            }
            info!("Circuit breaker cooldown elapsed, resuming ingestion");
            debug!(
                "Resuming with {} consecutive overflows carried over; the next good append resets it",
                self.breaker.consecutive_overflows
            );
            self.breaker.suspended_until = None;
        }

        if let Some(index) = samples.iter().position(|s| !s.is_finite()) {
            self.rejected += 1;
            return Err(VocanaError::InputValidation {
                reason: format!("non-finite sample at index {} of {}", index, samples.len()),
            });
        }

        let projected = self.queue.len() + samples.len();
        let overflow = if projected > self.max_samples {
            self.overflows += 1;
            self.breaker.consecutive_overflows += 1;
            let consecutive = self.breaker.consecutive_overflows;

            if consecutive >= self.overflow_threshold {
                return Ok(self.trip(now));
            }

            let dropped = self.splice_with_drop(samples, projected - self.max_samples);
            warn!(
                "Buffer overflow: projected {} > {}, dropped {} samples ({} consecutive)",
                projected, self.max_samples, dropped, consecutive
            );
            Some(OverflowInfo {
                projected,
                dropped,
                consecutive,
            })
        } else {
            self.breaker.consecutive_overflows = 0;
            self.queue.extend(samples.iter().copied());
            None
        };

        let frames = self.drain_frames();
        debug!("buffer: {} frames ready, {} samples pending", frames.len(), self.queue.len());
        Ok(Ingest::Ready { frames, overflow })
    }

    /// Drop the oldest `excess` samples across queue and batch, then join
    /// what is left with a crossfade. Returns the number of samples discarded.
    fn splice_with_drop(&mut self, samples: &[f32], excess: usize) -> usize {
        let from_queue = excess.min(self.queue.len());
        self.queue.drain(..from_queue);
        let from_batch = (excess - from_queue).min(samples.len());
        let incoming = &samples[from_batch..];

        let xf = self.crossfade.min(self.queue.len()).min(incoming.len());
        if xf > 0 {
            // Blend the queue tail into the incoming head; the overlap merges
            let start = self.queue.len() - xf;
            for i in 0..xf {
                let fade_in = (i + 1) as f32 / (xf + 1) as f32;
                let old = self.queue[start + i];
                self.queue[start + i] = old * (1.0 - fade_in) + incoming[i] * fade_in;
            }
            self.queue.extend(incoming[xf..].iter().copied());
        } else {
            // Nothing left to blend with: fade the incoming head in from silence
            let ramp = self.crossfade.min(incoming.len());
            self.queue.extend(incoming.iter().enumerate().map(|(i, &s)| {
                if i < ramp {
                    s * (i + 1) as f32 / (ramp + 1) as f32
                } else {
                    s
                }
            }));
        }

        from_queue + from_batch + xf
    }

    fn trip(&mut self, now: Instant) -> Ingest {
        let until = now + self.cooldown;
        self.breaker.suspended_until = Some(until);
        self.breaker.trips += 1;
        self.queue.clear();
        self.history.fill(0.0);
        warn!(
            "Circuit breaker tripped after {} consecutive overflows; suspended for {:?}",
            self.breaker.consecutive_overflows, self.cooldown
        );
        Ingest::Suspended {
            until,
            tripped_now: true,
        }
    }

    fn drain_frames(&mut self) -> Vec<AnalysisFrame> {
        let count = self.queue.len() / self.hop_size;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let mut window = Vec::with_capacity(self.fft_size);
            window.extend_from_slice(&self.history);
            window.extend(self.queue.drain(..self.hop_size));
            let tail = window.len() - self.history.len();
            self.history.copy_from_slice(&window[tail..]);
            frames.push(AnalysisFrame::new(window));
        }
        frames
    }

    /// Samples waiting for a full hop
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.max_samples
    }

    pub fn breaker(&self) -> CircuitBreakerState {
        self.breaker
    }

    pub fn is_suspended(&self, now: Instant) -> bool {
        self.breaker.suspended_until.is_some_and(|until| now < until)
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflows
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }

    /// Discard pending samples and history; breaker state is kept
    pub fn clear(&mut self) {
        self.queue.clear();
        self.history.fill(0.0);
    }
}
