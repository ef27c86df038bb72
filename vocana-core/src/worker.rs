//! # Stream Worker
//!
//! One dedicated thread per audio stream. The capture side submits batches
//! through a bounded channel and never blocks: a full channel is reported as
//! backpressure and the caller passes that batch through. Frames of one
//! stream are processed strictly in arrival order on the worker thread.
//!
//! Closing a stream fires its cancel signal, which also aborts an in-flight
//! inference wait, then joins the thread. All per-stream state lives on that
//! thread and is dropped with it.

use crossbeam::channel::{self, select, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Result, VocanaError};
use crate::events::DegradationLog;
use crate::inference::{cancel_pair, CancelSignal, CancelTrigger, InferenceClient};
use crate::pipeline::{IngestOutput, Pipeline};
use crate::telemetry::StreamTelemetry;
use crate::transform::TransformEngine;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// One result per submitted batch, in submission order
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutput {
    Processed(Vec<f32>),
    /// Breaker open; carries the submitted samples for pass-through
    Suspended(Vec<f32>),
    Buffering,
    /// Non-finite batch dropped; carries its length
    Rejected(usize),
}

pub struct StreamWorker;

impl StreamWorker {
    /// Build the stream's pipeline and start its thread
    pub fn spawn(
        config: &Config,
        engine: Arc<TransformEngine>,
        client: InferenceClient,
    ) -> Result<StreamHandle> {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let (trigger, signal) = cancel_pair();
        let pipeline = Pipeline::new(id, config, engine, client, signal.clone())?;
        let telemetry = pipeline.telemetry();
        let events = pipeline.events();

        let input_capacity = config.worker.input_queue_batches;
        let (input_tx, input_rx) = channel::bounded::<Vec<f32>>(input_capacity);
        let (output_tx, output_rx) = channel::bounded::<WorkerOutput>(config.worker.output_queue_batches);

        let thread_telemetry = Arc::clone(&telemetry);
        let thread = std::thread::Builder::new()
            .name(format!("vocana-stream-{}", id))
            .spawn(move || run(pipeline, input_rx, output_tx, signal, thread_telemetry))
            .map_err(|e| VocanaError::Io {
                path: format!("vocana-stream-{}", id),
                reason: e.to_string(),
            })?;

        info!("Stream {} worker started", id);

        Ok(StreamHandle {
            id,
            input: Some(input_tx),
            output: output_rx,
            trigger,
            thread: Some(thread),
            telemetry,
            events,
            input_capacity,
        })
    }
}

fn run(
    mut pipeline: Pipeline,
    input: Receiver<Vec<f32>>,
    output: Sender<WorkerOutput>,
    cancel: CancelSignal,
    telemetry: Arc<StreamTelemetry>,
) {
    loop {
        select! {
            recv(input) -> msg => {
                let Ok(batch) = msg else { break };
                let result = match pipeline.ingest(&batch) {
                    Ok(IngestOutput::Processed(samples)) => WorkerOutput::Processed(samples),
                    Ok(IngestOutput::Buffering) => WorkerOutput::Buffering,
                    Ok(IngestOutput::Suspended) => WorkerOutput::Suspended(batch),
                    Ok(IngestOutput::Rejected) => WorkerOutput::Rejected(batch.len()),
                    Err(e) => {
                        error!("Stream {} stopped: {}", pipeline.stream_id(), e);
                        break;
                    }
                };
                match output.try_send(result) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        telemetry.record_handoff_drop();
                        warn!("Stream {} output queue full, dropping batch", pipeline.stream_id());
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            recv(cancel.receiver()) -> _ => break,
        }
    }
    pipeline.close();
    debug!("Stream {} worker exiting", pipeline.stream_id());
}

pub struct StreamHandle {
    id: u64,
    input: Option<Sender<Vec<f32>>>,
    output: Receiver<WorkerOutput>,
    trigger: CancelTrigger,
    thread: Option<JoinHandle<()>>,
    telemetry: Arc<StreamTelemetry>,
    events: DegradationLog,
    input_capacity: usize,
}

impl StreamHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a batch without blocking
    pub fn submit(&self, samples: &[f32]) -> Result<()> {
        let Some(input) = self.input.as_ref() else {
            return Err(VocanaError::StreamClosed);
        };
        match input.try_send(samples.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.telemetry.record_handoff_drop();
                Err(VocanaError::Backpressure {
                    capacity: self.input_capacity,
                })
            }
            Err(TrySendError::Disconnected(_)) => Err(VocanaError::StreamClosed),
        }
    }

    pub fn try_output(&self) -> Option<WorkerOutput> {
        self.output.try_recv().ok()
    }

    pub fn recv_output(&self, timeout: Duration) -> Result<WorkerOutput> {
        match self.output.recv_timeout(timeout) {
            Ok(out) => Ok(out),
            Err(RecvTimeoutError::Timeout) => Err(VocanaError::ResourceExhausted {
                stage: "stream output".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(VocanaError::StreamClosed),
        }
    }

    pub fn telemetry(&self) -> Arc<StreamTelemetry> {
        Arc::clone(&self.telemetry)
    }

    pub fn events(&self) -> DegradationLog {
        self.events.clone()
    }

    /// Cancel in-flight work and join the worker thread
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.trigger.cancel();
        self.input.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Stream {} worker panicked", self.id);
            }
            info!("Stream {} worker joined", self.id);
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{InferenceHost, MockSession, ModelShape};
    use std::time::Instant;

    fn setup(config: &Config) -> (InferenceHost, Arc<TransformEngine>) {
        let engine = Arc::new(TransformEngine::new(&config.stream).unwrap());
        let host = InferenceHost::spawn(
            Box::new(MockSession::new(ModelShape::from_config(config))),
            config.inference.queue_depth,
        )
        .unwrap();
        (host, engine)
    }

    #[test]
    fn test_outputs_arrive_in_order() {
        let mut config = Config::balanced();
        config.inference.timeout_ms = 1000;
        let (host, engine) = setup(&config);
        let handle = StreamWorker::spawn(&config, engine, host.client()).unwrap();

        handle.submit(&[0.0; 240]).unwrap();
        handle.submit(&[0.0; 240]).unwrap();
        handle.submit(&[0.0; 960]).unwrap();

        let timeout = Duration::from_secs(2);
        assert_eq!(handle.recv_output(timeout).unwrap(), WorkerOutput::Buffering);
        match handle.recv_output(timeout).unwrap() {
            WorkerOutput::Processed(out) => assert_eq!(out.len(), 480),
            other => panic!("unexpected {:?}", other),
        }
        match handle.recv_output(timeout).unwrap() {
            WorkerOutput::Processed(out) => assert_eq!(out.len(), 960),
            other => panic!("unexpected {:?}", other),
        }
        handle.close();
    }

    #[test]
    fn test_stream_ids_are_unique() {
        let config = Config::balanced();
        let (host, engine) = setup(&config);
        let a = StreamWorker::spawn(&config, Arc::clone(&engine), host.client()).unwrap();
        let b = StreamWorker::spawn(&config, engine, host.client()).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_full_input_reports_backpressure() {
        let mut config = Config::balanced();
        config.worker.input_queue_batches = 1;
        config.inference.timeout_ms = 2000;
        let engine = Arc::new(TransformEngine::new(&config.stream).unwrap());
        let session = MockSession::new(ModelShape::from_config(&config))
            .with_latency(Duration::from_millis(100));
        let host = InferenceHost::spawn(Box::new(session), 4).unwrap();
        let handle = StreamWorker::spawn(&config, engine, host.client()).unwrap();

        let mut saw_backpressure = false;
        for _ in 0..10 {
            if let Err(VocanaError::Backpressure { capacity }) = handle.submit(&[0.0; 480]) {
                assert_eq!(capacity, 1);
                saw_backpressure = true;
                break;
            }
        }
        assert!(saw_backpressure);
        assert!(handle.telemetry().handoff_drops() >= 1);
    }

    #[test]
    fn test_close_interrupts_slow_inference() {
        let mut config = Config::balanced();
        config.inference.timeout_ms = 10_000;
        let engine = Arc::new(TransformEngine::new(&config.stream).unwrap());
        let session = MockSession::new(ModelShape::from_config(&config))
            .with_latency(Duration::from_millis(300));
        let host = InferenceHost::spawn(Box::new(session), 4).unwrap();
        let handle = StreamWorker::spawn(&config, engine, host.client()).unwrap();

        handle.submit(&[0.0; 480]).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        handle.close();
        // Three stages at 300ms each would take ~900ms without cancellation
        assert!(started.elapsed() < Duration::from_millis(600));
    }
}
