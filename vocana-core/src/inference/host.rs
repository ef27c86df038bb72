//! Dedicated inference thread and the per-stream client handle.
//!
//! One [`InferenceHost`] owns the session and runs calls one at a time, so a
//! backend that is not safe for concurrent calls can still serve many
//! streams. Each call carries its own reply channel; a caller that times out
//! or is cancelled simply stops listening and the late reply is dropped.

use crossbeam::channel::{self, select, Receiver, Sender, TryRecvError, TrySendError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

use super::{InferenceSession, Stage, TensorMap};
use crate::error::{Result, VocanaError};

struct Request {
    stage: Stage,
    inputs: TensorMap,
    reply: Sender<Result<TensorMap>>,
}

pub struct InferenceHost {
    requests: Sender<Request>,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    queue_depth: usize,
}

impl InferenceHost {
    pub fn spawn(session: Box<dyn InferenceSession>, queue_depth: usize) -> Result<Self> {
        let queue_depth = queue_depth.max(1);
        let (requests, request_rx) = channel::bounded::<Request>(queue_depth);
        let (shutdown, shutdown_rx) = channel::bounded::<()>(0);
        let backend = session.backend().to_string();

        let thread = std::thread::Builder::new()
            .name("vocana-inference".to_string())
            .spawn(move || serve(session, request_rx, shutdown_rx))
            .map_err(|e| VocanaError::Io {
                path: "vocana-inference".to_string(),
                reason: e.to_string(),
            })?;

        info!("Inference host started: backend={}, queue_depth={}", backend, queue_depth);

        Ok(Self {
            requests,
            shutdown: Some(shutdown),
            thread: Some(thread),
            queue_depth,
        })
    }

    pub fn client(&self) -> InferenceClient {
        InferenceClient {
            requests: self.requests.clone(),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    /// Stop the thread after the call in progress, if any
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Inference host thread panicked");
            }
        }
    }
}

impl Drop for InferenceHost {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(mut session: Box<dyn InferenceSession>, requests: Receiver<Request>, shutdown: Receiver<()>) {
    loop {
        select! {
            recv(requests) -> msg => {
                let Ok(request) = msg else { break };
                let started = Instant::now();
                let result = session.run(request.stage, &request.inputs);
                trace!("stage {} ran in {:?}", request.stage, started.elapsed());
                // The caller may have given up already
                let _ = request.reply.send(result);
            }
            recv(shutdown) -> _ => break,
        }
    }
    debug!("Inference host stopped");
}

/// Cloneable handle used by streams to submit stage calls
#[derive(Clone)]
pub struct InferenceClient {
    requests: Sender<Request>,
}

impl InferenceClient {
    /// Run one stage, waiting at most `timeout` and aborting on `cancel`
    pub fn run(
        &self,
        stage: Stage,
        inputs: TensorMap,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<TensorMap> {
        let exhausted = || VocanaError::ResourceExhausted {
            stage: stage.name().to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };

        if cancel.is_cancelled() {
            return Err(VocanaError::Cancelled);
        }

        let (reply, reply_rx) = channel::bounded(1);
        match self.requests.try_send(Request {
            stage,
            inputs,
            reply,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(exhausted()),
            Err(TrySendError::Disconnected(_)) => {
                return Err(VocanaError::runtime(stage.name(), "inference host stopped"))
            }
        }

        let deadline = channel::after(timeout);
        select! {
            recv(reply_rx) -> msg => match msg {
                Ok(result) => result,
                Err(_) => Err(VocanaError::runtime(stage.name(), "inference host dropped the request")),
            },
            recv(cancel.rx) -> _ => Err(VocanaError::Cancelled),
            recv(deadline) -> _ => Err(exhausted()),
        }
    }
}

/// Receiving side of a stream's teardown signal
///
/// The signal fires when the matching [`CancelTrigger`] is cancelled or
/// dropped; nothing is ever sent on the channel.
#[derive(Clone)]
pub struct CancelSignal {
    rx: Receiver<()>,
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        Self {
            rx: channel::never(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

pub struct CancelTrigger {
    tx: Option<Sender<()>>,
}

impl CancelTrigger {
    pub fn cancel(&mut self) {
        self.tx.take();
    }
}

pub fn cancel_pair() -> (CancelTrigger, CancelSignal) {
    let (tx, rx) = channel::bounded(0);
    (CancelTrigger { tx: Some(tx) }, CancelSignal { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::inference::{MockSession, ModelShape, Tensor};
    use std::sync::Arc;

    fn encoder_inputs(shape: &ModelShape) -> TensorMap {
        let mut inputs = TensorMap::new();
        inputs.insert(
            "feat_erb".to_string(),
            Arc::new(Tensor::zeros(vec![1, 1, 1, shape.erb_bands])),
        );
        inputs.insert(
            "feat_spec".to_string(),
            Arc::new(Tensor::zeros(vec![1, 2, 1, shape.df_bins])),
        );
        inputs
    }

    #[test]
    fn test_round_trip_through_host() {
        let shape = ModelShape::from_config(&Config::balanced());
        let host = InferenceHost::spawn(Box::new(MockSession::new(shape)), 4).unwrap();
        let client = host.client();

        let out = client
            .run(
                Stage::Encoder,
                encoder_inputs(&shape),
                Duration::from_millis(500),
                &CancelSignal::never(),
            )
            .unwrap();
        assert_eq!(out["emb"].shape(), &[1, 1, shape.embedding_dim]);
        host.shutdown();
    }

    #[test]
    fn test_timeout_yields_resource_exhausted() {
        let shape = ModelShape::from_config(&Config::balanced());
        let session = MockSession::new(shape).with_latency(Duration::from_millis(200));
        let host = InferenceHost::spawn(Box::new(session), 4).unwrap();

        let err = host
            .client()
            .run(
                Stage::Encoder,
                encoder_inputs(&shape),
                Duration::from_millis(5),
                &CancelSignal::never(),
            )
            .unwrap_err();
        assert!(matches!(err, VocanaError::ResourceExhausted { .. }));
    }

    #[test]
    fn test_cancel_interrupts_wait() {
        let shape = ModelShape::from_config(&Config::balanced());
        let session = MockSession::new(shape).with_latency(Duration::from_millis(500));
        let host = InferenceHost::spawn(Box::new(session), 4).unwrap();
        let client = host.client();
        let (mut trigger, signal) = cancel_pair();

        let waiter = std::thread::spawn(move || {
            let started = Instant::now();
            let result = client.run(
                Stage::Encoder,
                encoder_inputs(&shape),
                Duration::from_secs(5),
                &signal,
            );
            (result, started.elapsed())
        });

        std::thread::sleep(Duration::from_millis(20));
        trigger.cancel();
        let (result, elapsed) = waiter.join().unwrap();
        assert_eq!(result.unwrap_err(), VocanaError::Cancelled);
        assert!(elapsed < Duration::from_millis(400));
    }

    #[test]
    fn test_cancel_signal_state() {
        let (mut trigger, signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        trigger.cancel();
        assert!(signal.is_cancelled());
        assert!(!CancelSignal::never().is_cancelled());
    }

    #[test]
    fn test_stopped_host_reports_runtime_error() {
        let shape = ModelShape::from_config(&Config::balanced());
        let host = InferenceHost::spawn(Box::new(MockSession::new(shape)), 1).unwrap();
        let client = host.client();
        host.shutdown();

        let err = client
            .run(
                Stage::Encoder,
                encoder_inputs(&shape),
                Duration::from_millis(50),
                &CancelSignal::never(),
            )
            .unwrap_err();
        assert!(matches!(err, VocanaError::InferenceRuntime { .. }));
    }
}
