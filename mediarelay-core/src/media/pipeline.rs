//! Ordered, single-consumer encoding stage
//!
//! ```text
//!  producer ──offer()──► [input, cap 1] ──► convert + encode ──► [output, cap 2] ──► fan-out
//!                                             (blocking pool)
//! ```
//!
//! The consumer runs on the blocking pool because encoding is CPU bound.
//! Once a frame is accepted into the input queue it is never dropped:
//! [`EncodingPipeline::stop`] closes the input, lets the consumer drain the
//! queue and the encoder's internal backlog, and only then shuts the encoder
//! down. The output queue must keep being read while `stop` runs.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::alert::{panic_message, AlertSink, PanicAlert};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};

use super::encoder::VideoEncoder;
use super::frame::{EncodedSample, Frame};
use super::yuv::YuvConverter;

/// Handle to a running encoding stage
pub struct EncodingPipeline {
    context: String,
    input: Mutex<Option<mpsc::Sender<Frame>>>,
    worker: Mutex<Option<JoinHandle<Box<dyn VideoEncoder>>>>,
    retry_interval: Duration,
    alerts: Arc<dyn AlertSink>,
}

impl EncodingPipeline {
    /// Start the consumer. Returns the pipeline and its output queue.
    pub fn start(
        context: impl Into<String>,
        encoder: Box<dyn VideoEncoder>,
        width: u32,
        height: u32,
        config: &PipelineConfig,
        alerts: Arc<dyn AlertSink>,
    ) -> (Self, mpsc::Receiver<EncodedSample>) {
        let context = context.into();
        let (input_tx, input_rx) = mpsc::channel(config.input_capacity);
        let (output_tx, output_rx) = mpsc::channel(config.output_capacity);

        let worker_context = context.clone();
        let worker = tokio::task::spawn_blocking(move || {
            encode_loop(&worker_context, encoder, input_rx, output_tx, width, height)
        });

        debug!(context = %context, width, height, "Encoding pipeline started");

        let pipeline = Self {
            context,
            input: Mutex::new(Some(input_tx)),
            worker: Mutex::new(Some(worker)),
            retry_interval: config.retry_interval(),
            alerts,
        };
        (pipeline, output_rx)
    }

    /// Producer side of the input queue; `None` once the pipeline is stopping
    pub fn input(&self) -> Option<FrameInput> {
        self.input.lock().as_ref().map(|tx| FrameInput {
            tx: tx.downgrade(),
            retry_interval: self.retry_interval,
        })
    }

    /// Close the input, wait until every accepted frame and the encoder's
    /// backlog reached the output queue, then shut the encoder down.
    ///
    /// Later calls return immediately.
    pub async fn stop(&self) {
        drop(self.input.lock().take());

        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        match worker.await {
            Ok(mut encoder) => {
                if let Err(e) = encoder.shutdown() {
                    error!(context = %self.context, error = %e, "Failed to shut down encoder");
                }
                debug!(context = %self.context, "Encoding pipeline stopped");
            }
            Err(e) if e.is_panic() => {
                self.alerts.report(PanicAlert {
                    service: self.alerts.service_name().to_string(),
                    context: self.context.clone(),
                    scope: "pipeline.encode".to_string(),
                    message: panic_message(e.into_panic().as_ref()),
                });
            }
            Err(e) => warn!(context = %self.context, error = %e, "Encoding worker cancelled"),
        }
    }
}

/// Rate-limited producer access to the pipeline input.
///
/// Holds only a weak reference to the queue so that [`EncodingPipeline::stop`]
/// really closes it.
#[derive(Clone)]
pub struct FrameInput {
    tx: mpsc::WeakSender<Frame>,
    retry_interval: Duration,
}

impl FrameInput {
    /// Push a frame, retrying after a short wait while the queue is full.
    ///
    /// Returns `Ok(false)` when `cancel` fires before the frame was
    /// accepted and [`Error::Closed`] once the pipeline stopped.
    pub async fn offer(&self, mut frame: Frame, cancel: &CancellationToken) -> Result<bool> {
        loop {
            let Some(tx) = self.tx.upgrade() else {
                return Err(Error::Closed);
            };
            match tx.try_send(frame) {
                Ok(()) => return Ok(true),
                Err(TrySendError::Closed(_)) => return Err(Error::Closed),
                Err(TrySendError::Full(rejected)) => frame = rejected,
            }
            drop(tx);

            trace!("Encoder input queue is full, retrying");
            tokio::select! {
                () = cancel.cancelled() => return Ok(false),
                () = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    /// Free slots in the input queue
    pub fn remaining(&self) -> usize {
        self.tx.upgrade().map_or(0, |tx| tx.capacity())
    }
}

fn encode_loop(
    context: &str,
    mut encoder: Box<dyn VideoEncoder>,
    mut input: mpsc::Receiver<Frame>,
    output: mpsc::Sender<EncodedSample>,
    width: u32,
    height: u32,
) -> Box<dyn VideoEncoder> {
    let mut converter = YuvConverter::new(width, height);

    while let Some(frame) = input.blocking_recv() {
        let yuv = match converter.process(&frame.image) {
            Ok(yuv) => yuv,
            Err(e) => {
                warn!(context, error = %e, "Dropping frame that cannot be converted");
                continue;
            }
        };

        match encoder.encode(Some(yuv)) {
            Ok(Some(data)) => emit(
                &output,
                EncodedSample {
                    data,
                    timestamp: frame.timestamp,
                },
            ),
            // buffered inside the encoder
            Ok(None) => trace!(context, timestamp = frame.timestamp, "Frame buffered by encoder"),
            Err(e) => warn!(context, error = %e, "Encoding failed"),
        }
    }

    // input closed: flush the backlog; its timestamps are no longer known
    loop {
        match encoder.encode(None) {
            Ok(Some(data)) => emit(&output, EncodedSample { data, timestamp: 0 }),
            Ok(None) => break,
            Err(e) => {
                warn!(context, error = %e, "Encoder flush failed");
                break;
            }
        }
    }

    encoder
}

fn emit(output: &mpsc::Sender<EncodedSample>, sample: EncodedSample) {
    if output.blocking_send(sample).is_err() {
        debug!("Encoded sample discarded, output queue has no reader");
    }
}
