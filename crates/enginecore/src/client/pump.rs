//! Output pump: drains the response channel and routes each frame.
//!
//! Utility results go to the correlator, generation batches to the output
//! queue. The dead sentinel, EOF, and channel errors end the pump; unless the
//! client is shutting down they also mark the engine dead and fail every
//! pending utility call.

use std::io;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::codec::FramedRead;

use crate::bridge::codec::{BlockingFramed, OutputCodec};
use crate::bridge::protocol::{EngineCoreOutputs, OutputBatch, OutputFrame};
use crate::correlator::{CloseReason, UtilityCorrelator};
use crate::error::ClientError;
use crate::resources::EngineState;

pub(crate) type OutputItem = Result<EngineCoreOutputs, ClientError>;

/// Consumer side of the output queue.
pub(crate) trait OutputSink: Send + 'static {
    /// Returns false once the consumer is gone.
    fn push(&self, item: OutputItem) -> bool;
}

impl OutputSink for std::sync::mpsc::Sender<OutputItem> {
    fn push(&self, item: OutputItem) -> bool {
        self.send(item).is_ok()
    }
}

impl OutputSink for tokio::sync::mpsc::UnboundedSender<OutputItem> {
    fn push(&self, item: OutputItem) -> bool {
        self.send(item).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// Routing shared by the blocking pump thread and the async pump task.
pub(crate) struct OutputRouter<S> {
    state: Arc<EngineState>,
    correlator: Arc<UtilityCorrelator>,
    sink: S,
}

impl<S: OutputSink> OutputRouter<S> {
    pub(crate) fn new(state: Arc<EngineState>, correlator: Arc<UtilityCorrelator>, sink: S) -> Self {
        Self {
            state,
            correlator,
            sink,
        }
    }

    pub(crate) fn on_frame(&self, frame: OutputFrame) -> Flow {
        match frame {
            OutputFrame::Batch(OutputBatch::Utility(output)) => {
                self.correlator.resolve(output);
                Flow::Continue
            }
            OutputFrame::Batch(OutputBatch::Generation(outputs)) => {
                if !self.sink.push(Ok(outputs)) {
                    tracing::trace!("Output queue consumer gone, dropping batch");
                }
                Flow::Continue
            }
            OutputFrame::Malformed { call_id, error } => {
                let message = format!("malformed output frame: {}", error);
                // A reply we can attribute goes to its caller, not the queue.
                if let Some(call_id) = call_id
                    && self
                        .correlator
                        .fail(call_id, ClientError::Protocol(message.clone()))
                {
                    return Flow::Continue;
                }
                self.sink.push(Err(ClientError::Protocol(message)));
                Flow::Continue
            }
            OutputFrame::EngineDead => {
                tracing::error!("Engine core reported a fatal error");
                self.fail(ClientError::EngineDead);
                Flow::Stop
            }
        }
    }

    pub(crate) fn on_error(&self, error: io::Error) -> Flow {
        if self.state.is_closing() {
            tracing::debug!(error = %error, "Response channel closed during shutdown");
            self.correlator.close(CloseReason::ShutDown);
        } else {
            tracing::error!(error = %error, "Response channel failed");
            self.fail(ClientError::Transport(error));
        }
        Flow::Stop
    }

    pub(crate) fn on_eof(&self) -> Flow {
        if self.state.is_closing() {
            tracing::debug!("Response channel closed during shutdown");
            self.correlator.close(CloseReason::ShutDown);
        } else {
            tracing::error!("Engine core closed the response channel unexpectedly");
            self.fail(ClientError::EngineDead);
        }
        Flow::Stop
    }

    fn fail(&self, error: ClientError) {
        self.state.mark_dead();
        self.sink.push(Err(error));
        self.correlator.close(CloseReason::EngineDead);
    }
}

/// Blocking pump, run on a dedicated thread.
pub(crate) fn run_blocking_pump<S: OutputSink>(
    mut reader: BlockingFramed<UnixStream, OutputCodec>,
    router: OutputRouter<S>,
) {
    loop {
        let flow = match reader.next_frame() {
            Some(Ok(frame)) => router.on_frame(frame),
            Some(Err(e)) => router.on_error(e),
            None => router.on_eof(),
        };
        if flow == Flow::Stop {
            break;
        }
    }
    tracing::debug!("Output pump thread exiting");
}

/// Async pump, run as a tokio task.
pub(crate) async fn run_async_pump<S: OutputSink>(
    mut reader: FramedRead<tokio::net::UnixStream, OutputCodec>,
    router: OutputRouter<S>,
) {
    loop {
        let flow = match reader.next().await {
            Some(Ok(frame)) => router.on_frame(frame),
            Some(Err(e)) => router.on_error(e),
            None => router.on_eof(),
        };
        if flow == Flow::Stop {
            break;
        }
    }
    tracing::debug!("Output pump task exiting");
}
