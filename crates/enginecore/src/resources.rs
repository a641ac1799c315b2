//! Shared engine state and the background resource bundle.
//!
//! `BackgroundResources` owns everything a multiprocess client keeps alive
//! besides itself: the transport context, both channel handles, the worker
//! and the output pump. It holds no reference back to the client, so it can
//! be released from `shutdown()` or `Drop` with identical ordering.

use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::bridge::transport::TransportContext;
use crate::correlator::{CloseReason, UtilityCorrelator};
use crate::error::ClientError;
use crate::health::EngineHealth;
use crate::launcher::WorkerHandle;

/// Liveness flags shared by a client, its pump and its resources.
#[derive(Debug, Default)]
pub struct EngineState {
    dead: AtomicBool,
    running: AtomicBool,
    closing: AtomicBool,
}

impl EngineState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set the dead flag. Returns true for the first observer only.
    pub fn mark_dead(&self) -> bool {
        self.running.store(false, Ordering::SeqCst);
        let first = !self.dead.swap(true, Ordering::SeqCst);
        if first {
            tracing::error!("Engine core died");
        }
        first
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub fn mark_running(&self) {
        if !self.is_dead() && !self.is_closing() {
            self.running.store(true, Ordering::SeqCst);
        }
    }

    pub fn mark_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            errored: self.is_dead(),
            is_running: self.running.load(Ordering::SeqCst),
        }
    }

    /// Once the engine is dead, every failure is reported as `EngineDead`.
    pub fn rewrite(&self, err: ClientError) -> ClientError {
        if self.is_dead() {
            ClientError::EngineDead
        } else {
            err
        }
    }

    /// Error for calls made after teardown started.
    pub fn closed_error(&self) -> ClientError {
        if self.is_dead() {
            ClientError::EngineDead
        } else {
            ClientError::ShutDown
        }
    }
}

pub enum PumpHandle {
    Thread(std::thread::JoinHandle<()>),
    Task(tokio::task::JoinHandle<()>),
}

/// One step performed by `BackgroundResources::release`, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Worker,
    OutputChannel,
    OutputPump,
    InputChannel,
    TransportContext,
}

pub struct BackgroundResources {
    pub(crate) context: Option<TransportContext>,
    /// Handles used only to shut the sockets down; the client and pump own
    /// their own clones for I/O.
    pub(crate) output_channel: Option<UnixStream>,
    pub(crate) input_channel: Option<UnixStream>,
    pub(crate) worker: Option<WorkerHandle>,
    pub(crate) pump: Option<PumpHandle>,
    state: Arc<EngineState>,
    correlator: Option<Arc<UtilityCorrelator>>,
}

impl BackgroundResources {
    pub fn new(state: Arc<EngineState>, correlator: Option<Arc<UtilityCorrelator>>) -> Self {
        Self {
            context: None,
            output_channel: None,
            input_channel: None,
            worker: None,
            pump: None,
            state,
            correlator,
        }
    }

    /// Tear everything down: worker, response channel and pump, request
    /// channel, transport context. Pending utility calls then fail.
    ///
    /// Returns the steps performed; a second call performs none.
    pub fn release(&mut self) -> Vec<Teardown> {
        let mut steps = Vec::new();
        self.state.mark_closing();

        if let Some(mut worker) = self.worker.take() {
            tracing::debug!(worker = %worker.describe(), "Stopping engine core worker");
            worker.shutdown();
            steps.push(Teardown::Worker);
        }

        if let Some(output) = self.output_channel.take() {
            if let Err(e) = output.shutdown(Shutdown::Both) {
                tracing::trace!(error = %e, "Response channel already closed");
            }
            steps.push(Teardown::OutputChannel);
        }

        if let Some(pump) = self.pump.take() {
            match pump {
                PumpHandle::Thread(thread) => {
                    if thread.join().is_err() {
                        tracing::warn!("Output pump thread panicked");
                    }
                }
                PumpHandle::Task(task) => task.abort(),
            }
            steps.push(Teardown::OutputPump);
        }

        if let Some(input) = self.input_channel.take() {
            if let Err(e) = input.shutdown(Shutdown::Both) {
                tracing::trace!(error = %e, "Request channel already closed");
            }
            steps.push(Teardown::InputChannel);
        }

        if let Some(mut context) = self.context.take() {
            if let Err(e) = context.cleanup() {
                tracing::warn!(error = %e, "Failed to clean up transport context");
            }
            steps.push(Teardown::TransportContext);
        }

        if let Some(correlator) = &self.correlator {
            correlator.close(CloseReason::ShutDown);
        }

        if !steps.is_empty() {
            tracing::debug!(?steps, "Released engine core resources");
        }
        steps
    }
}

impl Drop for BackgroundResources {
    fn drop(&mut self) {
        self.release();
    }
}
