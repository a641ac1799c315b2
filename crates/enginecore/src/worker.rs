//! Worker side of the engine core protocol.
//!
//! Owns the engine, pulls requests from the request channel, executes them
//! and pushes results to the response channel. The client side (spawning,
//! output routing) lives in `client` and `launcher`.
//!
//! Architecture:
//! - Reader task: request channel → input queue
//! - Writer task: output queue → response channel
//! - Busy loop (single logical thread of control): drain inputs, step the
//!   engine, queue outputs
//!
//! A failing step puts the dead sentinel on the response channel before the
//! worker exits, so the client learns about it without watching the process.

use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{JsonCodec, OutputCodec, RequestCodec};
use crate::bridge::protocol::{
    EngineCoreInput, EngineCoreOutputs, OutputBatch, OutputFrame, StartupReport, UtilityCall,
    UtilityOutput,
};
use crate::bridge::transport::EndpointPair;
use crate::engine::{EngineCore, EngineFactory, apply_utility};
use crate::error::WorkerError;

/// Where a worker reports its startup status.
pub enum ReadyReporter {
    /// Worker process: a `JsonCodec` frame on stdout.
    Stdout,
    /// Worker thread: straight to the launcher.
    Channel(std::sync::mpsc::Sender<StartupReport>),
}

impl ReadyReporter {
    pub async fn report(self, report: StartupReport) -> io::Result<()> {
        tracing::trace!(?report, "Reporting startup status");
        match self {
            Self::Stdout => {
                let mut writer =
                    FramedWrite::new(tokio::io::stdout(), JsonCodec::<StartupReport>::new());
                writer.send(report).await
            }
            Self::Channel(tx) => tx.send(report).map_err(|_| {
                io::Error::new(io::ErrorKind::BrokenPipe, "startup receiver dropped")
            }),
        }
    }
}

/// Run the engine core loop until shutdown, client disconnect, or engine failure.
///
/// Connects both channels, builds the engine, reports readiness, then serves.
pub async fn run_engine_core(
    factory: &dyn EngineFactory,
    endpoints: EndpointPair,
    ready: ReadyReporter,
    shutdown: CancellationToken,
) -> Result<(), WorkerError> {
    let (input, output) = match connect(&endpoints).await {
        Ok(streams) => streams,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to client channels");
            let _ = ready
                .report(StartupReport::Failed {
                    error: format!("failed to connect to client channels: {}", e),
                })
                .await;
            return Err(e.into());
        }
    };
    tracing::debug!(input = %endpoints.input, output = %endpoints.output, "Connected to client channels");

    let mut engine = match factory.build() {
        Ok(engine) => engine,
        Err(e) => {
            let error = format!("{:#}", e);
            tracing::error!(%error, "Engine construction failed");
            let _ = ready
                .report(StartupReport::Failed {
                    error: error.clone(),
                })
                .await;
            return Err(WorkerError::Startup(error));
        }
    };

    ready.report(StartupReport::Ready).await?;
    tracing::info!("Engine core ready");

    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<EngineCoreInput>();
    let reader = tokio::spawn(request_reader_task(
        FramedRead::new(input, RequestCodec::new()),
        input_tx,
    ));

    let (output_tx, output_rx) = mpsc::unbounded_channel::<OutputFrame>();
    let writer = tokio::spawn(output_writer_task(
        FramedWrite::new(output, OutputCodec::new()),
        output_rx,
    ));

    let result = busy_loop(engine.as_mut(), &mut input_rx, &output_tx, &shutdown).await;

    if let Err(ref e) = result {
        tracing::error!(error = %e, "Engine core failed, signalling dead engine");
        let _ = output_tx.send(OutputFrame::EngineDead);
    }
    engine.shutdown();

    // Writer exits once the queue is drained and closed.
    drop(output_tx);
    let _ = writer.await;
    reader.abort();

    tracing::info!("Engine core exiting");
    result
}

/// Process entry point: endpoints from the environment, status on stdout,
/// graceful exit on SIGTERM/SIGINT.
pub async fn run_worker_process(factory: &dyn EngineFactory) -> Result<(), WorkerError> {
    let endpoints = match EndpointPair::from_env() {
        Ok(endpoints) => endpoints,
        Err(e) => {
            let _ = ReadyReporter::Stdout
                .report(StartupReport::Failed {
                    error: e.to_string(),
                })
                .await;
            return Err(e.into());
        }
    };

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_termination().await;
        tracing::info!("Termination signal received");
        token.cancel();
    });

    run_engine_core(factory, endpoints, ReadyReporter::Stdout, shutdown).await
}

async fn wait_for_termination() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = term.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

async fn connect(endpoints: &EndpointPair) -> io::Result<(UnixStream, UnixStream)> {
    let input = endpoints.input.connect().await?;
    let output = endpoints.output.connect().await?;
    Ok((input, output))
}

async fn busy_loop(
    engine: &mut dyn EngineCore,
    input_rx: &mut mpsc::UnboundedReceiver<EngineCoreInput>,
    output_tx: &mpsc::UnboundedSender<OutputFrame>,
    shutdown: &CancellationToken,
) -> Result<(), WorkerError> {
    loop {
        // Nothing to step: block until the client sends something.
        if !engine.has_unfinished_requests() {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested");
                    return Ok(());
                }

                msg = input_rx.recv() => match msg {
                    Some(input) => handle_input(engine, input, output_tx),
                    None => {
                        tracing::info!("Request channel closed (client gone?), exiting");
                        return Ok(());
                    }
                }
            }
        }

        loop {
            match input_rx.try_recv() {
                Ok(input) => handle_input(engine, input, output_tx),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    tracing::info!("Request channel closed (client gone?), exiting");
                    return Ok(());
                }
            }
        }

        if shutdown.is_cancelled() {
            tracing::info!("Shutdown requested");
            return Ok(());
        }

        if engine.has_unfinished_requests() {
            let outputs = step(engine)?;
            if !outputs.is_empty()
                && output_tx
                    .send(OutputFrame::Batch(OutputBatch::Generation(outputs)))
                    .is_err()
            {
                tracing::warn!("Output writer gone, exiting");
                return Ok(());
            }
        }

        // Let the reader and writer tasks make progress between steps.
        tokio::task::yield_now().await;
    }
}

fn step(engine: &mut dyn EngineCore) -> Result<EngineCoreOutputs, WorkerError> {
    match catch_unwind(AssertUnwindSafe(|| engine.step())) {
        Ok(Ok(outputs)) => Ok(outputs),
        Ok(Err(e)) => Err(WorkerError::Engine(format!("{:#}", e))),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(WorkerError::Engine(format!("engine step panicked: {}", message)))
        }
    }
}

fn handle_input(
    engine: &mut dyn EngineCore,
    input: EngineCoreInput,
    output_tx: &mpsc::UnboundedSender<OutputFrame>,
) {
    match input {
        EngineCoreInput::Add(request) => {
            tracing::trace!(request_id = %request.request_id, "Add request");
            engine.add_request(request);
        }
        EngineCoreInput::Abort(request_ids) => {
            tracing::debug!(count = request_ids.len(), "Abort requests");
            engine.abort_requests(&request_ids);
        }
        EngineCoreInput::Utility(UtilityCall { call_id, method }) => {
            let name = method.name();
            let output = match apply_utility(engine, method) {
                Ok(value) => UtilityOutput::success(call_id, value),
                Err(e) => {
                    let message = format!("{:#}", e);
                    tracing::warn!(call_id, method = name, error = %message, "Utility call failed");
                    UtilityOutput::failure(call_id, message)
                }
            };
            let _ = output_tx.send(OutputFrame::Batch(OutputBatch::Utility(output)));
        }
    }
}

async fn request_reader_task(
    mut reader: FramedRead<UnixStream, RequestCodec>,
    tx: mpsc::UnboundedSender<EngineCoreInput>,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(input) => {
                if tx.send(input).is_err() {
                    break;
                }
            }
            // A request that does not decode leaves the stream unusable.
            Err(e) => {
                tracing::error!(error = %e, "Request channel error");
                break;
            }
        }
    }
    tracing::debug!("Request reader task exiting");
}

async fn output_writer_task(
    mut writer: FramedWrite<UnixStream, OutputCodec>,
    mut rx: mpsc::UnboundedReceiver<OutputFrame>,
) {
    while let Some(frame) = rx.recv().await {
        let is_dead = frame == OutputFrame::EngineDead;
        if let Err(e) = writer.send(frame).await {
            tracing::error!(error = %e, "Failed to write output frame");
            break;
        }
        if is_dead {
            break;
        }
    }
    tracing::debug!("Output writer task exiting");
}
