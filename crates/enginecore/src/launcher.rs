//! Worker launch strategies.
//!
//! A launcher starts a worker that connects to a given endpoint pair and
//! returns a `WorkerHandle` used for the startup handshake and shutdown.
//! `ThreadLauncher` runs the engine loop on a dedicated OS thread (debugging,
//! tests); `ProcessLauncher` spawns a worker binary that calls
//! `run_worker_process`.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{BlockingFramed, JsonCodec};
use crate::bridge::protocol::StartupReport;
use crate::bridge::transport::{ENDPOINTS_ENV, EndpointPair};
use crate::engine::EngineFactory;
use crate::error::{ClientError, SpawnError};
use crate::worker::{ReadyReporter, run_engine_core};

/// Grace period between SIGTERM and SIGKILL for worker processes.
pub const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Extension point for different worker launch strategies.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, endpoints: &EndpointPair) -> Result<WorkerHandle, SpawnError>;
}

/// Runs the engine loop on an OS thread inside this process.
pub struct ThreadLauncher {
    factory: Arc<dyn EngineFactory>,
}

impl ThreadLauncher {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self { factory }
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, endpoints: &EndpointPair) -> Result<WorkerHandle, SpawnError> {
        let factory = Arc::clone(&self.factory);
        let endpoints = endpoints.clone();
        let shutdown = CancellationToken::new();
        let worker_shutdown = shutdown.clone();
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("enginecore-worker".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(StartupReport::Failed {
                            error: format!("failed to build worker runtime: {}", e),
                        });
                        return;
                    }
                };
                let result = runtime.block_on(run_engine_core(
                    factory.as_ref(),
                    endpoints,
                    ReadyReporter::Channel(ready_tx),
                    worker_shutdown,
                ));
                if let Err(e) = result {
                    tracing::error!(error = %e, "Engine core worker thread exited with error");
                }
            })?;

        tracing::info!("Started engine core worker thread");
        Ok(WorkerHandle {
            kind: WorkerKind::Thread {
                thread: Some(thread),
                shutdown,
            },
            startup: Some(ready_rx),
            stopped: false,
        })
    }
}

/// Spawns a worker binary. The endpoint pair travels in `ENGINECORE_ENDPOINTS`.
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, endpoints: &EndpointPair) -> Result<WorkerHandle, SpawnError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(ENDPOINTS_ENV, endpoints.to_env_value()?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdout = child.stdout.take();
        tracing::info!(pid = child.id(), program = %self.program.display(), "Spawned engine core worker");

        // From here on, dropping the handle reaps the child.
        let mut handle = WorkerHandle {
            kind: WorkerKind::Process { child },
            startup: None,
            stopped: false,
        };
        let stdout =
            stdout.ok_or_else(|| SpawnError::Other("worker stdout was not captured".to_string()))?;

        let (ready_tx, ready_rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("enginecore-startup".to_string())
            .spawn(move || {
                let mut reader = BlockingFramed::new(stdout, JsonCodec::<StartupReport>::new());
                match reader.next_frame() {
                    Some(Ok(report)) => {
                        let _ = ready_tx.send(report);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Failed to read worker startup report");
                    }
                    None => {
                        tracing::debug!("Worker stdout closed before startup report");
                    }
                }
            })?;
        handle.startup = Some(ready_rx);
        Ok(handle)
    }
}

enum WorkerKind {
    Thread {
        thread: Option<JoinHandle<()>>,
        shutdown: CancellationToken,
    },
    Process {
        child: Child,
    },
}

/// A running worker. Shutting it down is idempotent and also happens on drop.
pub struct WorkerHandle {
    kind: WorkerKind,
    startup: Option<Receiver<StartupReport>>,
    stopped: bool,
}

impl WorkerHandle {
    /// Wait for the worker's startup report.
    pub fn wait_for_startup(&mut self, timeout: Duration) -> Result<(), ClientError> {
        let rx = self
            .startup
            .take()
            .ok_or_else(|| ClientError::Startup("startup report already consumed".to_string()))?;

        match rx.recv_timeout(timeout) {
            Ok(StartupReport::Ready) => {
                tracing::debug!(worker = %self.describe(), "Worker reported ready");
                Ok(())
            }
            Ok(StartupReport::Failed { error }) => {
                tracing::error!(worker = %self.describe(), %error, "Worker startup failed");
                Err(ClientError::Startup(error))
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::error!(worker = %self.describe(), ?timeout, "Worker startup timed out");
                Err(ClientError::StartupTimeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::Startup(
                "worker exited before signalling readiness".to_string(),
            )),
        }
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            WorkerKind::Thread { .. } => "thread".to_string(),
            WorkerKind::Process { child } => format!("pid {}", child.id()),
        }
    }

    pub fn is_process(&self) -> bool {
        matches!(self.kind, WorkerKind::Process { .. })
    }

    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        match &mut self.kind {
            WorkerKind::Thread { thread, shutdown } => {
                shutdown.cancel();
                if let Some(thread) = thread.take()
                    && thread.join().is_err()
                {
                    tracing::warn!("Engine core worker thread panicked");
                }
                tracing::debug!("Engine core worker thread stopped");
            }
            WorkerKind::Process { child } => terminate_child(child),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn terminate_child(child: &mut Child) {
    if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!(pid = child.id(), ?status, "Worker already exited");
        return;
    }

    send_sigterm(child);

    let deadline = Instant::now() + WORKER_SHUTDOWN_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid = child.id(), ?status, "Worker exited");
                return;
            }
            Ok(None) if Instant::now() < deadline => std::thread::sleep(EXIT_POLL_INTERVAL),
            Ok(None) => {
                tracing::warn!(pid = child.id(), "Worker ignored SIGTERM, killing");
                break;
            }
            Err(e) => {
                tracing::warn!(pid = child.id(), error = %e, "Failed to poll worker, killing");
                break;
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
        tracing::warn!(pid = child.id(), error = %e, "Failed to send SIGTERM to worker");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}
