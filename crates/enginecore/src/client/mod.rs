//! Engine core clients.
//!
//! One interface, three topologies:
//! - `InprocClient`: the engine runs on the caller's thread, no IPC
//! - `SyncMpClient`: worker in a separate process (or thread), blocking API
//! - `AsyncMpClient`: worker in a separate process (or thread), async API
//!
//! The multiprocess clients share the same wire protocol, output pump
//! routing, utility correlator and background resource bundle.

mod async_mp;
mod inproc;
pub(crate) mod pump;
mod sync_mp;

use std::collections::BTreeSet;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

pub use async_mp::AsyncMpClient;
pub use inproc::InprocClient;
pub use sync_mp::SyncMpClient;

use crate::bridge::protocol::{
    EngineCoreOutputs, EngineCoreRequest, LoraRequest, UtilityMethod, UtilityValue,
};
use crate::bridge::transport::TransportContext;
use crate::config::Settings;
use crate::correlator::UtilityCorrelator;
use crate::engine::EngineFactory;
use crate::error::ClientError;
use crate::health::EngineHealth;
use crate::launcher::{ThreadLauncher, WorkerLauncher};
use crate::resources::{BackgroundResources, EngineState};

/// Uniform client interface over every topology.
///
/// Each operation has a blocking and an `_async` form with the same
/// semantics. A client that only offers one side returns
/// `ClientError::Unsupported` from the other.
#[async_trait]
pub trait EngineCoreClient: Send + Sync {
    fn add_request(&self, _request: EngineCoreRequest) -> Result<(), ClientError> {
        Err(ClientError::Unsupported("add_request"))
    }

    async fn add_request_async(&self, _request: EngineCoreRequest) -> Result<(), ClientError> {
        Err(ClientError::Unsupported("add_request_async"))
    }

    /// Next batch of generation outputs. Blocks until one is available.
    fn get_output(&self) -> Result<EngineCoreOutputs, ClientError> {
        Err(ClientError::Unsupported("get_output"))
    }

    async fn get_output_async(&self) -> Result<EngineCoreOutputs, ClientError> {
        Err(ClientError::Unsupported("get_output_async"))
    }

    /// Abort requests by id. An empty slice is a no-op.
    fn abort_requests(&self, _request_ids: &[String]) -> Result<(), ClientError> {
        Err(ClientError::Unsupported("abort_requests"))
    }

    async fn abort_requests_async(&self, _request_ids: &[String]) -> Result<(), ClientError> {
        Err(ClientError::Unsupported("abort_requests_async"))
    }

    /// Run a utility method on the engine and wait for its result.
    fn call_utility(&self, _method: UtilityMethod) -> Result<UtilityValue, ClientError> {
        Err(ClientError::Unsupported("call_utility"))
    }

    async fn call_utility_async(
        &self,
        _method: UtilityMethod,
    ) -> Result<UtilityValue, ClientError> {
        Err(ClientError::Unsupported("call_utility_async"))
    }

    /// Release every resource. Idempotent.
    fn shutdown(&self);

    fn health(&self) -> EngineHealth;

    fn is_engine_dead(&self) -> bool {
        self.health().errored
    }

    fn profile(&self, is_start: bool) -> Result<(), ClientError> {
        self.call_utility(UtilityMethod::Profile { is_start })?.into_unit()
    }

    async fn profile_async(&self, is_start: bool) -> Result<(), ClientError> {
        self.call_utility_async(UtilityMethod::Profile { is_start })
            .await?
            .into_unit()
    }

    fn reset_prefix_cache(&self) -> Result<(), ClientError> {
        self.call_utility(UtilityMethod::ResetPrefixCache)?.into_unit()
    }

    async fn reset_prefix_cache_async(&self) -> Result<(), ClientError> {
        self.call_utility_async(UtilityMethod::ResetPrefixCache)
            .await?
            .into_unit()
    }

    fn sleep(&self, level: u32) -> Result<(), ClientError> {
        self.call_utility(UtilityMethod::Sleep { level })?.into_unit()
    }

    async fn sleep_async(&self, level: u32) -> Result<(), ClientError> {
        self.call_utility_async(UtilityMethod::Sleep { level })
            .await?
            .into_unit()
    }

    fn wake_up(&self) -> Result<(), ClientError> {
        self.call_utility(UtilityMethod::WakeUp)?.into_unit()
    }

    async fn wake_up_async(&self) -> Result<(), ClientError> {
        self.call_utility_async(UtilityMethod::WakeUp).await?.into_unit()
    }

    fn execute_dummy_batch(&self) -> Result<(), ClientError> {
        self.call_utility(UtilityMethod::ExecuteDummyBatch)?.into_unit()
    }

    async fn execute_dummy_batch_async(&self) -> Result<(), ClientError> {
        self.call_utility_async(UtilityMethod::ExecuteDummyBatch)
            .await?
            .into_unit()
    }

    fn add_lora(&self, lora: LoraRequest) -> Result<bool, ClientError> {
        self.call_utility(UtilityMethod::AddLora { lora })?.into_bool()
    }

    async fn add_lora_async(&self, lora: LoraRequest) -> Result<bool, ClientError> {
        self.call_utility_async(UtilityMethod::AddLora { lora })
            .await?
            .into_bool()
    }

    fn remove_lora(&self, lora_id: u64) -> Result<bool, ClientError> {
        self.call_utility(UtilityMethod::RemoveLora { lora_id })?.into_bool()
    }

    async fn remove_lora_async(&self, lora_id: u64) -> Result<bool, ClientError> {
        self.call_utility_async(UtilityMethod::RemoveLora { lora_id })
            .await?
            .into_bool()
    }

    fn list_loras(&self) -> Result<BTreeSet<u64>, ClientError> {
        self.call_utility(UtilityMethod::ListLoras)?.into_lora_ids()
    }

    async fn list_loras_async(&self) -> Result<BTreeSet<u64>, ClientError> {
        self.call_utility_async(UtilityMethod::ListLoras)
            .await?
            .into_lora_ids()
    }

    fn pin_lora(&self, lora_id: u64) -> Result<bool, ClientError> {
        self.call_utility(UtilityMethod::PinLora { lora_id })?.into_bool()
    }

    async fn pin_lora_async(&self, lora_id: u64) -> Result<bool, ClientError> {
        self.call_utility_async(UtilityMethod::PinLora { lora_id })
            .await?
            .into_bool()
    }
}

/// Where the engine runs and how the caller talks to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    InProcess,
    SyncMultiprocess,
    AsyncMultiprocess,
}

impl Topology {
    pub fn from_flags(multiprocess: bool, asyncio: bool) -> Result<Self, ClientError> {
        match (multiprocess, asyncio) {
            (false, true) => Err(ClientError::Config(
                "running the engine in-process with an async client is not supported".to_string(),
            )),
            (false, false) => Ok(Self::InProcess),
            (true, false) => Ok(Self::SyncMultiprocess),
            (true, true) => Ok(Self::AsyncMultiprocess),
        }
    }
}

/// How to obtain the engine.
#[derive(Clone)]
pub enum EngineSource {
    /// Build the engine in this process. Multiprocess topologies run it on a
    /// worker thread.
    Factory(Arc<dyn EngineFactory>),
    /// Start an external worker.
    Launcher(Arc<dyn WorkerLauncher>),
}

pub struct ClientConfig {
    pub multiprocess_mode: bool,
    pub asyncio_mode: bool,
    pub startup_timeout: Duration,
    pub engine: EngineSource,
}

impl ClientConfig {
    pub fn new(engine: EngineSource) -> Self {
        let defaults = Settings::default();
        Self {
            multiprocess_mode: defaults.multiprocess,
            asyncio_mode: false,
            startup_timeout: defaults.startup_timeout,
            engine,
        }
    }

    pub fn from_factory(factory: Arc<dyn EngineFactory>) -> Self {
        Self::new(EngineSource::Factory(factory))
    }

    pub fn from_launcher(launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self::new(EngineSource::Launcher(launcher))
    }

    pub fn with_multiprocess(mut self, multiprocess: bool) -> Self {
        self.multiprocess_mode = multiprocess;
        self
    }

    pub fn with_asyncio(mut self, asyncio: bool) -> Self {
        self.asyncio_mode = asyncio;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_settings(mut self, settings: &Settings) -> Self {
        self.multiprocess_mode = settings.multiprocess;
        self.startup_timeout = settings.startup_timeout;
        self
    }

    pub fn topology(&self) -> Result<Topology, ClientError> {
        Topology::from_flags(self.multiprocess_mode, self.asyncio_mode)
    }

    fn launcher(&self) -> Arc<dyn WorkerLauncher> {
        match &self.engine {
            EngineSource::Factory(factory) => Arc::new(ThreadLauncher::new(Arc::clone(factory))),
            EngineSource::Launcher(launcher) => Arc::clone(launcher),
        }
    }
}

/// Build the client for the configured topology.
///
/// The async topology must be called from within a Tokio runtime.
pub fn make_client(config: ClientConfig) -> Result<Box<dyn EngineCoreClient>, ClientError> {
    let topology = config.topology()?;
    tracing::info!(?topology, "Creating engine core client");
    match topology {
        Topology::InProcess => {
            let EngineSource::Factory(factory) = &config.engine else {
                return Err(ClientError::Config(
                    "in-process mode needs an engine factory, not a worker launcher".to_string(),
                ));
            };
            Ok(Box::new(InprocClient::new(factory.as_ref())?))
        }
        Topology::SyncMultiprocess => Ok(Box::new(SyncMpClient::new(
            config.launcher().as_ref(),
            config.startup_timeout,
        )?)),
        Topology::AsyncMultiprocess => Ok(Box::new(AsyncMpClient::new(
            config.launcher().as_ref(),
            config.startup_timeout,
        )?)),
    }
}

/// A started worker with both channels connected.
pub(crate) struct Connection {
    pub(crate) resources: BackgroundResources,
    pub(crate) input: UnixStream,
    pub(crate) output: UnixStream,
}

/// Create the transport, launch the worker, and wait for it to connect.
///
/// On failure everything started so far is torn down before returning.
pub(crate) fn connect_worker(
    launcher: &dyn WorkerLauncher,
    startup_timeout: Duration,
    state: &Arc<EngineState>,
    correlator: &Arc<UtilityCorrelator>,
) -> Result<Connection, ClientError> {
    // One budget covers the startup report and both channel connects.
    let deadline = Instant::now() + startup_timeout;
    let (mut context, endpoints) = TransportContext::create()?;
    let mut resources = BackgroundResources::new(Arc::clone(state), Some(Arc::clone(correlator)));

    let mut worker = launcher.launch(&endpoints)?;
    let started = worker.wait_for_startup(startup_timeout);
    resources.worker = Some(worker);
    started?;

    let remaining = deadline.saturating_duration_since(Instant::now());
    let (input, output) = context.accept(remaining).map_err(|e| {
        ClientError::Startup(format!("worker did not connect to its channels: {}", e))
    })?;
    resources.context = Some(context);
    resources.input_channel = Some(input.try_clone()?);
    resources.output_channel = Some(output.try_clone()?);

    Ok(Connection {
        resources,
        input,
        output,
    })
}
