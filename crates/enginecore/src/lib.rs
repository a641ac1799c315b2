//! enginecore: client/server bridge between a serving front end and an
//! engine core worker.

pub mod bridge;
pub mod client;
pub mod config;
pub mod correlator;
pub mod echo;
pub mod engine;
pub mod error;
pub mod health;
pub mod launcher;
pub mod logging;
pub mod resources;
pub mod worker;

pub use bridge::protocol::{
    EngineCoreOutput, EngineCoreOutputs, EngineCoreRequest, FinishReason, LoraRequest,
    SamplingParams, UtilityMethod, UtilityValue,
};
pub use client::{
    AsyncMpClient, ClientConfig, EngineCoreClient, EngineSource, InprocClient, SyncMpClient,
    Topology, make_client,
};
pub use config::Settings;
pub use echo::EchoEngine;
pub use engine::{EngineCore, EngineFactory};
pub use error::{ClientError, SpawnError, WorkerError};
pub use health::{EngineHealth, WatchdogConfig, terminate_if_errored, watchdog_loop};
pub use launcher::{ProcessLauncher, ThreadLauncher, WorkerHandle, WorkerLauncher};
pub use worker::{run_engine_core, run_worker_process};
