//! Error types for enginecore.

use std::io;
use std::time::Duration;

/// Errors surfaced by engine core clients.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The worker has permanently stopped. Every later call on the same
    /// client reports this, whatever the proximate failure was.
    #[error("engine core is dead")]
    EngineDead,

    #[error("invalid client configuration: {0}")]
    Config(String),

    #[error("engine core failed to start: {0}")]
    Startup(String),

    #[error("engine core startup timed out after {0:?}")]
    StartupTimeout(Duration),

    /// The worker reported a failure for this call only.
    #[error("utility call `{method}` failed: {message}")]
    Utility {
        method: &'static str,
        message: String,
    },

    /// Error raised by an in-process engine.
    #[error("engine error: {0}")]
    Engine(String),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("`{0}` is not supported by this client")]
    Unsupported(&'static str),

    #[error("engine core client has been shut down")]
    ShutDown,
}

impl ClientError {
    pub fn is_engine_dead(&self) -> bool {
        matches!(self, Self::EngineDead)
    }

    /// Errors after which the serving process should stop taking traffic.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::EngineDead | Self::ShutDown)
    }
}

/// Errors from the worker-side engine loop.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("engine startup failed: {0}")]
    Startup(String),

    #[error("engine failed: {0}")]
    Engine(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

impl From<SpawnError> for ClientError {
    fn from(e: SpawnError) -> Self {
        Self::Startup(e.to_string())
    }
}
