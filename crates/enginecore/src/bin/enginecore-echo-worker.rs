//! Worker process running the echo engine.
//!
//! Spawned by `ProcessLauncher`; reads its endpoints from
//! `ENGINECORE_ENDPOINTS` and reports startup on stdout.

use std::process;
use std::sync::Arc;

use enginecore::engine::{EngineCore, EngineFactory};
use enginecore::{EchoEngine, logging, run_worker_process};

const FAIL_AFTER_STEPS_ENV: &str = "ENGINECORE_ECHO_FAIL_AFTER_STEPS";
const FAIL_STARTUP_ENV: &str = "ENGINECORE_ECHO_FAIL_STARTUP";

fn echo_factory() -> Result<Arc<dyn EngineFactory>, String> {
    let fail_after_steps = match std::env::var(FAIL_AFTER_STEPS_ENV) {
        Ok(raw) => Some(
            raw.trim()
                .parse::<u64>()
                .map_err(|_| format!("invalid value for {FAIL_AFTER_STEPS_ENV}: {raw:?}"))?,
        ),
        Err(_) => None,
    };
    let fail_startup = std::env::var(FAIL_STARTUP_ENV).ok();

    Ok(Arc::new(move || -> anyhow::Result<Box<dyn EngineCore>> {
        if let Some(reason) = &fail_startup {
            anyhow::bail!("echo engine refused to start: {}", reason);
        }
        let engine = match fail_after_steps {
            Some(steps) => EchoEngine::new().with_fail_after_steps(steps),
            None => EchoEngine::new(),
        };
        Ok(Box::new(engine))
    }))
}

fn main() {
    logging::init_tracing();

    let factory = match echo_factory() {
        Ok(factory) => factory,
        Err(msg) => {
            eprintln!("error: {msg}");
            process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to build runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run_worker_process(factory.as_ref())) {
        tracing::error!(error = %e, "Echo worker exited with error");
        process::exit(1);
    }
}
