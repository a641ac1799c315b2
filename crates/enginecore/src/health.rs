//! Engine liveness for the serving front end.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::Settings;

/// Liveness snapshot a front end polls to decide whether to keep serving.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineHealth {
    /// The engine has died. Never goes back to false.
    pub errored: bool,
    /// Startup completed and neither death nor shutdown has happened since.
    pub is_running: bool,
}

impl EngineHealth {
    /// Dead and no longer running: the process should stop taking traffic.
    pub fn is_terminal(&self) -> bool {
        self.errored && !self.is_running
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub interval: Duration,
    /// Keep serving (and failing requests) after the engine died.
    pub keep_alive_on_engine_death: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            keep_alive_on_engine_death: false,
        }
    }
}

impl WatchdogConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            interval: settings.watchdog_interval,
            keep_alive_on_engine_death: settings.keep_alive_on_engine_death,
        }
    }
}

/// Flip the shutdown signal if the engine is dead. Returns whether it did.
pub fn terminate_if_errored(
    health: EngineHealth,
    config: &WatchdogConfig,
    shutdown_tx: &watch::Sender<bool>,
) -> bool {
    if !health.is_terminal() || config.keep_alive_on_engine_death {
        return false;
    }
    if *shutdown_tx.borrow() {
        return false;
    }
    tracing::error!("Engine core has died, shutting down server");
    shutdown_tx.send_replace(true);
    true
}

/// Poll `health` every interval until the engine dies or shutdown starts.
///
/// Returns true if this loop triggered the shutdown.
pub async fn watchdog_loop<F>(
    health: F,
    config: WatchdogConfig,
    shutdown_tx: watch::Sender<bool>,
) -> bool
where
    F: Fn() -> EngineHealth + Send,
{
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if *shutdown_tx.borrow() {
            tracing::debug!("Shutdown already requested, stopping watchdog");
            return false;
        }
        if terminate_if_errored(health(), &config, &shutdown_tx) {
            return true;
        }
    }
}
