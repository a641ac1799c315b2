//! Tracing setup shared by front ends and worker processes.
//!
//! Always logs to stderr: worker stdout carries the startup handshake.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_LEVEL_ENV: &str = "ENGINECORE_LOG";

/// Initialize tracing with RUST_LOG, ENGINECORE_LOG and LOG_FORMAT support.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_directives(
            std::env::var(LOG_LEVEL_ENV).ok().as_deref(),
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn default_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!(
        "enginecore={level},enginecore_echo_worker={level}",
        level = level
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_aliases() {
        assert_eq!(
            default_directives(Some("warning")),
            "enginecore=warn,enginecore_echo_worker=warn"
        );
        assert_eq!(
            default_directives(None),
            "enginecore=info,enginecore_echo_worker=info"
        );
        assert_eq!(
            default_directives(Some("loud")),
            "enginecore=info,enginecore_echo_worker=info"
        );
    }
}
