//! Logging setup
//!
//! One `tracing-subscriber` registry for the whole process. Debug builds get
//! pretty terminal output; release builds get JSON lines carrying the current
//! span, so every line logged inside a run has its `task_queue`, `session_id`
//! and `run_id`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Dependencies that are chatty at `info` (per-query and per-connection logs)
const QUIET_TARGETS: &[&str] = &["sqlx", "hyper", "reqwest", "rustls"];

/// Filter directives for `level`: the level applies to anvil, dependencies
/// listed in [`QUIET_TARGETS`] are held at `warn` unless `level` is quieter.
pub fn filter_directives(level: &str) -> String {
    let level = level.trim().to_ascii_lowercase();
    let dependency_level = match level.as_str() {
        "error" | "off" => level.as_str(),
        _ => "warn",
    };

    let mut directives = vec![level.clone(), format!("anvil_engine={}", level)];
    directives.extend(
        QUIET_TARGETS
            .iter()
            .map(|target| format!("{}={}", target, dependency_level)),
    );
    directives.join(",")
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `log_level`. Calling this twice is harmless.
pub fn init_telemetry_with_level(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(log_level)));

    #[cfg(debug_assertions)]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(false))
            .try_init()
            .ok();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true).with_span_list(false))
            .try_init()
            .ok();
    }
}
