//! Tracing setup.
//!
//! The subscriber is installed once at startup with a reloadable filter, so
//! the level from the configuration file can be applied after the config has
//! been loaded. `RUST_LOG`, when set, always wins.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER: OnceLock<FilterHandle> = OnceLock::new();

/// Dependencies that log per connection or per request at `debug`.
const QUIET_TARGETS: &[&str] = &["hyper", "h2", "tower_http", "redis", "rdkafka"];

/// Installs the global subscriber at `info`.
pub fn init_tracing() {
    init_tracing_with_level("info");
}

pub fn init_tracing_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for(level));
    let (filter_layer, handle) = reload::Layer::new(filter);
    let _ = FILTER.set(handle);

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Switches to the configured `level` unless `RUST_LOG` is set.
pub fn apply_logging_level(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    if let Some(handle) = FILTER.get() {
        if let Err(e) = handle.reload(filter_for(level)) {
            tracing::warn!(error = %e, level, "Failed to apply logging level");
        }
    }
}

/// `level` for our crates, capped at `info` for chatty dependencies.
fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::new(directives(level))
}

fn directives(level: &str) -> String {
    let level = level.to_ascii_lowercase();
    let quiet = match level.as_str() {
        "trace" | "debug" => "info",
        other => other,
    };
    std::iter::once(level.clone())
        .chain(QUIET_TARGETS.iter().map(|target| format!("{target}={quiet}")))
        .collect::<Vec<_>>()
        .join(",")
}
