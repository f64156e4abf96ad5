use std::{env, sync::Arc};

use profiler_auth::{AuthorizationGate, SessionCache, TokenValidator};
use profiler_server::config::loader::{DEFAULT_CONFIG_FILE, load_config};
use profiler_server::{
    AppState, AuthEventHandler, ProfilerServer, Supervisor, create_session_store, observability,
    server::shutdown_signal, spawn_consumer,
};

/// Where the configuration file path came from.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    Flag,
    Environment,
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Flag => "--config",
            Self::Environment => "PROFILER_CONFIG",
            Self::Default => "default",
        })
    }
}

#[tokio::main]
async fn main() {
    match dotenvy::dotenv() {
        Err(e) if !e.not_found() => eprintln!("Warning: failed to read .env: {e}"),
        _ => {}
    }

    observability::init_tracing();

    let (path, source) = config_path();
    let cfg = load_config(path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Configuration error: {e}");
        std::process::exit(2);
    });
    tracing::info!(
        path = path.as_deref().unwrap_or(DEFAULT_CONFIG_FILE),
        %source,
        "Configuration loaded"
    );
    observability::apply_logging_level(&cfg.logging.level);

    if let Err(err) = run(cfg).await {
        tracing::error!(error = %err, "Server error");
        eprintln!("Server error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cfg: profiler_server::AppConfig) -> anyhow::Result<()> {
    let store = create_session_store(&cfg).await;
    let cache = Arc::new(SessionCache::new());
    let validator = TokenValidator::from_config(&cfg.auth);
    let gate = Arc::new(AuthorizationGate::new(
        validator,
        Arc::clone(&cache),
        Arc::clone(&store),
    ));

    let mut supervisor = Supervisor::new(Arc::clone(&store));
    let handler = AuthEventHandler::new(Arc::clone(&cache), Arc::clone(&store));
    let consumer_stats = spawn_consumer(&cfg, &mut supervisor, handler);

    let mut state = AppState::new(gate, supervisor.registry());
    if let Some(stats) = consumer_stats {
        state = state.with_consumer_stats(stats);
    }

    let served = ProfilerServer::new(cfg.addr(), state)
        .run(shutdown_signal())
        .await;

    let summary = supervisor.shutdown(cfg.shutdown_grace()).await;
    if !summary.aborted.is_empty() {
        tracing::warn!(aborted = ?summary.aborted, "Some background tasks were aborted");
    }
    served
}

/// `--config <path>`, then `PROFILER_CONFIG`, then the optional default file.
fn config_path() -> (Option<String>, ConfigSource) {
    let args: Vec<String> = env::args().skip(1).collect();
    if let Some(path) = args
        .windows(2)
        .find(|pair| pair[0] == "--config")
        .map(|pair| pair[1].clone())
    {
        return (Some(path), ConfigSource::Flag);
    }

    match env::var("PROFILER_CONFIG") {
        Ok(path) if !path.is_empty() => (Some(path), ConfigSource::Environment),
        _ => (None, ConfigSource::Default),
    }
}
