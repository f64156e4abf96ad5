use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, extract::FromRef, routing::get};
use profiler_auth::{AuthState, AuthorizationGate, SessionCache, SessionStore};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::events::ConsumerStats;
use crate::handlers;
use crate::lifecycle::TaskRegistry;

/// Supervisor name of the auth event consumer task.
pub const CONSUMER_TASK: &str = "auth-event-consumer";

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    pub auth: AuthState,
    pub cache: Arc<SessionCache>,
    pub store: Arc<dyn SessionStore>,
    pub tasks: Arc<TaskRegistry>,
    /// `None` when the consumer is disabled.
    pub consumer_stats: Option<Arc<ConsumerStats>>,
}

impl AppState {
    pub fn new(gate: Arc<AuthorizationGate>, tasks: Arc<TaskRegistry>) -> Self {
        Self {
            cache: Arc::clone(gate.cache()),
            store: Arc::clone(gate.store()),
            auth: AuthState::new(gate),
            tasks,
            consumer_stats: None,
        }
    }

    #[must_use]
    pub fn with_consumer_stats(mut self, stats: Arc<ConsumerStats>) -> Self {
        self.consumer_stats = Some(stats);
        self
    }
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/session", get(handlers::current_session))
        .route(
            "/api/v1/courses/{course_id}/access",
            get(handlers::course_access),
        )
        .route("/api/v1/admin/roster", get(handlers::roster))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = tracing::field::Empty,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .with_state(state)
}

pub struct ProfilerServer {
    addr: SocketAddr,
    app: Router,
}

impl ProfilerServer {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self {
            addr,
            app: build_app(state),
        }
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests.
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

/// Resolves on Ctrl+C (and SIGTERM on unix).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
