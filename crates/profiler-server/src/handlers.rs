use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use profiler_auth::{
    Admin, AuthError, BearerAuth, CacheStats, RequireRoles, SessionRecord, verify_course_access,
};
use serde::Serialize;

use crate::events::ConsumerStatsSnapshot;
use crate::lifecycle::TaskState;
use crate::server::{AppState, CONSUMER_TASK};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub consumer: ConsumerHealth,
    pub sessions: CacheStats,
    pub store: StoreHealth,
}

#[derive(Serialize)]
pub struct ConsumerHealth {
    /// Task state, or `None` when no consumer was started.
    pub state: Option<TaskState>,
    #[serde(flatten)]
    pub stats: ConsumerStatsSnapshot,
}

#[derive(Serialize)]
pub struct StoreHealth {
    pub backend: &'static str,
    pub available: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterResponse {
    pub total: usize,
    pub users: Vec<SessionRecord>,
}

/// Always 200; `status` is `degraded` when the consumer stopped or the
/// store is unreachable.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let consumer_state = state.tasks.state(CONSUMER_TASK);
    let stats = state
        .consumer_stats
        .as_ref()
        .map(|stats| stats.snapshot())
        .unwrap_or_default();
    let available = state.store.is_available().await;

    let consumer_ok = matches!(consumer_state, None | Some(TaskState::Running));
    let status = if consumer_ok && available {
        "ok"
    } else {
        "degraded"
    };

    let body = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        consumer: ConsumerHealth {
            state: consumer_state,
            stats,
        },
        sessions: state.cache.stats(),
        store: StoreHealth {
            backend: state.store.backend(),
            available,
        },
    };
    (StatusCode::OK, Json(body))
}

pub async fn current_session(BearerAuth(session): BearerAuth) -> Json<SessionRecord> {
    Json(SessionRecord::clone(&session))
}

pub async fn course_access(
    BearerAuth(session): BearerAuth,
    Path(course_id): Path<String>,
) -> Result<StatusCode, AuthError> {
    verify_course_access(&session, &course_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn roster(
    RequireRoles(admin, ..): RequireRoles<Admin>,
    State(state): State<AppState>,
) -> Json<RosterResponse> {
    let users = state.cache.roster();
    tracing::debug!(user_id = %admin.user_id, users = users.len(), "Roster requested");
    Json(RosterResponse {
        total: users.len(),
        users: users.as_ref().clone(),
    })
}
