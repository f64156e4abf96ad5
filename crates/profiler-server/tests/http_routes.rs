use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use profiler_auth::{
    AuthorizationGate, InMemorySessionStore, SessionCache, SessionRecord, TokenValidator,
};
use profiler_server::events::ConsumerStats;
use profiler_server::{AppState, CONSUMER_TASK, Supervisor, build_app};
use serde_json::{Value, json};
use time::OffsetDateTime;
use tower::ServiceExt;

const SECRET: &str = "routes-secret";

fn sign(user_id: &str, roles: &[&str], course_ids: &[&str]) -> String {
    let claims = json!({
        "userId": user_id,
        "sub": user_id,
        "roles": roles,
        "courseIds": course_ids,
        "exp": OffsetDateTime::now_utc().unix_timestamp() + 600,
    });
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn app() -> (Router, Arc<SessionCache>, Supervisor) {
    let cache = Arc::new(SessionCache::new());
    let store = Arc::new(InMemorySessionStore::default());
    let gate = Arc::new(AuthorizationGate::new(
        TokenValidator::new(SECRET, 0),
        Arc::clone(&cache),
        store.clone(),
    ));
    let supervisor = Supervisor::new(store);
    let state = AppState::new(gate, supervisor.registry());
    (build_app(state), cache, supervisor)
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_without_consumer() {
    let (app, _, _supervisor) = app();
    let response = app.oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["consumer"]["state"], Value::Null);
    assert_eq!(body["store"]["backend"], "memory");
    assert_eq!(body["sessions"]["size"], 0);
}

#[tokio::test]
async fn test_health_reports_failed_consumer() {
    let cache = Arc::new(SessionCache::new());
    let store = Arc::new(InMemorySessionStore::default());
    let gate = Arc::new(AuthorizationGate::new(
        TokenValidator::new(SECRET, 0),
        cache,
        store.clone(),
    ));
    let mut supervisor = Supervisor::new(store);
    let registry = supervisor.registry();
    supervisor.spawn(CONSUMER_TASK, |_| async {
        Err::<(), _>("stream ended")
    });
    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while registry.state(CONSUMER_TASK) != Some(profiler_server::TaskState::Failed) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let state = AppState::new(gate, registry)
        .with_consumer_stats(Arc::new(ConsumerStats::default()));
    let response = build_app(state)
        .oneshot(get("/health", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["consumer"]["state"], "failed");
    assert_eq!(body["consumer"]["received"], 0);
}

#[tokio::test]
async fn test_session_endpoint() {
    let (app, cache, _supervisor) = app();
    let token = sign("u1", &["STUDENT"], &["c1"]);

    let unauthorized = app.clone().oneshot(get("/api/v1/session", None)).await.unwrap();
    assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(unauthorized).await["error"], "invalid_credential");

    let response = app
        .oneshot(get("/api/v1/session", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["userId"], "u1");
    assert_eq!(body["roles"], json!(["STUDENT"]));
    assert_eq!(body["courseIds"], json!(["c1"]));
    assert!(cache.contains("u1"));
}

#[tokio::test]
async fn test_course_access_endpoint() {
    let (app, _, _supervisor) = app();
    let token = sign("u2", &["STUDENT"], &["c1"]);

    let allowed = app
        .clone()
        .oneshot(get("/api/v1/courses/c1/access", Some(&token)))
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::NO_CONTENT);

    let denied = app
        .oneshot(get("/api/v1/courses/c2/access", Some(&token)))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(denied).await["error"], "forbidden_resource");
}

#[tokio::test]
async fn test_roster_requires_admin() {
    let (app, cache, _supervisor) = app();
    cache.replace_roster(vec![
        SessionRecord::new("u1").with_roles(["A"]),
        SessionRecord::new("u2").with_roles(["B"]),
    ]);

    let instructor = sign("u3", &["INSTRUCTOR"], &[]);
    let forbidden = app
        .clone()
        .oneshot(get("/api/v1/admin/roster", Some(&instructor)))
        .await
        .unwrap();
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        json_body(forbidden).await["error"],
        "insufficient_permissions"
    );

    let admin = sign("u4", &["ADMIN"], &[]);
    let response = app
        .oneshot(get("/api/v1/admin/roster", Some(&admin)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["total"], 2);
    assert_eq!(body["users"][1]["userId"], "u2");
}
