//! Integration tests against a real Redis: the session store and the
//! Redis Streams event source.
//!
//! Tests use testcontainers to spin up a Redis instance and are ignored by
//! default; run them with `--ignored` on a host with Docker.

use std::sync::Arc;
use std::time::Duration;

use profiler_auth::{SessionCache, SessionRecord, SessionStore, session_key};
use profiler_server::events::{EventSource, RedisStreamSource, VALUE_FIELD};
use profiler_server::store::{RedisSessionStore, create_redis_pool};
use profiler_server::{AuthEventConsumer, AuthEventHandler, RedisConfig, StreamConfig};
use redis::AsyncCommands;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn redis_store(ttl: Duration) -> RedisSessionStore {
    let config = RedisConfig {
        url: get_redis_url().await,
        ..RedisConfig::default()
    };
    RedisSessionStore::new(create_redis_pool(&config).expect("pool"), ttl)
}

async fn raw_connection() -> redis::aio::MultiplexedConnection {
    redis::Client::open(get_redis_url().await)
        .expect("client")
        .get_multiplexed_async_connection()
        .await
        .expect("connection")
}

fn stream_config(topic: &str, consumer: &str) -> StreamConfig {
    StreamConfig {
        topic: topic.to_string(),
        consumer_name: Some(consumer.to_string()),
        block_ms: 100,
        ..StreamConfig::default()
    }
}

async fn publish(topic: &str, payload: &str) {
    let mut conn = raw_connection().await;
    let _: String = conn
        .xadd(topic, "*", &[(VALUE_FIELD, payload)])
        .await
        .expect("xadd");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_store_put_get_invalidate() {
    let store = redis_store(Duration::from_secs(60)).await;
    let record = SessionRecord::new("redis-u1")
        .with_email("r@example.com")
        .with_roles(["ADMIN"])
        .with_course_ids(["c1"]);

    store.put(&record).await.unwrap();
    let fetched = store.get("redis-u1").await.unwrap();
    assert!(fetched.same_attributes(&record));

    let mut conn = raw_connection().await;
    let ttl: i64 = conn.ttl(session_key("redis-u1")).await.unwrap();
    assert!(ttl > 0 && ttl <= 60);

    store.invalidate("redis-u1").await;
    assert!(store.get("redis-u1").await.is_none());
    assert!(store.is_available().await);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_store_entries_expire() {
    let store = redis_store(Duration::from_secs(1)).await;
    store.put(&SessionRecord::new("redis-u2")).await.unwrap();
    assert!(store.get("redis-u2").await.is_some());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(store.get("redis-u2").await.is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_store_undecodable_value_is_a_miss() {
    let store = redis_store(Duration::from_secs(60)).await;
    let mut conn = raw_connection().await;
    let _: () = conn
        .set(session_key("redis-u3"), "not json")
        .await
        .unwrap();

    assert!(store.get("redis-u3").await.is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_stream_consumer_applies_events() {
    let topic = "auth-events-consume";
    publish(topic, r#"{"type":"LOGIN","userId":"s1","roles":["STUDENT"]}"#).await;
    publish(topic, "not json").await;
    publish(
        topic,
        r#"{"type":"USERS_LIST_UPDATED","users":[{"userId":"s2","roles":["B"]}]}"#,
    )
    .await;

    let url = get_redis_url().await;
    let source = RedisStreamSource::connect(&url, &stream_config(topic, "worker-a"))
        .await
        .unwrap();

    let cache = Arc::new(SessionCache::new());
    let store: Arc<dyn SessionStore> = Arc::new(redis_store(Duration::from_secs(60)).await);
    let consumer = AuthEventConsumer::new(source, AuthEventHandler::new(Arc::clone(&cache), store));
    let stats = consumer.stats();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(consumer.run(cancel.clone()));

    tokio::time::timeout(Duration::from_secs(5), async {
        while stats.snapshot().received < 3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    assert!(cache.get("s1").unwrap().has_role("STUDENT"));
    assert!(cache.get("s2").unwrap().has_role("B"));
    assert_eq!(stats.snapshot().skipped, 1);

    cancel.cancel();
    task.await.unwrap().unwrap();

    // Every entry, malformed included, was acknowledged.
    let mut conn = raw_connection().await;
    let pending: redis::streams::StreamPendingReply =
        conn.xpending(topic, "jobs-auth-group").await.unwrap();
    assert_eq!(pending.count(), 0);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_unacknowledged_entries_are_redelivered() {
    let topic = "auth-events-redeliver";
    publish(topic, r#"{"type":"REGISTER","userId":"p1"}"#).await;

    let url = get_redis_url().await;
    let config = stream_config(topic, "worker-b");

    let mut first = RedisStreamSource::connect(&url, &config).await.unwrap();
    let delivered = first.recv().await.unwrap().unwrap();
    first.close().await;

    // Same consumer name, no commit in between: the entry comes back first.
    let mut second = RedisStreamSource::connect(&url, &config).await.unwrap();
    let redelivered = second.recv().await.unwrap().unwrap();
    assert_eq!(redelivered.ack, delivered.ack);
    assert_eq!(redelivered.payload, delivered.payload);

    second.commit(&redelivered).await.unwrap();
    second.close().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_restart_with_default_consumer_name_redelivers() {
    let topic = "auth-events-default-name";
    publish(topic, r#"{"type":"LOGIN","userId":"d1"}"#).await;
    publish(topic, r#"{"type":"LOGIN","userId":"d2"}"#).await;

    let url = get_redis_url().await;
    let config = StreamConfig {
        topic: topic.to_string(),
        block_ms: 100,
        ..StreamConfig::default()
    };
    assert!(config.consumer_name.is_none());

    // Both entries are fetched in one batch; only the first is handled.
    let mut first = RedisStreamSource::connect(&url, &config).await.unwrap();
    let handled = first.recv().await.unwrap().unwrap();
    first.commit(&handled).await.unwrap();
    first.close().await;

    let mut second = RedisStreamSource::connect(&url, &config).await.unwrap();
    assert_eq!(second.consumer_name(), first.consumer_name());
    let redelivered = second.recv().await.unwrap().unwrap();
    assert_ne!(redelivered.ack, handled.ack);
    assert!(String::from_utf8_lossy(&redelivered.payload).contains("d2"));

    second.commit(&redelivered).await.unwrap();
    second.close().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_idle_entries_of_another_consumer_are_claimed() {
    let topic = "auth-events-claim";
    publish(topic, r#"{"type":"REGISTER","userId":"c1"}"#).await;

    let url = get_redis_url().await;
    let mut gone = RedisStreamSource::connect(&url, &stream_config(topic, "worker-gone"))
        .await
        .unwrap();
    let abandoned = gone.recv().await.unwrap().unwrap();
    gone.close().await;

    let config = StreamConfig {
        claim_idle_ms: 0,
        ..stream_config(topic, "worker-new")
    };
    let mut successor = RedisStreamSource::connect(&url, &config).await.unwrap();
    let claimed = successor.recv().await.unwrap().unwrap();
    assert_eq!(claimed.ack, abandoned.ack);
    assert_eq!(claimed.payload, abandoned.payload);
    successor.commit(&claimed).await.unwrap();
    successor.close().await;

    let mut conn = raw_connection().await;
    let pending: redis::streams::StreamPendingReply =
        conn.xpending(topic, "jobs-auth-group").await.unwrap();
    assert_eq!(pending.count(), 0);
}
