//! # profiler-server
//!
//! Auth event consumer and HTTP service for the profiler.
//!
//! Keeps the session cache in step with the identity service's auth event
//! stream and serves authenticated requests from it.
//!
//! ## Modules
//!
//! - [`config`] - Application configuration and loader
//! - [`observability`] - Tracing subscriber setup
//! - [`events`] - Stream sources, the auth event consumer and handler
//! - [`store`] - Redis-backed remote session store
//! - [`lifecycle`] - Background task supervision and shutdown
//! - [`server`] - Router, shared state and the HTTP server
//! - [`handlers`] - Route handlers

pub mod config;
pub mod events;
pub mod handlers;
pub mod lifecycle;
pub mod observability;
pub mod server;
pub mod store;

use std::sync::Arc;

pub use config::{AppConfig, RedisConfig, StreamBackend, StreamConfig};
pub use events::{AuthEventConsumer, AuthEventHandler, ConsumerError, ConsumerStats};
pub use lifecycle::{Supervisor, TaskRegistry, TaskState};
pub use observability::init_tracing;
pub use server::{AppState, CONSUMER_TASK, ProfilerServer, build_app};
pub use store::{RedisSessionStore, create_session_store};

use events::RedisStreamSource;
use tokio_util::sync::CancellationToken;

/// Starts the auth event consumer for the configured backend under
/// `supervisor`.
///
/// Connecting happens inside the supervised task, so an unreachable broker
/// is reported like any other stream failure. Returns the consumer's
/// counters, or `None` when the consumer is disabled.
pub fn spawn_consumer(
    config: &AppConfig,
    supervisor: &mut Supervisor,
    handler: AuthEventHandler,
) -> Option<Arc<ConsumerStats>> {
    let stats = Arc::new(ConsumerStats::default());

    match config.stream.backend {
        StreamBackend::Disabled => {
            tracing::info!("Auth event consumer disabled");
            return None;
        }
        StreamBackend::Redis => {
            let redis_url = config.redis.url.clone();
            let stream = config.stream.clone();
            let stats = Arc::clone(&stats);
            supervisor.spawn(CONSUMER_TASK, move |cancel| {
                run_redis_consumer(redis_url, stream, handler, stats, cancel)
            });
        }
        #[cfg(feature = "kafka")]
        StreamBackend::Kafka => {
            let stream = config.stream.clone();
            let stats = Arc::clone(&stats);
            supervisor.spawn(CONSUMER_TASK, move |cancel| {
                run_kafka_consumer(stream, handler, stats, cancel)
            });
        }
        #[cfg(not(feature = "kafka"))]
        StreamBackend::Kafka => {
            tracing::error!("Kafka backend requested but the `kafka` feature is not built");
            return None;
        }
    }

    Some(stats)
}

async fn run_redis_consumer(
    redis_url: String,
    stream: StreamConfig,
    handler: AuthEventHandler,
    stats: Arc<ConsumerStats>,
    cancel: CancellationToken,
) -> Result<(), ConsumerError> {
    let source = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(()),
        source = RedisStreamSource::connect(&redis_url, &stream) => source?,
    };
    AuthEventConsumer::with_stats(source, handler, stats)
        .run(cancel)
        .await
}

#[cfg(feature = "kafka")]
async fn run_kafka_consumer(
    stream: StreamConfig,
    handler: AuthEventHandler,
    stats: Arc<ConsumerStats>,
    cancel: CancellationToken,
) -> Result<(), ConsumerError> {
    let source = events::KafkaEventSource::connect(&stream)?;
    AuthEventConsumer::with_stats(source, handler, stats)
        .run(cancel)
        .await
}
