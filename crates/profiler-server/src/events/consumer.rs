//! Long-running consumer loop: receive, decode, handle, commit.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AuthEventHandler, EventSource, RawMessage, StreamError, decode_event};

/// The consumer stopped for a reason other than shutdown.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("auth event stream failed: {0}")]
    Stream(#[from] StreamError),
}

/// Message counters, shared with the health endpoint.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    handled: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub received: u64,
    pub handled: u64,
    /// Malformed messages dropped without handling.
    pub skipped: u64,
    /// Messages whose handling failed.
    pub failed: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Drives an [`EventSource`] into an [`AuthEventHandler`].
///
/// Messages are processed one at a time in delivery order and committed
/// after they were handled or dropped. Neither malformed payloads nor
/// handler failures stop the loop; only transport errors and cancellation do.
pub struct AuthEventConsumer<S> {
    source: S,
    handler: AuthEventHandler,
    stats: Arc<ConsumerStats>,
}

impl<S: EventSource> AuthEventConsumer<S> {
    pub fn new(source: S, handler: AuthEventHandler) -> Self {
        Self::with_stats(source, handler, Arc::new(ConsumerStats::default()))
    }

    /// Counts into `stats`, which may outlive this consumer.
    pub fn with_stats(source: S, handler: AuthEventHandler, stats: Arc<ConsumerStats>) -> Self {
        Self {
            source,
            handler,
            stats,
        }
    }

    /// Shared counters, readable while the consumer runs.
    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Consumes until `cancel` fires (returns `Ok`) or the stream fails.
    ///
    /// The source is closed in both cases.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ConsumerError> {
        let backend = self.source.backend();
        info!(backend, "Auth event consumer started");

        let result = self.consume(&cancel).await;
        self.source.close().await;

        match &result {
            Ok(()) => info!(backend, "Auth event consumer stopped"),
            Err(e) => error!(backend, error = %e, "Auth event consumer terminated"),
        }
        result
    }

    async fn consume(&mut self, cancel: &CancellationToken) -> Result<(), ConsumerError> {
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = self.source.recv() => next?.ok_or(StreamError::Ended)?,
            };

            process(&self.handler, &self.stats, &message).await;
            self.source.commit(&message).await?;
        }
    }
}

async fn process(handler: &AuthEventHandler, stats: &ConsumerStats, message: &RawMessage) {
    stats.received.fetch_add(1, Ordering::Relaxed);

    let event = match decode_event(&message.payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(ack = ?message.ack, error = %e, "Skipping malformed auth event");
            stats.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    debug!(
        event = event.kind(),
        user_id = event.user_id().unwrap_or("-"),
        ack = ?message.ack,
        "Auth event received"
    );

    match handler.handle(&event).await {
        Ok(()) => {
            stats.handled.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            error!(event = event.kind(), error = %e, "Failed to apply auth event");
            stats.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelEventSource;
    use profiler_auth::{InMemorySessionStore, SessionCache};
    use std::time::Duration;

    fn consumer(
        capacity: usize,
    ) -> (
        AuthEventConsumer<ChannelEventSource>,
        crate::events::ChannelSourceHandle,
        Arc<SessionCache>,
    ) {
        let cache = Arc::new(SessionCache::new());
        let handler = AuthEventHandler::new(
            Arc::clone(&cache),
            Arc::new(InMemorySessionStore::default()),
        );
        let (source, handle) = ChannelEventSource::new(capacity);
        (AuthEventConsumer::new(source, handler), handle, cache)
    }

    #[tokio::test]
    async fn test_malformed_message_does_not_stop_consumption() {
        let (consumer, mut handle, cache) = consumer(8);
        let stats = consumer.stats();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(consumer.run(cancel.clone()));

        handle.send("{not json").await.unwrap();
        handle.send(r#"{"userId":"no-type"}"#).await.unwrap();
        handle
            .send(r#"{"type":"LOGIN","userId":"u1","roles":["STUDENT"]}"#)
            .await
            .unwrap();

        handle.wait_for_commits(3).await;
        assert!(cache.get("u1").unwrap().has_role("STUDENT"));
        assert_eq!(
            stats.snapshot(),
            ConsumerStatsSnapshot {
                received: 3,
                handled: 1,
                skipped: 2,
                failed: 0,
            }
        );

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_returns_ok_and_closes_source() {
        let (consumer, handle, _) = consumer(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(consumer.run(cancel.clone()));

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_transport_failure_ends_loop() {
        let (consumer, handle, _) = consumer(8);
        handle
            .fail(StreamError::Connection("connection reset".into()))
            .await
            .unwrap();

        let result = consumer.run(CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(ConsumerError::Stream(StreamError::Connection(_)))
        ));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_stream_end_is_a_failure() {
        let (consumer, mut handle, cache) = consumer(8);
        handle
            .send(r#"{"type":"REGISTER","userId":"u2"}"#)
            .await
            .unwrap();
        handle.end();

        let result = consumer.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(ConsumerError::Stream(StreamError::Ended))));
        assert!(cache.contains("u2"));
        assert_eq!(handle.committed(), 1);
    }
}
