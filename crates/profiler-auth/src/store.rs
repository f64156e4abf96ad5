//! Remote session store abstraction.
//!
//! The remote store propagates session records across process instances and
//! expires them after a TTL. It is a best-effort accelerator: reads never
//! fail (errors become misses), so the authorization gate can always fall
//! back to credential claims.
//!
//! ## Key format
//!
//! `user:{user_id}` -> JSON-serialized [`SessionRecord`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::session::SessionRecord;

/// Prefix of every session key.
pub const SESSION_KEY_PREFIX: &str = "user:";

/// Default remote expiry: 24 hours.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(86_400);

/// Builds the store key for `user_id`.
#[must_use]
pub fn session_key(user_id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{user_id}")
}

/// Errors returned by session store writes.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No connection could be obtained.
    #[error("Store connection error: {0}")]
    Connection(String),

    /// The store rejected or failed a command.
    #[error("Store command error: {0}")]
    Command(String),

    /// The record could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Shared key-value store holding session records with per-key expiry.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetches the record for `user_id`.
    ///
    /// Returns `None` if the key is absent, expired, undecodable, or the
    /// store is unreachable.
    async fn get(&self, user_id: &str) -> Option<SessionRecord>;

    /// Writes `record` under its user key with the store's TTL.
    async fn put(&self, record: &SessionRecord) -> Result<(), StoreError>;

    /// Deletes the record for `user_id`. Failures are logged, not returned.
    async fn invalidate(&self, user_id: &str);

    /// Returns `true` if the store can currently serve requests.
    async fn is_available(&self) -> bool {
        true
    }

    /// Releases pooled connections. Called once during shutdown.
    async fn close(&self) {}

    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;
}

struct StoredEntry {
    payload: String,
    expires_at: Instant,
}

/// Per-process store with the same TTL and serialization semantics as the
/// Redis store.
///
/// Used when Redis is disabled (single-instance deployments) and in tests.
pub struct InMemorySessionStore {
    entries: DashMap<String, StoredEntry>,
    ttl: Duration,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn shared(ttl: Duration) -> Arc<Self> {
        Arc::new(Self::new(ttl))
    }

    /// Number of stored keys, expired ones included until they are read.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, user_id: &str) -> Option<SessionRecord> {
        let key = session_key(user_id);
        let payload = {
            let entry = self.entries.get(&key)?;
            if entry.expires_at <= Instant::now() {
                None
            } else {
                Some(entry.payload.clone())
            }
        };

        let Some(payload) = payload else {
            self.entries.remove(&key);
            return None;
        };

        match serde_json::from_str(&payload) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Undecodable session record");
                None
            }
        }
    }

    async fn put(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.entries.insert(
            session_key(&record.user_id),
            StoredEntry {
                payload,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn invalidate(&self, user_id: &str) {
        self.entries.remove(&session_key(user_id));
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_format() {
        assert_eq!(session_key("42"), "user:42");
    }

    #[tokio::test]
    async fn test_put_then_get_within_ttl() {
        let store = InMemorySessionStore::new(Duration::from_secs(60));
        let record = SessionRecord::new("u1")
            .with_username("alice")
            .with_roles(["ADMIN"]);

        store.put(&record).await.unwrap();

        assert_eq!(store.get("u1").await, Some(record));
    }

    #[tokio::test]
    async fn test_get_after_ttl_is_absent() {
        let store = InMemorySessionStore::new(Duration::from_millis(20));
        store.put(&SessionRecord::new("u1")).await.unwrap();
        assert!(store.get("u1").await.is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(store.get("u1").await.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate() {
        let store = InMemorySessionStore::default();
        store.put(&SessionRecord::new("u1")).await.unwrap();
        store.invalidate("u1").await;
        assert!(store.get("u1").await.is_none());
    }

    #[tokio::test]
    async fn test_missing_key() {
        let store = InMemorySessionStore::default();
        assert!(store.get("ghost").await.is_none());
        assert_eq!(store.backend(), "memory");
    }
}
