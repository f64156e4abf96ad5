//! Local session cache.
//!
//! Holds one [`SessionRecord`] per user id, built from auth events and from
//! bearer credentials on first use. There is no expiry: entries live until
//! they are invalidated or the process exits.
//!
//! ## Atomicity
//!
//! Every mutation is a single `DashMap` entry operation. Nothing awaits while
//! an entry is held, so a reader never observes a half-applied event.
//!
//! ## Users roster
//!
//! The roster is the last `USERS_LIST_UPDATED` snapshot. It is swapped
//! wholesale through `ArcSwap`, never merged.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::token::CredentialClaims;

// =============================================================================
// Session Record
// =============================================================================

/// Authorization-relevant attributes cached for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Stable user identifier.
    pub user_id: String,

    /// Display name.
    #[serde(default)]
    pub username: Option<String>,

    /// Email address.
    #[serde(default)]
    pub email: Option<String>,

    /// Role names held by the user.
    #[serde(default)]
    pub roles: BTreeSet<String>,

    /// Courses the user may access.
    #[serde(default)]
    pub course_ids: BTreeSet<String>,

    /// Time of the last mutation.
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub updated_at: OffsetDateTime,
}

impl SessionRecord {
    /// Creates an empty record for `user_id`, timestamped now.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: None,
            email: None,
            roles: BTreeSet::new(),
            course_ids: BTreeSet::new(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    /// Synthesizes a minimal record from verified credential claims.
    ///
    /// Credentials carry no email, so it stays `None`.
    pub fn from_claims(user_id: impl Into<String>, claims: &CredentialClaims) -> Self {
        Self {
            username: claims.sub.clone(),
            roles: claims.roles.iter().cloned().collect(),
            course_ids: claims.course_ids.iter().cloned().collect(),
            ..Self::new(user_id)
        }
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_course_ids<I, S>(mut self, course_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.course_ids = course_ids.into_iter().map(Into::into).collect();
        self
    }

    /// Returns `true` if the user holds `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Returns `true` if the user holds at least one of `roles`.
    #[must_use]
    pub fn has_any_role(&self, roles: &[&str]) -> bool {
        roles.iter().any(|role| self.has_role(role))
    }

    /// Returns `true` if `course_id` is in the user's scope list.
    #[must_use]
    pub fn can_access_course(&self, course_id: &str) -> bool {
        self.course_ids.contains(course_id)
    }

    /// Marks the record as modified now.
    pub fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc();
    }

    /// Compares every field except `updated_at`.
    #[must_use]
    pub fn same_attributes(&self, other: &Self) -> bool {
        self.user_id == other.user_id
            && self.username == other.username
            && self.email == other.email
            && self.roles == other.roles
            && self.course_ids == other.course_ids
    }
}

// =============================================================================
// Session Cache
// =============================================================================

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Number of sessions currently cached.
    pub size: usize,
    /// Number of entries in the users roster.
    pub roster_size: usize,
    /// Number of lookups answered from the cache.
    pub hits: u64,
    /// Number of lookups that found nothing.
    pub misses: u64,
}

/// In-process session cache shared by the event consumer and request handlers.
///
/// Construct one per process and hand out `Arc<SessionCache>`.
pub struct SessionCache {
    sessions: DashMap<String, Arc<SessionRecord>>,
    roster: ArcSwap<Vec<SessionRecord>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCache {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            roster: ArcSwap::from_pointee(Vec::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up the session for `user_id`.
    pub fn get(&self, user_id: &str) -> Option<Arc<SessionRecord>> {
        match self.sessions.get(user_id) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(entry.value()))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Returns `true` if a session for `user_id` is cached.
    ///
    /// Does not touch the hit/miss counters.
    pub fn contains(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    /// Inserts or replaces the session for `record.user_id`.
    pub fn upsert(&self, record: SessionRecord) -> Arc<SessionRecord> {
        let record = Arc::new(record);
        self.sessions
            .insert(record.user_id.clone(), Arc::clone(&record));
        record
    }

    /// Inserts `record` unless a session for the same user already exists.
    ///
    /// Returns whichever record ends up cached. Used by cache-aside bootstrap
    /// so a concurrent event write is never overwritten by stale claims.
    pub fn insert_if_absent(&self, record: SessionRecord) -> Arc<SessionRecord> {
        match self.sessions.entry(record.user_id.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let record = Arc::new(record);
                entry.insert(Arc::clone(&record));
                record
            }
        }
    }

    /// Applies `update` to the existing session, or inserts `seed()` when the
    /// user is not cached.
    ///
    /// The existing record is cloned, updated, timestamped and swapped in
    /// under the entry lock.
    pub fn update_or_insert<U, S>(&self, user_id: &str, update: U, seed: S) -> Arc<SessionRecord>
    where
        U: FnOnce(&mut SessionRecord),
        S: FnOnce() -> SessionRecord,
    {
        match self.sessions.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let mut record = SessionRecord::clone(entry.get());
                update(&mut record);
                record.touch();
                let record = Arc::new(record);
                entry.insert(Arc::clone(&record));
                record
            }
            Entry::Vacant(entry) => {
                let record = Arc::new(seed());
                entry.insert(Arc::clone(&record));
                record
            }
        }
    }

    /// Replaces the roles of a cached session. Returns `None` when the user
    /// is not cached.
    pub fn update_roles(
        &self,
        user_id: &str,
        roles: BTreeSet<String>,
    ) -> Option<Arc<SessionRecord>> {
        let mut entry = self.sessions.get_mut(user_id)?;
        let mut record = SessionRecord::clone(entry.value());
        record.roles = roles;
        record.touch();
        let record = Arc::new(record);
        *entry.value_mut() = Arc::clone(&record);
        Some(record)
    }

    /// Removes the session for `user_id`. Returns `true` if one was cached.
    pub fn invalidate(&self, user_id: &str) -> bool {
        self.sessions.remove(user_id).is_some()
    }

    /// Replaces the users roster with `users`.
    pub fn replace_roster(&self, users: Vec<SessionRecord>) {
        self.roster.store(Arc::new(users));
    }

    /// Current roster snapshot.
    pub fn roster(&self) -> Arc<Vec<SessionRecord>> {
        self.roster.load_full()
    }

    /// Finds `user_id` in the current roster.
    pub fn roster_entry(&self, user_id: &str) -> Option<SessionRecord> {
        self.roster
            .load()
            .iter()
            .find(|user| user.user_id == user_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drops every session and the roster.
    pub fn clear(&self) {
        self.sessions.clear();
        self.roster.store(Arc::new(Vec::new()));
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.sessions.len(),
            roster_size: self.roster.load().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_get() {
        let cache = SessionCache::new();
        cache.upsert(
            SessionRecord::new("u1")
                .with_username("alice")
                .with_roles(["STUDENT"]),
        );

        let record = cache.get("u1").unwrap();
        assert_eq!(record.username.as_deref(), Some("alice"));
        assert!(record.has_role("STUDENT"));

        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_cache_miss() {
        let cache = SessionCache::new();
        assert!(cache.get("nobody").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_upsert_replaces_instead_of_duplicating() {
        let cache = SessionCache::new();
        cache.upsert(SessionRecord::new("u1").with_roles(["A"]));
        cache.upsert(SessionRecord::new("u1").with_roles(["B"]));

        assert_eq!(cache.len(), 1);
        let record = cache.get("u1").unwrap();
        assert!(record.has_role("B"));
        assert!(!record.has_role("A"));
    }

    #[test]
    fn test_insert_if_absent_keeps_existing() {
        let cache = SessionCache::new();
        cache.upsert(SessionRecord::new("u1").with_roles(["ADMIN"]));

        let kept = cache.insert_if_absent(SessionRecord::new("u1").with_roles(["STUDENT"]));
        assert!(kept.has_role("ADMIN"));
        assert!(!kept.has_role("STUDENT"));
    }

    #[test]
    fn test_update_or_insert_keeps_other_fields() {
        let cache = SessionCache::new();
        cache.upsert(
            SessionRecord::new("u1")
                .with_email("a@example.com")
                .with_roles(["STUDENT"])
                .with_course_ids(["c1"]),
        );

        let updated = cache.update_or_insert(
            "u1",
            |record| record.roles = ["INSTRUCTOR".to_string()].into(),
            || unreachable!("record exists"),
        );

        assert!(updated.has_role("INSTRUCTOR"));
        assert!(!updated.has_role("STUDENT"));
        assert_eq!(updated.email.as_deref(), Some("a@example.com"));
        assert!(updated.can_access_course("c1"));
    }

    #[test]
    fn test_update_or_insert_seeds_missing_user() {
        let cache = SessionCache::new();
        let record = cache.update_or_insert(
            "u2",
            |_| unreachable!("record is missing"),
            || SessionRecord::new("u2").with_roles(["ADMIN"]),
        );
        assert!(record.has_role("ADMIN"));
        assert!(cache.contains("u2"));
    }

    #[test]
    fn test_update_roles_only_touches_cached_users() {
        let cache = SessionCache::new();
        assert!(cache.update_roles("u1", ["A".to_string()].into()).is_none());
        assert!(!cache.contains("u1"));

        cache.upsert(SessionRecord::new("u1").with_username("alice").with_roles(["A"]));
        let record = cache.update_roles("u1", ["B".to_string()].into()).unwrap();
        assert!(record.has_role("B"));
        assert_eq!(record.username.as_deref(), Some("alice"));
    }

    #[test]
    fn test_invalidate() {
        let cache = SessionCache::new();
        cache.upsert(SessionRecord::new("u1"));
        assert!(cache.invalidate("u1"));
        assert!(!cache.invalidate("u1"));
        assert!(cache.get("u1").is_none());
    }

    #[test]
    fn test_roster_is_replaced_wholesale() {
        let cache = SessionCache::new();
        cache.replace_roster(vec![SessionRecord::new("u1"), SessionRecord::new("u2")]);
        assert_eq!(cache.roster().len(), 2);

        cache.replace_roster(vec![SessionRecord::new("u3")]);
        assert_eq!(cache.roster().len(), 1);
        assert!(cache.roster_entry("u1").is_none());
        assert!(cache.roster_entry("u3").is_some());
    }

    #[test]
    fn test_record_wire_format() {
        let record = SessionRecord::new("u1")
            .with_username("alice")
            .with_roles(["B", "A", "A"])
            .with_course_ids(["c1"]);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["userId"], "u1");
        assert_eq!(json["username"], "alice");
        assert_eq!(json["roles"], serde_json::json!(["A", "B"]));
        assert_eq!(json["courseIds"], serde_json::json!(["c1"]));
        assert!(json["updatedAt"].is_string());

        let back: SessionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_record_without_timestamp_decodes() {
        let back: SessionRecord =
            serde_json::from_str(r#"{"userId":"u9","roles":["ADMIN"]}"#).unwrap();
        assert_eq!(back.user_id, "u9");
        assert!(back.has_role("ADMIN"));
        assert!(back.course_ids.is_empty());
    }
}
