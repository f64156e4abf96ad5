//! Authorization gate.
//!
//! Runs once per request:
//!
//! ```text
//! Unauthenticated ──► Validating ──┬──► Authorized (SessionRecord)
//!                                  └──► Rejected (AuthError)
//! ```
//!
//! ## Session resolution
//!
//! 1. Local session cache (kept current by the event consumer)
//! 2. Remote session store (written by the consumer of any instance)
//! 3. Claims embedded in the credential
//!
//! Whatever is found on a local miss is inserted into the local cache, so the
//! next request for the same user is a cache hit.

use std::sync::Arc;

use crate::error::AuthError;
use crate::session::{SessionCache, SessionRecord};
use crate::store::SessionStore;
use crate::token::{CredentialClaims, TokenValidator};

/// Validates bearer credentials and resolves the caller's session.
pub struct AuthorizationGate {
    validator: TokenValidator,
    cache: Arc<SessionCache>,
    store: Arc<dyn SessionStore>,
}

impl AuthorizationGate {
    pub fn new(
        validator: TokenValidator,
        cache: Arc<SessionCache>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            validator,
            cache,
            store,
        }
    }

    /// The session cache this gate reads from.
    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    /// The remote store consulted on local misses.
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Validates `token` and resolves the caller's session.
    ///
    /// # Errors
    ///
    /// - `AuthError::ExpiredCredential` if the credential has expired,
    ///   whatever the cache holds for the subject
    /// - `AuthError::InvalidCredential` for any other validation failure,
    ///   including a missing `userId` claim
    pub async fn authenticate(&self, token: &str) -> Result<Arc<SessionRecord>, AuthError> {
        let claims = self.validator.validate(token).map_err(|e| {
            tracing::debug!(error = %e, "Credential rejected");
            AuthError::from(e)
        })?;
        let user_id = claims.subject()?;

        Ok(self.resolve_session(user_id, &claims).await)
    }

    /// Authenticates `token`, then requires one of `required_roles`.
    ///
    /// An empty `required_roles` accepts any authenticated subject.
    pub async fn authorize(
        &self,
        token: &str,
        required_roles: &[&str],
    ) -> Result<Arc<SessionRecord>, AuthError> {
        let session = self.authenticate(token).await?;
        check_roles(&session, required_roles)?;
        Ok(session)
    }

    /// Drops the caller's session locally and remotely (e.g. on logout).
    pub async fn invalidate_session(&self, user_id: &str) {
        self.cache.invalidate(user_id);
        self.store.invalidate(user_id).await;
        tracing::info!(user_id = %user_id, "Session invalidated");
    }

    async fn resolve_session(&self, user_id: &str, claims: &CredentialClaims) -> Arc<SessionRecord> {
        if let Some(session) = self.cache.get(user_id) {
            return session;
        }

        let record = match self.store.get(user_id).await {
            Some(stored) => {
                tracing::debug!(user_id = %user_id, "Session loaded from remote store");
                stored
            }
            None => {
                tracing::debug!(user_id = %user_id, "Session bootstrapped from credential claims");
                SessionRecord::from_claims(user_id, claims)
            }
        };

        self.cache.insert_if_absent(record)
    }
}

/// Requires `session` to hold at least one of `required_roles`.
///
/// # Errors
///
/// Returns `AuthError::InsufficientPermissions` when the role sets do not
/// intersect.
pub fn check_roles(session: &SessionRecord, required_roles: &[&str]) -> Result<(), AuthError> {
    if required_roles.is_empty() || session.has_any_role(required_roles) {
        return Ok(());
    }

    tracing::debug!(
        user_id = %session.user_id,
        required = ?required_roles,
        "Role check failed"
    );
    Err(AuthError::insufficient_permissions(format!(
        "requires one of: {}",
        required_roles.join(", ")
    )))
}

/// Requires `course_id` to be in the session's course scope.
///
/// # Errors
///
/// Returns `AuthError::ForbiddenResource` otherwise.
pub fn verify_course_access(session: &SessionRecord, course_id: &str) -> Result<(), AuthError> {
    if session.can_access_course(course_id) {
        return Ok(());
    }

    tracing::debug!(user_id = %session.user_id, course_id = %course_id, "Course access denied");
    Err(AuthError::forbidden_resource(format!(
        "no access to course {course_id}"
    )))
}
