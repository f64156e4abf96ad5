//! Bearer token authentication extractors.
//!
//! # Example
//!
//! ```ignore
//! async fn handler(BearerAuth(session): BearerAuth) -> String {
//!     format!("Hello, {}!", session.user_id)
//! }
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AuthError;
use crate::gate::{AuthorizationGate, check_roles};
use crate::session::SessionRecord;

// =============================================================================
// Auth State
// =============================================================================

/// State required by the auth extractors.
///
/// Include it in the application state and expose it via `FromRef`.
#[derive(Clone)]
pub struct AuthState {
    pub gate: Arc<AuthorizationGate>,
}

impl AuthState {
    pub fn new(gate: Arc<AuthorizationGate>) -> Self {
        Self { gate }
    }
}

// =============================================================================
// Role requirements
// =============================================================================

/// Compile-time set of roles an endpoint requires.
///
/// The caller must hold at least one of [`RoleRequirement::ROLES`].
pub trait RoleRequirement: Send + Sync + 'static {
    const ROLES: &'static [&'static str];
}

/// Requires the `ADMIN` role.
pub struct Admin;

impl RoleRequirement for Admin {
    const ROLES: &'static [&'static str] = &["ADMIN"];
}

/// Requires the `INSTRUCTOR` role.
pub struct Instructor;

impl RoleRequirement for Instructor {
    const ROLES: &'static [&'static str] = &["INSTRUCTOR"];
}

// =============================================================================
// Bearer Auth Extractor
// =============================================================================

/// Axum extractor that validates the bearer credential and resolves the
/// caller's session.
///
/// On success the session is also inserted into the request extensions.
pub struct BearerAuth(pub Arc<SessionRecord>);

impl<S> FromRequestParts<S> for BearerAuth
where
    S: Send + Sync,
    AuthState: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth_state = AuthState::from_ref(state);

        if let Some(session) = parts.extensions.get::<Arc<SessionRecord>>() {
            return Ok(BearerAuth(Arc::clone(session)));
        }

        let token = bearer_token(parts)?;
        let session = auth_state.gate.authenticate(token).await?;

        tracing::debug!(user_id = %session.user_id, "Bearer credential accepted");
        parts.extensions.insert(Arc::clone(&session));

        Ok(BearerAuth(session))
    }
}

/// Axum extractor that authenticates the caller and requires one of
/// `R::ROLES`.
pub struct RequireRoles<R: RoleRequirement>(pub Arc<SessionRecord>, pub PhantomData<R>);

impl<R: RoleRequirement> RequireRoles<R> {
    pub fn session(&self) -> &SessionRecord {
        &self.0
    }
}

impl<S, R> FromRequestParts<S> for RequireRoles<R>
where
    S: Send + Sync,
    R: RoleRequirement,
    AuthState: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let BearerAuth(session) = BearerAuth::from_request_parts(parts, state).await?;
        check_roles(&session, R::ROLES)?;
        Ok(RequireRoles(session, PhantomData))
    }
}

fn bearer_token(parts: &Parts) -> Result<&str, AuthError> {
    let header = parts
        .headers
        .get(AUTHORIZATION)
        .ok_or_else(|| AuthError::invalid_credential("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AuthError::invalid_credential("Malformed Authorization header"))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AuthError::invalid_credential("Authorization scheme must be Bearer"))?
        .trim();

    if token.is_empty() {
        return Err(AuthError::invalid_credential("Empty Bearer token"));
    }
    Ok(token)
}
