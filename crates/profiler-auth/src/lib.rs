//! # profiler-auth
//!
//! Authorization state for the profiler service.
//!
//! This crate provides:
//! - An in-process session cache keyed by user id, fed by the auth event stream
//! - The remote session store abstraction shared by every process instance
//! - HS256 bearer credential validation
//! - The authorization gate (role and course-scope checks)
//! - Axum extractors exposing the gate to request handlers
//!
//! ## Modules
//!
//! - [`config`] - Credential validation settings
//! - [`session`] - Session records, the local session cache and the users roster
//! - [`store`] - Remote session store trait and the in-process implementation
//! - [`token`] - Bearer credential decoding and verification
//! - [`gate`] - Authorization gate
//! - [`middleware`] - Axum extractors and error responses

pub mod config;
pub mod error;
pub mod gate;
pub mod middleware;
pub mod session;
pub mod store;
pub mod token;

pub use config::{AuthConfig, ConfigError};
pub use error::AuthError;
pub use gate::{AuthorizationGate, check_roles, verify_course_access};
pub use middleware::{Admin, AuthState, BearerAuth, Instructor, RequireRoles, RoleRequirement};
pub use session::{CacheStats, SessionCache, SessionRecord};
pub use store::{
    DEFAULT_SESSION_TTL, InMemorySessionStore, SESSION_KEY_PREFIX, SessionStore, StoreError,
    session_key,
};
pub use token::{CredentialClaims, TokenError, TokenValidator};

/// Type alias for authorization results.
pub type AuthResult<T> = Result<T, AuthError>;
