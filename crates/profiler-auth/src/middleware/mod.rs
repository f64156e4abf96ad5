//! HTTP middleware for authentication and authorization.
//!
//! This module provides Axum extractors for:
//!
//! - Bearer token extraction and validation
//! - Role-gated access
//! - Injecting the resolved session into request extensions
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, routing::get};
//! use profiler_auth::middleware::{Admin, AuthState, BearerAuth, RequireRoles};
//!
//! async fn me(BearerAuth(session): BearerAuth) -> String {
//!     session.user_id.clone()
//! }
//!
//! async fn admin_only(RequireRoles(session, ..): RequireRoles<Admin>) -> String {
//!     format!("hello admin {}", session.user_id)
//! }
//!
//! let app = Router::new()
//!     .route("/me", get(me))
//!     .route("/admin", get(admin_only))
//!     .with_state(auth_state);
//! ```

pub mod auth;
pub mod error;

pub use auth::{Admin, AuthState, BearerAuth, Instructor, RequireRoles, RoleRequirement};
pub use error::error_body;
