//! Auth event ingestion.
//!
//! Events published by the identity service flow through a durable stream
//! into the local session cache and the remote session store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   RawMessage   ┌───────────────────┐  AuthEvent  ┌──────────────────┐
//! │ EventSource  │ ─────────────► │ AuthEventConsumer │ ──────────► │ AuthEventHandler │
//! │ (Redis/Kafka)│ ◄───── commit ─│  decode + commit  │             │  cache + store   │
//! └──────────────┘                └───────────────────┘             └──────────────────┘
//! ```
//!
//! Delivery is at-least-once: a message is committed only after it has been
//! handled or dropped, and every event kind is idempotent.

mod consumer;
mod handler;
#[cfg(feature = "kafka")]
mod kafka;
mod redis_stream;
mod source;

pub use consumer::{AuthEventConsumer, ConsumerError, ConsumerStats, ConsumerStatsSnapshot};
pub use handler::{AuthEventHandler, HandlerError};
#[cfg(feature = "kafka")]
pub use kafka::KafkaEventSource;
pub use redis_stream::{RedisStreamSource, VALUE_FIELD};
pub use source::{
    AckToken, ChannelEventSource, ChannelSourceHandle, EventSource, RawMessage, StreamError,
};

use std::collections::BTreeSet;

use profiler_auth::SessionRecord;
use serde::Deserialize;
use serde_json::Value;

/// User attributes carried by single-user events and roster entries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPayload {
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// `None` when the event omits the field.
    #[serde(default)]
    pub roles: Option<BTreeSet<String>>,
    #[serde(default)]
    pub course_ids: Option<BTreeSet<String>>,
}

impl UserPayload {
    /// Builds a full record from the payload, defaulting absent values.
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            username: self.username.clone(),
            email: self.email.clone(),
            roles: self.roles.clone().unwrap_or_default(),
            course_ids: self.course_ids.clone().unwrap_or_default(),
            ..SessionRecord::new(self.user_id.clone())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct UsersList {
    #[serde(default)]
    users: Vec<UserPayload>,
}

/// Change in authentication or authorization state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    Login(UserPayload),
    Register(UserPayload),
    RoleUpdate(UserPayload),
    UsersListUpdated(Vec<UserPayload>),
    /// A kind this version does not handle.
    Unknown { kind: String },
}

impl AuthEvent {
    pub const LOGIN: &'static str = "LOGIN";
    pub const REGISTER: &'static str = "REGISTER";
    pub const ROLE_UPDATE: &'static str = "ROLE_UPDATE";
    pub const USERS_LIST_UPDATED: &'static str = "USERS_LIST_UPDATED";

    /// Wire name of the event kind.
    pub fn kind(&self) -> &str {
        match self {
            Self::Login(_) => Self::LOGIN,
            Self::Register(_) => Self::REGISTER,
            Self::RoleUpdate(_) => Self::ROLE_UPDATE,
            Self::UsersListUpdated(_) => Self::USERS_LIST_UPDATED,
            Self::Unknown { kind } => kind.as_str(),
        }
    }

    /// User the event targets, for single-user kinds.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Login(user) | Self::Register(user) | Self::RoleUpdate(user) => {
                Some(&user.user_id)
            }
            Self::UsersListUpdated(_) | Self::Unknown { .. } => None,
        }
    }
}

/// A message payload that is not a valid auth event.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not UTF-8 JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload has no string `type` field")]
    MissingType,

    #[error("invalid {kind} event: {source}")]
    Schema {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decodes a raw stream payload into an [`AuthEvent`].
///
/// Unknown `type` values decode to [`AuthEvent::Unknown`] so newer producers
/// do not break older consumers.
pub fn decode_event(payload: &[u8]) -> Result<AuthEvent, DecodeError> {
    let value: Value = serde_json::from_slice(payload)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_string();

    let schema = |source: serde_json::Error| DecodeError::Schema {
        kind: kind.clone(),
        source,
    };

    let event = match kind.as_str() {
        AuthEvent::LOGIN => AuthEvent::Login(serde_json::from_value(value).map_err(schema)?),
        AuthEvent::REGISTER => AuthEvent::Register(serde_json::from_value(value).map_err(schema)?),
        AuthEvent::ROLE_UPDATE => {
            AuthEvent::RoleUpdate(serde_json::from_value(value).map_err(schema)?)
        }
        AuthEvent::USERS_LIST_UPDATED => {
            let list: UsersList = serde_json::from_value(value).map_err(schema)?;
            AuthEvent::UsersListUpdated(list.users)
        }
        _ => AuthEvent::Unknown { kind: kind.clone() },
    };

    Ok(event)
}
