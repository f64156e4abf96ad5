//! State transitions driven by auth events.

use std::sync::Arc;

use profiler_auth::{SessionCache, SessionRecord, SessionStore, StoreError};
use tracing::{debug, info, warn};

use super::{AuthEvent, UserPayload};

/// A state mutation that could not be completed.
///
/// The local cache keeps whatever it held after the last successful step.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("failed to write session for user {user_id}: {source}")]
    StoreWrite {
        user_id: String,
        #[source]
        source: StoreError,
    },
}

/// Applies auth events to the local session cache and the remote store.
///
/// Every event kind is idempotent, so redelivered messages are harmless.
#[derive(Clone)]
pub struct AuthEventHandler {
    cache: Arc<SessionCache>,
    store: Arc<dyn SessionStore>,
}

impl AuthEventHandler {
    pub fn new(cache: Arc<SessionCache>, store: Arc<dyn SessionStore>) -> Self {
        Self { cache, store }
    }

    pub async fn handle(&self, event: &AuthEvent) -> Result<(), HandlerError> {
        match event {
            AuthEvent::Login(user) | AuthEvent::Register(user) => {
                let record = self.cache.upsert(user.to_record());
                info!(
                    event = event.kind(),
                    user_id = %record.user_id,
                    roles = ?record.roles,
                    "Session upserted"
                );
                self.write_through(&record).await
            }
            AuthEvent::RoleUpdate(user) => self.apply_role_update(user).await,
            AuthEvent::UsersListUpdated(users) => self.apply_users_list(users).await,
            AuthEvent::Unknown { kind } => {
                debug!(event = %kind, "Ignoring unknown auth event");
                Ok(())
            }
        }
    }

    async fn apply_role_update(&self, user: &UserPayload) -> Result<(), HandlerError> {
        let record = self.cache.update_or_insert(
            &user.user_id,
            |record| {
                if let Some(roles) = &user.roles {
                    record.roles = roles.clone();
                }
            },
            || user.to_record(),
        );
        info!(user_id = %record.user_id, roles = ?record.roles, "Roles updated");
        self.write_through(&record).await
    }

    /// Replaces the roster, then upserts every entry locally and remotely.
    ///
    /// All entries are attempted; the first store failure is returned.
    async fn apply_users_list(&self, users: &[UserPayload]) -> Result<(), HandlerError> {
        let records: Vec<SessionRecord> = users.iter().map(UserPayload::to_record).collect();
        self.cache.replace_roster(records.clone());
        info!(users = records.len(), "Users roster replaced");

        let mut first_error = None;
        for record in records {
            let record = self.cache.upsert(record);
            if let Err(e) = self.write_through(&record).await {
                warn!(user_id = %record.user_id, error = %e, "Roster entry not stored");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn write_through(&self, record: &SessionRecord) -> Result<(), HandlerError> {
        self.store
            .put(record)
            .await
            .map_err(|source| HandlerError::StoreWrite {
                user_id: record.user_id.clone(),
                source,
            })
    }
}
