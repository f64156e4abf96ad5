//! Credential validation configuration.
//!
//! # Example (TOML)
//!
//! ```toml
//! [auth]
//! jwt_secret = "change-me"
//! leeway_secs = 0
//! ```

use serde::{Deserialize, Serialize};

/// Bearer credential settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared HMAC-SHA256 secret the identity service signs tokens with.
    pub jwt_secret: String,

    /// Clock skew tolerated when checking `exp`, in seconds.
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            leeway_secs: 0,
        }
    }
}

impl AuthConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the secret is missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.trim().is_empty() {
            return Err(ConfigError::missing("auth.jwt_secret"));
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required setting is absent or empty.
    #[error("Missing required setting: {field}")]
    Missing {
        /// Dotted path of the setting.
        field: String,
    },
}

impl ConfigError {
    /// Creates a new `Missing` error.
    #[must_use]
    pub fn missing(field: impl Into<String>) -> Self {
        Self::Missing {
            field: field.into(),
        }
    }
}
