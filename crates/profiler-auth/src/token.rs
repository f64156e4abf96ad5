//! Bearer credential validation.
//!
//! Credentials are HS256-signed JWTs issued by the identity service. Only
//! verification lives here; minting is the identity service's job.
//!
//! ## Claims
//!
//! | claim       | meaning                        |
//! |-------------|--------------------------------|
//! | `userId`    | subject identifier             |
//! | `sub`       | username                       |
//! | `roles`     | role names                     |
//! | `courseIds` | course scopes                  |
//! | `exp`       | expiry (seconds since epoch)   |

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::AuthConfig;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while validating a credential.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The credential has expired.
    #[error("Token expired")]
    Expired,

    /// The signature does not match the shared secret.
    #[error("Invalid signature")]
    InvalidSignature,

    /// The credential is not a well-formed JWT or uses another algorithm.
    #[error("Malformed token: {message}")]
    Malformed {
        /// Description of the decoding failure.
        message: String,
    },

    /// A required claim is missing.
    #[error("Missing required claim: {claim}")]
    MissingClaim {
        /// Name of the missing claim.
        claim: String,
    },
}

impl TokenError {
    /// Creates a new `Malformed` error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Creates a new `MissingClaim` error.
    #[must_use]
    pub fn missing_claim(claim: impl Into<String>) -> Self {
        Self::MissingClaim {
            claim: claim.into(),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::MissingRequiredClaim(claim) => Self::missing_claim(claim.clone()),
            _ => Self::malformed(err.to_string()),
        }
    }
}

// ============================================================================
// Claims
// ============================================================================

/// Claims carried by a bearer credential.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialClaims {
    /// Subject identifier.
    #[serde(default)]
    pub user_id: Option<String>,

    /// Username.
    #[serde(default)]
    pub sub: Option<String>,

    /// Role names.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub roles: Vec<String>,

    /// Course scopes.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub course_ids: Vec<String>,

    /// Expiry as a Unix timestamp.
    pub exp: i64,

    /// Issue time as a Unix timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

impl CredentialClaims {
    /// Returns the non-empty `userId` claim.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::MissingClaim` if the claim is absent or empty.
    pub fn subject(&self) -> Result<&str, TokenError> {
        self.user_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TokenError::missing_claim("userId"))
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

// ============================================================================
// Validator
// ============================================================================

/// Verifies HS256 credentials against a shared secret.
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    /// Creates a validator for `secret`, tolerating `leeway_secs` of clock skew.
    pub fn new(secret: &str, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(&config.jwt_secret, config.leeway_secs)
    }

    /// Decodes `token`, checking signature and expiry.
    ///
    /// # Errors
    ///
    /// - `TokenError::Expired` if `exp` has elapsed
    /// - `TokenError::InvalidSignature` if the signature does not verify
    /// - `TokenError::Malformed` for anything else that fails to decode
    pub fn validate(&self, token: &str) -> Result<CredentialClaims, TokenError> {
        let data = decode::<CredentialClaims>(token, &self.key, &self.validation)?;
        Ok(data.claims)
    }
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("algorithm", &"HS256")
            .field("leeway", &self.validation.leeway)
            .finish()
    }
}
