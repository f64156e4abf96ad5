//! Authorization error types.
//!
//! Every variant is request scoped: it is surfaced to the caller with a
//! specific status and message and never retried.

use crate::token::TokenError;

/// Errors produced by the authorization gate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The credential is missing, malformed, or its signature does not verify.
    #[error("Invalid credential: {message}")]
    InvalidCredential {
        /// Description of why the credential was rejected.
        message: String,
    },

    /// The credential's expiry has elapsed.
    #[error("Credential expired")]
    ExpiredCredential,

    /// The subject holds none of the roles the endpoint requires.
    #[error("Insufficient permissions: {message}")]
    InsufficientPermissions {
        /// Description of the missing permission.
        message: String,
    },

    /// The subject may not access the requested resource.
    #[error("Forbidden resource: {message}")]
    ForbiddenResource {
        /// Description of the denied resource.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `InvalidCredential` error.
    #[must_use]
    pub fn invalid_credential(message: impl Into<String>) -> Self {
        Self::InvalidCredential {
            message: message.into(),
        }
    }

    /// Creates a new `InsufficientPermissions` error.
    #[must_use]
    pub fn insufficient_permissions(message: impl Into<String>) -> Self {
        Self::InsufficientPermissions {
            message: message.into(),
        }
    }

    /// Creates a new `ForbiddenResource` error.
    #[must_use]
    pub fn forbidden_resource(message: impl Into<String>) -> Self {
        Self::ForbiddenResource {
            message: message.into(),
        }
    }

    /// Returns `true` for authentication failures (401-equivalent).
    #[must_use]
    pub fn is_authentication_error(&self) -> bool {
        matches!(self, Self::InvalidCredential { .. } | Self::ExpiredCredential)
    }

    /// Machine-readable error code used in responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredential { .. } => "invalid_credential",
            Self::ExpiredCredential => "expired_credential",
            Self::InsufficientPermissions { .. } => "insufficient_permissions",
            Self::ForbiddenResource { .. } => "forbidden_resource",
        }
    }
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => Self::ExpiredCredential,
            other => Self::invalid_credential(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_error_mapping() {
        assert_eq!(AuthError::from(TokenError::Expired), AuthError::ExpiredCredential);
        assert!(matches!(
            AuthError::from(TokenError::InvalidSignature),
            AuthError::InvalidCredential { .. }
        ));
        assert!(matches!(
            AuthError::from(TokenError::missing_claim("userId")),
            AuthError::InvalidCredential { ref message } if message.contains("userId")
        ));
    }

    #[test]
    fn test_error_classification() {
        assert!(AuthError::ExpiredCredential.is_authentication_error());
        assert!(AuthError::invalid_credential("bad").is_authentication_error());
        assert!(!AuthError::insufficient_permissions("no").is_authentication_error());
        assert!(!AuthError::forbidden_resource("no").is_authentication_error());
    }
}
