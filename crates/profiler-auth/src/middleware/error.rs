//! Error response handling for authentication middleware.

use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::error::AuthError;

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let message = self.to_string();

        let mut headers = HeaderMap::new();
        if status == StatusCode::UNAUTHORIZED {
            let www_auth = build_www_authenticate_header(self.code(), &message);
            if let Ok(value) = HeaderValue::from_str(&www_auth) {
                headers.insert(header::WWW_AUTHENTICATE, value);
            }
        }

        (status, headers, Json(error_body(self.code(), &message))).into_response()
    }
}

fn status_for(error: &AuthError) -> StatusCode {
    match error {
        AuthError::InvalidCredential { .. } | AuthError::ExpiredCredential => {
            StatusCode::UNAUTHORIZED
        }
        AuthError::InsufficientPermissions { .. } | AuthError::ForbiddenResource { .. } => {
            StatusCode::FORBIDDEN
        }
    }
}

/// Builds the WWW-Authenticate header value for 401 responses.
///
/// Format: `Bearer realm="profiler", error="invalid_credential", error_description="..."`
fn build_www_authenticate_header(error: &str, description: &str) -> String {
    let escaped_desc = description.replace('\"', "\\\"");
    format!(
        "Bearer realm=\"profiler\", error=\"{}\", error_description=\"{}\"",
        error, escaped_desc
    )
}

/// JSON body shared by every auth error response.
#[must_use]
pub fn error_body(code: &str, message: &str) -> serde_json::Value {
    json!({
        "error": code,
        "message": message,
    })
}
