use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};
use thiserror::Error;

use huddle_shared::ProtocolError;
use huddle_store::StoreError;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Malformed or empty input.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Not a participant, not the creator, or conversation not public.
    #[error("Forbidden: {0}")]
    Authorization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Identity provider or persistence failure. The detail is logged, never
    /// sent to clients.
    #[error("Service unavailable")]
    Dependency(String),

    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Authentication failed!")]
    AuthenticationFailed,
}

impl ChatError {
    pub fn conversation_not_found() -> Self {
        ChatError::NotFound("conversation".into())
    }

    pub fn not_participant() -> Self {
        ChatError::Authorization("not a participant of this conversation".into())
    }

    /// The uniform failure envelope sent back to clients.
    pub fn envelope(&self) -> Value {
        if let ChatError::Dependency(detail) = self {
            tracing::warn!(detail = %detail, "dependency failure");
        }
        json!({
            "success": false,
            "error": self.to_string(),
        })
    }
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ChatError::NotFound("record".into()),
            other => ChatError::Dependency(other.to_string()),
        }
    }
}

impl From<ProtocolError> for ChatError {
    fn from(e: ProtocolError) -> Self {
        ChatError::Validation(e.to_string())
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match &self {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Authorization(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Dependency(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::AuthenticationRequired | ChatError::AuthenticationFailed => {
                StatusCode::UNAUTHORIZED
            }
        };

        let body = json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_is_uniform() {
        let env = ChatError::not_participant().envelope();
        assert_eq!(env["success"], false);
        assert_eq!(env["error"], "Forbidden: not a participant of this conversation");
    }

    #[test]
    fn test_dependency_detail_is_not_exposed() {
        let env = ChatError::Dependency("disk on fire".into()).envelope();
        assert_eq!(env["error"], "Service unavailable");
    }

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        assert!(matches!(
            ChatError::from(StoreError::NotFound),
            ChatError::NotFound(_)
        ));
        assert!(matches!(
            ChatError::from(StoreError::Migration("x".into())),
            ChatError::Dependency(_)
        ));
    }
}
