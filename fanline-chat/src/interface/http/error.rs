//! HTTP 错误响应：`{"error": {"code", "message"}}`

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::warn;

use crate::application::error::ChatError;
use crate::application::services::{AuthorizationError, HandshakeRejection, TokenError};
use crate::domain::model::DenialReason;
use crate::domain::repository::CredentialError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn room_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "ROOM_NOT_FOUND", "room not found")
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<DenialReason> for ApiError {
    fn from(reason: DenialReason) -> Self {
        let status = match reason {
            DenialReason::RoomNotFound => StatusCode::NOT_FOUND,
            DenialReason::RoomClosed | DenialReason::DuplicateRoom => StatusCode::CONFLICT,
            DenialReason::ConditionMismatch | DenialReason::Unknown => StatusCode::FORBIDDEN,
        };
        Self::new(status, reason.code(), reason.message())
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::RoomNotFound(_) => Self::room_not_found(),
            ChatError::RoomInactive(room_id) => Self::new(
                StatusCode::CONFLICT,
                "ROOM_INACTIVE",
                format!("room {} does not accept participants", room_id),
            ),
            ChatError::RoomFull { room_id, capacity } => Self::new(
                StatusCode::CONFLICT,
                "ROOM_FULL",
                format!("room {} is full ({} participants)", room_id, capacity),
            ),
            ChatError::InvalidRequest(message) => {
                Self::new(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
            }
            ChatError::Store(err) => {
                warn!(error = %err, "store failure surfaced to http caller");
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "UNAVAILABLE",
                    "chat service temporarily unavailable",
                )
            }
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Invalid => Self::new(
                StatusCode::UNAUTHORIZED,
                "TOKEN_INVALID",
                "session token is invalid or expired",
            ),
            TokenError::InvalidTtl => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "session token lifetime misconfigured",
            ),
            TokenError::Unavailable(err) => ChatError::Store(err).into(),
        }
    }
}

impl From<AuthorizationError> for ApiError {
    fn from(err: AuthorizationError) -> Self {
        match err {
            AuthorizationError::Denied(reason) => reason.into(),
            AuthorizationError::Unavailable(reason) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "AUTHORIZATION_UNAVAILABLE",
                reason,
            ),
            AuthorizationError::Room(err) => err.into(),
            AuthorizationError::Token(err) => err.into(),
        }
    }
}

impl From<HandshakeRejection> for ApiError {
    fn from(rejection: HandshakeRejection) -> Self {
        let status = match rejection {
            HandshakeRejection::TokenMissing | HandshakeRejection::TokenInvalid => {
                StatusCode::UNAUTHORIZED
            }
            HandshakeRejection::RoomMissing => StatusCode::BAD_REQUEST,
            HandshakeRejection::RoomMismatch => StatusCode::FORBIDDEN,
            HandshakeRejection::RoomNotFound => StatusCode::NOT_FOUND,
            HandshakeRejection::RoomInactive | HandshakeRejection::RoomFull => StatusCode::CONFLICT,
            HandshakeRejection::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, rejection.code(), rejection.to_string())
    }
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Missing => Self::new(
                StatusCode::UNAUTHORIZED,
                "CREDENTIAL_MISSING",
                "a bearer credential is required",
            ),
            CredentialError::Rejected(_) => Self::new(
                StatusCode::UNAUTHORIZED,
                "CREDENTIAL_INVALID",
                "the bearer credential was rejected",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_object::RoomId;

    #[test]
    fn denial_reasons_map_to_statuses() {
        let err: ApiError = AuthorizationError::Denied(DenialReason::ConditionMismatch).into();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.code, "CONDITION_MISMATCH");

        let err: ApiError = AuthorizationError::Denied(DenialReason::Unknown).into();
        assert_eq!(err.code, "AUTHORIZATION_DENIED");
    }

    #[test]
    fn full_room_is_conflict() {
        let err: ApiError = ChatError::RoomFull {
            room_id: RoomId::parse("r-1").unwrap(),
            capacity: 4,
        }
        .into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "ROOM_FULL");
    }

    #[test]
    fn handshake_rejection_uses_its_code() {
        let err: ApiError = HandshakeRejection::TokenInvalid.into();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.code, "TOKEN_INVALID");
    }
}
