use fanline_core::error::{ErrorBuilder, ErrorCode, FanlineError};
use thiserror::Error;

use crate::domain::value_object::RoomId;
use crate::infrastructure::store::StoreError;

/// 房间与会话协调错误
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("room {0} not found")]
    RoomNotFound(RoomId),
    #[error("room {0} does not accept participants")]
    RoomInactive(RoomId),
    #[error("room {room_id} is full (capacity {capacity})")]
    RoomFull { room_id: RoomId, capacity: u32 },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ChatError> for FanlineError {
    fn from(err: ChatError) -> Self {
        let code = match &err {
            ChatError::RoomNotFound(_) => ErrorCode::NotFound,
            ChatError::RoomInactive(_) | ChatError::RoomFull { .. } => ErrorCode::Conflict,
            ChatError::InvalidRequest(_) => ErrorCode::InvalidParameter,
            ChatError::Store(StoreError::Serialization(_)) => ErrorCode::SerializationError,
            ChatError::Store(_) => ErrorCode::DatabaseError,
        };
        ErrorBuilder::new(code, "chat coordination failed")
            .details(err.to_string())
            .build_error()
    }
}
