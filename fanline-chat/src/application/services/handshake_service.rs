//! 实时连接握手校验
//!
//! 升级前依次检查：房间标识、会话令牌（或直连休息室的身份声明）、房间是否存在且接受参与者、
//! 容量预检。容量预检只是尽力而为，注册时的原子有界添加才是最终裁决。

use std::sync::Arc;

use chrono::Utc;
use fanline_core::metrics::CHAT_METRICS;
use thiserror::Error;
use tracing::{debug, warn};

use crate::application::services::room_service::RoomService;
use crate::application::services::session_registry::SessionRegistry;
use crate::application::services::token_service::{SessionTokenService, TokenError};
use crate::domain::model::{
    CallerClaims, IdentitySnapshot, RoomRecord, RoomType, SessionTokenInfo, close_code,
};
use crate::domain::value_object::RoomId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandshakeRejection {
    #[error("session token missing")]
    TokenMissing,
    #[error("session token invalid or expired")]
    TokenInvalid,
    #[error("room id missing")]
    RoomMissing,
    #[error("session token was issued for another room")]
    RoomMismatch,
    #[error("room not found")]
    RoomNotFound,
    #[error("room does not accept participants")]
    RoomInactive,
    #[error("room is full")]
    RoomFull,
    #[error("chat service temporarily unavailable")]
    Unavailable,
}

impl HandshakeRejection {
    pub fn code(&self) -> &'static str {
        match self {
            HandshakeRejection::TokenMissing => "TOKEN_MISSING",
            HandshakeRejection::TokenInvalid => "TOKEN_INVALID",
            HandshakeRejection::RoomMissing => "ROOM_MISSING",
            HandshakeRejection::RoomMismatch => "ROOM_MISMATCH",
            HandshakeRejection::RoomNotFound => "ROOM_NOT_FOUND",
            HandshakeRejection::RoomInactive => "ROOM_INACTIVE",
            HandshakeRejection::RoomFull => "ROOM_FULL",
            HandshakeRejection::Unavailable => "UNAVAILABLE",
        }
    }

    /// 升级后拒绝时使用的 WebSocket 关闭码
    pub fn close_code(&self) -> u16 {
        match self {
            HandshakeRejection::TokenMissing => close_code::TOKEN_MISSING,
            HandshakeRejection::TokenInvalid => close_code::TOKEN_INVALID,
            HandshakeRejection::RoomMissing => close_code::ROOM_MISSING,
            HandshakeRejection::RoomMismatch => close_code::ROOM_MISMATCH,
            HandshakeRejection::RoomNotFound => close_code::ROOM_NOT_FOUND,
            HandshakeRejection::RoomInactive => close_code::ROOM_INACTIVE,
            HandshakeRejection::RoomFull => close_code::ROOM_FULL,
            HandshakeRejection::Unavailable => close_code::UNAVAILABLE,
        }
    }
}

/// 握手参数（来自查询串或请求头）
#[derive(Debug, Clone, Default)]
pub struct HandshakeRequest {
    pub token: Option<String>,
    pub room_id: Option<String>,
    /// 直连休息室时携带的身份声明
    pub direct_claims: Option<CallerClaims>,
}

/// 通过握手的连接
#[derive(Debug, Clone)]
pub struct AdmittedSession {
    pub subject: IdentitySnapshot,
    pub room: RoomRecord,
    /// 直连时为 `None`
    pub token: Option<SessionTokenInfo>,
}

pub struct HandshakeService {
    tokens: Arc<SessionTokenService>,
    rooms: Arc<RoomService>,
    registry: Arc<SessionRegistry>,
    allow_direct_claims: bool,
}

impl HandshakeService {
    pub fn new(
        tokens: Arc<SessionTokenService>,
        rooms: Arc<RoomService>,
        registry: Arc<SessionRegistry>,
        allow_direct_claims: bool,
    ) -> Self {
        Self {
            tokens,
            rooms,
            registry,
            allow_direct_claims,
        }
    }

    pub async fn admit(
        &self,
        request: HandshakeRequest,
    ) -> Result<AdmittedSession, HandshakeRejection> {
        let result = self.check(request).await;
        if let Err(rejection) = &result {
            CHAT_METRICS
                .handshake_rejections_total
                .with_label_values(&[rejection.code()])
                .inc();
            debug!(reason = rejection.code(), "handshake rejected");
        }
        result
    }

    async fn check(&self, request: HandshakeRequest) -> Result<AdmittedSession, HandshakeRejection> {
        let room_id = request
            .room_id
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .ok_or(HandshakeRejection::RoomMissing)?;
        let room_id = RoomId::parse(room_id).map_err(|_| HandshakeRejection::RoomNotFound)?;

        let token = request
            .token
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty());

        let (subject, token_info) = match (token, request.direct_claims) {
            (Some(token), _) => {
                let info = self.tokens.validate(token).await.map_err(|err| match err {
                    TokenError::Unavailable(store) => {
                        warn!(error = %store, "token store unavailable during handshake");
                        HandshakeRejection::Unavailable
                    }
                    TokenError::Invalid | TokenError::InvalidTtl => HandshakeRejection::TokenInvalid,
                })?;
                if info.room_id != room_id {
                    return Err(HandshakeRejection::RoomMismatch);
                }
                (info.subject.clone(), Some(info))
            }
            (None, Some(claims)) if self.allow_direct_claims => {
                (IdentitySnapshot::from_claims(&claims), None)
            }
            (None, _) => return Err(HandshakeRejection::TokenMissing),
        };

        let room = match self.rooms.get_room(&room_id).await {
            Ok(Some(room)) => room,
            Ok(None) => return Err(HandshakeRejection::RoomNotFound),
            Err(err) => {
                warn!(room_id = %room_id, error = %err, "room lookup failed during handshake");
                return Err(HandshakeRejection::Unavailable);
            }
        };

        // 直连只开放给休息室
        if token_info.is_none() && room.room_type != RoomType::Lounge {
            return Err(HandshakeRejection::TokenMissing);
        }
        if !room.is_open_at(Utc::now()) {
            return Err(HandshakeRejection::RoomInactive);
        }
        if let Some(capacity) = room.capacity() {
            if self.registry.session_count(&room_id).await >= u64::from(capacity) {
                return Err(HandshakeRejection::RoomFull);
            }
        }

        Ok(AdmittedSession {
            subject,
            room,
            token: token_info,
        })
    }
}
