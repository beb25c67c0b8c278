//! 授权请求 / 回复模型与授权状态机
//!
//! 身份服务是房间准入相关声明（年龄、性别、胜率等）的信任边界：
//! 授权成功后签发令牌使用的是回复中的身份快照，而不是原始请求中的声明。

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::domain::value_object::CorrelationId;

/// 调用方动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthAction {
    Create,
    Join,
}

impl AuthAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthAction::Create => "create",
            AuthAction::Join => "join",
        }
    }
}

/// 房间类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomType {
    /// 比赛频道：存活到比赛开始时间 + 1 天
    Game,
    /// 条件匹配房间：存活到下一个本地午夜
    Matching,
    /// 开放房间：固定存活时长
    Lounge,
}

impl RoomType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomType::Game => "GAME",
            RoomType::Matching => "MATCHING",
            RoomType::Lounge => "LOUNGE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Gender {
    Male,
    Female,
}

/// 房间的性别条件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenderFilter {
    #[default]
    Any,
    Male,
    Female,
}

/// 调用方身份声明（来自已验证的用户凭证，核心层视为不透明输入）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerClaims {
    pub user_id: String,
    #[serde(default)]
    pub team_id: Option<i64>,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub age: Option<u32>,
    pub nickname: String,
}

/// 房间准入条件
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomConditions {
    #[serde(default)]
    pub min_age: Option<u32>,
    #[serde(default)]
    pub max_age: Option<u32>,
    #[serde(default)]
    pub gender: GenderFilter,
    /// 最低胜率（百分比 0-100）
    #[serde(default)]
    pub min_win_rate: Option<f64>,
    #[serde(default)]
    pub capacity: Option<u32>,
}

impl RoomConditions {
    /// 校验条件自身是否自洽
    pub fn validate(&self) -> Result<(), String> {
        if let (Some(min), Some(max)) = (self.min_age, self.max_age) {
            if min > max {
                return Err(format!("minAge {} is greater than maxAge {}", min, max));
            }
        }
        if let Some(rate) = self.min_win_rate {
            if !(0.0..=100.0).contains(&rate) {
                return Err(format!("minWinRate {} must be within 0..=100", rate));
            }
        }
        if let Some(capacity) = self.capacity {
            if capacity < 2 {
                return Err(format!("capacity {} must be at least 2", capacity));
            }
        }
        Ok(())
    }
}

/// 发往身份服务的授权请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    pub action: AuthAction,
    pub room_type: RoomType,
    /// 创建时为比赛 ID，加入时为房间 ID
    #[serde(rename = "targetRoomOrGame")]
    pub target_id: String,
    pub caller_claims: CallerClaims,
    #[serde(default)]
    pub room_conditions: RoomConditions,
}

/// 身份服务返回的身份快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySnapshot {
    pub user_id: String,
    #[serde(default)]
    pub team_id: Option<i64>,
    #[serde(default)]
    pub team_name: Option<String>,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub age: Option<u32>,
    pub nickname: String,
    #[serde(default)]
    pub win_rate: Option<f64>,
}

impl IdentitySnapshot {
    /// 由调用方声明构造（仅用于无需身份服务参与的握手变体）
    pub fn from_claims(claims: &CallerClaims) -> Self {
        Self {
            user_id: claims.user_id.clone(),
            team_id: claims.team_id,
            team_name: None,
            gender: claims.gender,
            age: claims.age,
            nickname: claims.nickname.clone(),
            win_rate: None,
        }
    }
}

/// 授权拒绝原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialReason {
    RoomNotFound,
    RoomClosed,
    ConditionMismatch,
    DuplicateRoom,
    #[serde(other)]
    Unknown,
}

impl DenialReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenialReason::RoomNotFound => "ROOM_NOT_FOUND",
            DenialReason::RoomClosed => "ROOM_CLOSED",
            DenialReason::ConditionMismatch => "CONDITION_MISMATCH",
            DenialReason::DuplicateRoom => "DUPLICATE_ROOM",
            DenialReason::Unknown => "AUTHORIZATION_DENIED",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            DenialReason::RoomNotFound => "the requested room does not exist",
            DenialReason::RoomClosed => "the requested room is closed",
            DenialReason::ConditionMismatch => "you do not meet the room's conditions",
            DenialReason::DuplicateRoom => "a room already exists for this request",
            DenialReason::Unknown => "authorization was denied",
        }
    }
}

/// 身份服务回复
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationReply {
    pub correlation_id: CorrelationId,
    pub success: bool,
    #[serde(default)]
    pub identity_snapshot: Option<IdentitySnapshot>,
    #[serde(default)]
    pub error_reason: Option<DenialReason>,
}

impl AuthorizationReply {
    pub fn authorized(correlation_id: CorrelationId, snapshot: IdentitySnapshot) -> Self {
        Self {
            correlation_id,
            success: true,
            identity_snapshot: Some(snapshot),
            error_reason: None,
        }
    }

    pub fn denied(correlation_id: CorrelationId, reason: DenialReason) -> Self {
        Self {
            correlation_id,
            success: false,
            identity_snapshot: None,
            error_reason: Some(reason),
        }
    }
}

/// 关联信封：`(correlationId, payload, timestamp)`，载荷字段平铺在消息顶层
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationEnvelope<T> {
    pub correlation_id: CorrelationId,
    #[serde(flatten)]
    pub payload: T,
    /// 发送时间（毫秒时间戳）
    pub timestamp: i64,
}

impl<T> CorrelationEnvelope<T> {
    pub fn new(correlation_id: CorrelationId, payload: T) -> Self {
        Self {
            correlation_id,
            payload,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// 授权状态机：`PENDING → {AUTHORIZED, DENIED, TIMED_OUT}`，三个终态都不可再迁移
#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizationState {
    Pending,
    Authorized(IdentitySnapshot),
    Denied(DenialReason),
    TimedOut,
}

impl AuthorizationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AuthorizationState::Pending)
    }

    pub fn label(&self) -> &'static str {
        match self {
            AuthorizationState::Pending => "pending",
            AuthorizationState::Authorized(_) => "authorized",
            AuthorizationState::Denied(_) => "denied",
            AuthorizationState::TimedOut => "timed_out",
        }
    }

    /// 处理回复；关联 ID 不匹配的回复被忽略
    pub fn on_reply(self, expected: &CorrelationId, reply: AuthorizationReply) -> Self {
        if self.is_terminal() || &reply.correlation_id != expected {
            return self;
        }

        match (reply.success, reply.identity_snapshot) {
            (true, Some(snapshot)) => AuthorizationState::Authorized(snapshot),
            (true, None) => {
                tracing::warn!(
                    correlation_id = %expected,
                    "successful authorization reply without identity snapshot"
                );
                AuthorizationState::Denied(DenialReason::Unknown)
            }
            (false, _) => {
                AuthorizationState::Denied(reply.error_reason.unwrap_or(DenialReason::Unknown))
            }
        }
    }

    pub fn on_timeout(self) -> Self {
        if self.is_terminal() {
            return self;
        }
        AuthorizationState::TimedOut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> IdentitySnapshot {
        IdentitySnapshot {
            user_id: "u-1".to_string(),
            team_id: Some(3),
            team_name: Some("Tigers".to_string()),
            gender: Some(Gender::Female),
            age: Some(27),
            nickname: "kim".to_string(),
            win_rate: Some(61.5),
        }
    }

    #[test]
    fn request_envelope_wire_shape() {
        let envelope = CorrelationEnvelope::new(
            CorrelationId::parse("abc-1").unwrap(),
            AuthorizationRequest {
                action: AuthAction::Join,
                room_type: RoomType::Matching,
                target_id: "room-9".to_string(),
                caller_claims: CallerClaims {
                    user_id: "u-1".to_string(),
                    team_id: Some(3),
                    gender: Some(Gender::Male),
                    age: Some(30),
                    nickname: "lee".to_string(),
                },
                room_conditions: RoomConditions::default(),
            },
        );
        let json: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["correlationId"], "abc-1");
        assert_eq!(json["action"], "join");
        assert_eq!(json["targetRoomOrGame"], "room-9");
        assert_eq!(json["callerClaims"]["userId"], "u-1");
        assert_eq!(json["roomConditions"]["gender"], "ANY");
        assert!(json["timestamp"].as_i64().is_some());
    }

    #[test]
    fn reply_decodes_unknown_reason() {
        let reply: AuthorizationReply = serde_json::from_str(
            r#"{"correlationId":"abc-1","success":false,"errorReason":"BANNED_USER"}"#,
        )
        .unwrap();
        assert_eq!(reply.error_reason, Some(DenialReason::Unknown));
    }

    #[test]
    fn pending_transitions_on_matching_reply_only() {
        let expected = CorrelationId::parse("abc-1").unwrap();
        let other = CorrelationId::parse("abc-2").unwrap();

        let state = AuthorizationState::Pending
            .on_reply(&expected, AuthorizationReply::authorized(other, snapshot()));
        assert_eq!(state, AuthorizationState::Pending);

        let state = state.on_reply(
            &expected,
            AuthorizationReply::authorized(expected.clone(), snapshot()),
        );
        assert_eq!(state, AuthorizationState::Authorized(snapshot()));
    }

    #[test]
    fn terminal_states_do_not_move() {
        let id = CorrelationId::parse("abc-1").unwrap();
        let timed_out = AuthorizationState::Pending.on_timeout();
        assert_eq!(timed_out, AuthorizationState::TimedOut);
        let still = timed_out.on_reply(&id, AuthorizationReply::authorized(id.clone(), snapshot()));
        assert_eq!(still, AuthorizationState::TimedOut);

        let denied = AuthorizationState::Pending.on_reply(
            &id,
            AuthorizationReply::denied(id.clone(), DenialReason::RoomClosed),
        );
        assert_eq!(denied, AuthorizationState::Denied(DenialReason::RoomClosed));
        assert_eq!(denied.clone().on_timeout(), denied);
    }

    #[test]
    fn success_without_snapshot_is_denied() {
        let id = CorrelationId::parse("abc-1").unwrap();
        let reply = AuthorizationReply {
            correlation_id: id.clone(),
            success: true,
            identity_snapshot: None,
            error_reason: None,
        };
        assert_eq!(
            AuthorizationState::Pending.on_reply(&id, reply),
            AuthorizationState::Denied(DenialReason::Unknown)
        );
    }

    #[test]
    fn conditions_validation() {
        let mut conditions = RoomConditions {
            min_age: Some(30),
            max_age: Some(20),
            ..RoomConditions::default()
        };
        assert!(conditions.validate().is_err());
        conditions.max_age = Some(40);
        conditions.min_win_rate = Some(120.0);
        assert!(conditions.validate().is_err());
        conditions.min_win_rate = Some(50.0);
        conditions.capacity = Some(1);
        assert!(conditions.validate().is_err());
        conditions.capacity = Some(4);
        assert!(conditions.validate().is_ok());
    }
}
