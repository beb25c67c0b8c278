use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::model::authorization::{IdentitySnapshot, RoomType};
use crate::domain::value_object::{InstanceId, RoomId, SessionId};

/// 会话注册信息（只保存连接的标识元数据，连接本身只存在于所属实例的本地内存中）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub room_id: RoomId,
    pub instance_id: InstanceId,
    pub user_id: String,
    pub nickname: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl SessionInfo {
    pub fn new(
        session_id: SessionId,
        room_id: RoomId,
        instance_id: InstanceId,
        user_id: impl Into<String>,
        nickname: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            room_id,
            instance_id,
            user_id: user_id.into(),
            nickname: nickname.into(),
            connected_at: now,
            last_heartbeat: now,
        }
    }

    /// 刷新心跳时间；只前进不后退
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_heartbeat {
            self.last_heartbeat = at;
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now - self.last_heartbeat > threshold
    }
}

/// 会话令牌的服务端存储内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokenInfo {
    /// 身份服务返回的身份快照
    pub subject: IdentitySnapshot,
    pub room_id: RoomId,
    pub room_type: RoomType,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionTokenInfo {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// 已签发的会话令牌
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    pub token: String,
    #[serde(flatten)]
    pub info: SessionTokenInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> SessionInfo {
        SessionInfo::new(
            SessionId::parse("s-1").unwrap(),
            RoomId::parse("r-1").unwrap(),
            InstanceId::parse("i-1").unwrap(),
            "u-1",
            "kim",
        )
    }

    #[test]
    fn heartbeat_is_monotonic() {
        let mut session = info();
        let later = session.last_heartbeat + Duration::seconds(30);
        session.touch(later);
        assert_eq!(session.last_heartbeat, later);
        session.touch(later - Duration::seconds(10));
        assert_eq!(session.last_heartbeat, later);
    }

    #[test]
    fn staleness_uses_threshold() {
        let session = info();
        let threshold = Duration::seconds(60);
        assert!(!session.is_stale(session.last_heartbeat + Duration::seconds(59), threshold));
        assert!(session.is_stale(session.last_heartbeat + Duration::seconds(61), threshold));
    }
}
