use crate::domain::value_object::{InstanceId, RoomId, SessionId};

pub const DEFAULT_KEY_PREFIX: &str = "chat";

/// 共享存储键族
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn session(&self, session_id: &SessionId) -> String {
        format!("{}:session:{}", self.prefix, session_id)
    }

    pub fn room_sessions(&self, room_id: &RoomId) -> String {
        format!("{}:room:{}:sessions", self.prefix, room_id)
    }

    pub fn instance_sessions(&self, instance_id: &InstanceId) -> String {
        format!("{}:instance:{}:sessions", self.prefix, instance_id)
    }

    pub fn heartbeat(&self, session_id: &SessionId) -> String {
        format!("{}:heartbeat:{}", self.prefix, session_id)
    }

    pub fn room(&self, room_id: &RoomId) -> String {
        format!("{}:room:{}", self.prefix, room_id)
    }

    pub fn active_rooms(&self) -> String {
        format!("{}:rooms:active", self.prefix)
    }

    /// `date` 形如 `yyyymmdd`
    pub fn rooms_by_date(&self, date: &str) -> String {
        format!("{}:rooms:date:{}", self.prefix, date)
    }

    pub fn traffic(&self, room_id: &RoomId, bucket: i64) -> String {
        format!("{}:traffic:{}:{}", self.prefix, room_id, bucket)
    }

    pub fn traffic_notice(&self, room_id: &RoomId) -> String {
        format!("{}:traffic:{}:notice", self.prefix, room_id)
    }

    pub fn token(&self, token: &str) -> String {
        format!("{}:token:{}", self.prefix, token)
    }

    pub fn token_pattern(&self) -> String {
        format!("{}:token:*", self.prefix)
    }

    pub fn instances(&self) -> String {
        format!("{}:instances", self.prefix)
    }

    pub fn room_events_channel(&self, room_id: &RoomId) -> String {
        format!("{}:room-events:{}", self.prefix, room_id)
    }

    pub fn room_events_pattern(&self) -> String {
        format!("{}:room-events:*", self.prefix)
    }

    /// 从房间事件频道名中取回房间 ID
    pub fn room_from_channel(&self, channel: &str) -> Option<RoomId> {
        channel
            .strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix(":room-events:"))
            .and_then(|id| RoomId::parse(id).ok())
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}
