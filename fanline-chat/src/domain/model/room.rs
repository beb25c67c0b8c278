//! 房间记录与状态迁移

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::model::authorization::{RoomConditions, RoomType};
use crate::domain::value_object::RoomId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomStatus {
    Active,
    Waiting,
    Completed,
    Timeout,
    Closed,
}

impl RoomStatus {
    /// 只有 ACTIVE / WAITING 状态的房间接受新参与者
    pub fn accepts_participants(&self) -> bool {
        matches!(self, RoomStatus::Active | RoomStatus::Waiting)
    }

    pub fn is_terminal(&self) -> bool {
        !self.accepts_participants()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Active => "ACTIVE",
            RoomStatus::Waiting => "WAITING",
            RoomStatus::Completed => "COMPLETED",
            RoomStatus::Timeout => "TIMEOUT",
            RoomStatus::Closed => "CLOSED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub room_id: RoomId,
    pub room_type: RoomType,
    pub game_id: String,
    #[serde(default)]
    pub conditions: RoomConditions,
    pub created_by: String,
    pub participant_count: u32,
    pub status: RoomStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RoomRecord {
    pub fn new(
        room_id: RoomId,
        room_type: RoomType,
        game_id: impl Into<String>,
        conditions: RoomConditions,
        created_by: impl Into<String>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        // 匹配房间在人数凑齐前处于等待状态
        let status = match room_type {
            RoomType::Matching => RoomStatus::Waiting,
            RoomType::Game | RoomType::Lounge => RoomStatus::Active,
        };
        Self {
            room_id,
            room_type,
            game_id: game_id.into(),
            conditions,
            created_by: created_by.into(),
            participant_count: 0,
            status,
            created_at,
            expires_at,
        }
    }

    pub fn capacity(&self) -> Option<u32> {
        self.conditions.capacity
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// 到期但尚未被清理的房间同样不再接受参与者
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.status.accepts_participants() && !self.is_expired_at(now)
    }

    /// 同步参与人数，匹配房间满员后转为 ACTIVE
    pub fn set_participant_count(&mut self, count: u32) {
        self.participant_count = count;
        if self.status == RoomStatus::Waiting {
            if let Some(capacity) = self.capacity() {
                if count >= capacity {
                    self.status = RoomStatus::Active;
                }
            }
        }
    }

    /// 迁移到终止状态；已经终止的房间保持原状态，返回是否发生迁移
    pub fn finish(&mut self, status: RoomStatus) -> bool {
        if self.status.is_terminal() || status.accepts_participants() {
            return false;
        }
        self.status = status;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(room_type: RoomType, capacity: Option<u32>) -> RoomRecord {
        let now = Utc::now();
        RoomRecord::new(
            RoomId::parse("r-1").unwrap(),
            room_type,
            "game-7",
            RoomConditions {
                capacity,
                ..RoomConditions::default()
            },
            "u-1",
            now,
            now + Duration::hours(1),
        )
    }

    #[test]
    fn matching_room_waits_until_full() {
        let mut room = record(RoomType::Matching, Some(3));
        assert_eq!(room.status, RoomStatus::Waiting);
        room.set_participant_count(2);
        assert_eq!(room.status, RoomStatus::Waiting);
        room.set_participant_count(3);
        assert_eq!(room.status, RoomStatus::Active);
    }

    #[test]
    fn game_room_starts_active() {
        assert_eq!(record(RoomType::Game, None).status, RoomStatus::Active);
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut room = record(RoomType::Lounge, None);
        assert!(!room.finish(RoomStatus::Active));
        assert!(room.finish(RoomStatus::Completed));
        assert!(!room.finish(RoomStatus::Closed));
        assert_eq!(room.status, RoomStatus::Completed);
        assert!(!room.status.accepts_participants());
    }

    #[test]
    fn expired_room_is_closed_before_sweep() {
        let room = record(RoomType::Lounge, None);
        assert!(room.is_open_at(room.created_at));
        assert!(!room.is_open_at(room.expires_at));
        assert_eq!(room.status, RoomStatus::Active);
    }
}
