//! 实时连接帧与跨实例房间事件

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::value_object::{InstanceId, RoomId};

/// WebSocket 关闭码（4000 段为应用自定义）
pub mod close_code {
    pub const GOING_AWAY: u16 = 1001;
    pub const TOKEN_MISSING: u16 = 4001;
    pub const TOKEN_INVALID: u16 = 4002;
    pub const ROOM_MISSING: u16 = 4003;
    pub const ROOM_MISMATCH: u16 = 4004;
    pub const ROOM_NOT_FOUND: u16 = 4005;
    pub const ROOM_INACTIVE: u16 = 4006;
    pub const ROOM_FULL: u16 = 4007;
    pub const UNAVAILABLE: u16 = 4008;
    pub const ROOM_CLOSED: u16 = 4010;
    pub const SESSION_EXPIRED: u16 = 4011;
}

/// 下发给客户端的帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatFrame {
    #[serde(rename_all = "camelCase")]
    Message {
        room_id: RoomId,
        user_id: String,
        nickname: String,
        content: String,
        sent_at: DateTime<Utc>,
    },
    /// 进出房间、房间关闭等系统消息
    #[serde(rename_all = "camelCase")]
    System {
        room_id: RoomId,
        content: String,
        sent_at: DateTime<Utc>,
    },
    /// 保护性提示（例如流量激增）
    #[serde(rename_all = "camelCase")]
    Notice {
        room_id: RoomId,
        code: String,
        content: String,
        sent_at: DateTime<Utc>,
    },
}

impl ChatFrame {
    pub fn system(room_id: RoomId, content: impl Into<String>) -> Self {
        ChatFrame::System {
            room_id,
            content: content.into(),
            sent_at: Utc::now(),
        }
    }

    pub fn notice(room_id: RoomId, code: impl Into<String>, content: impl Into<String>) -> Self {
        ChatFrame::Notice {
            room_id,
            code: code.into(),
            content: content.into(),
            sent_at: Utc::now(),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        match self {
            ChatFrame::Message { room_id, .. }
            | ChatFrame::System { room_id, .. }
            | ChatFrame::Notice { room_id, .. } => room_id,
        }
    }
}

/// 客户端上行帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Message { content: String },
    Heartbeat,
}

/// 跨实例广播事件，经房间频道发布给其他实例
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomEvent {
    pub origin_instance: InstanceId,
    #[serde(default)]
    pub exclude_instance: Option<InstanceId>,
    pub room_id: RoomId,
    pub frame: ChatFrame,
    /// 携带时，接收方投递帧后以该关闭码断开房间内的本地连接
    #[serde(default)]
    pub close_code: Option<u16>,
}

impl RoomEvent {
    /// 接收方实例是否应当投递此事件：来源实例已在本地投递过，被排除的实例跳过
    pub fn should_deliver_on(&self, instance: &InstanceId) -> bool {
        &self.origin_instance != instance && self.exclude_instance.as_ref() != Some(instance)
    }
}
