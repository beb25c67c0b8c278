//! 本实例持有的实时连接表
//!
//! 连接句柄只存在于接受该连接的实例内存中，从不写入共享存储。

use std::collections::HashSet;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::model::ChatFrame;
use crate::domain::value_object::{RoomId, SessionId};

/// 发往连接写循环的指令
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Frame(ChatFrame),
    Close { code: u16, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("connection {0} is not owned by this instance")]
    NotFound(String),
    #[error("connection {0} is closed")]
    Closed(String),
    #[error("connection {0} outbound buffer is full")]
    Backpressure(String),
}

#[derive(Debug, Clone)]
struct LocalConnection {
    room_id: RoomId,
    sender: mpsc::Sender<OutboundFrame>,
}

#[derive(Default)]
pub struct LocalConnectionTable {
    connections: DashMap<SessionId, LocalConnection>,
}

impl LocalConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        session_id: SessionId,
        room_id: RoomId,
        sender: mpsc::Sender<OutboundFrame>,
    ) {
        self.connections
            .insert(session_id, LocalConnection { room_id, sender });
    }

    /// 移除连接，返回其所在房间
    pub fn remove(&self, session_id: &SessionId) -> Option<RoomId> {
        self.connections
            .remove(session_id)
            .map(|(_, connection)| connection.room_id)
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.connections.contains_key(session_id)
    }

    pub fn room_of(&self, session_id: &SessionId) -> Option<RoomId> {
        self.connections
            .get(session_id)
            .map(|entry| entry.room_id.clone())
    }

    /// 非阻塞投递；慢连接不会拖住整个房间的广播
    pub fn send(&self, session_id: &SessionId, frame: OutboundFrame) -> Result<(), SendError> {
        let sender = self
            .connections
            .get(session_id)
            .map(|entry| entry.sender.clone())
            .ok_or_else(|| SendError::NotFound(session_id.to_string()))?;

        sender.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Closed(_) => SendError::Closed(session_id.to_string()),
            mpsc::error::TrySendError::Full(_) => SendError::Backpressure(session_id.to_string()),
        })
    }

    pub fn sessions_in_room(&self, room_id: &RoomId) -> Vec<SessionId> {
        self.connections
            .iter()
            .filter(|entry| &entry.room_id == room_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// 本实例持有连接的所有房间
    pub fn rooms(&self) -> HashSet<RoomId> {
        self.connections
            .iter()
            .map(|entry| entry.room_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(session: &str, room: &str) -> (SessionId, RoomId) {
        (
            SessionId::parse(session).unwrap(),
            RoomId::parse(room).unwrap(),
        )
    }

    #[tokio::test]
    async fn delivers_to_owned_connection() {
        let table = LocalConnectionTable::new();
        let (session, room) = ids("s-1", "r-1");
        let (tx, mut rx) = mpsc::channel(4);
        table.insert(session.clone(), room.clone(), tx);

        let frame = OutboundFrame::Frame(ChatFrame::system(room.clone(), "hello"));
        table.send(&session, frame.clone()).unwrap();
        assert_eq!(rx.recv().await, Some(frame));
        assert_eq!(table.sessions_in_room(&room), vec![session.clone()]);
        assert_eq!(table.remove(&session), Some(room));
        assert!(table.is_empty());
    }

    #[test]
    fn closed_and_full_connections_report_errors() {
        let table = LocalConnectionTable::new();
        let (closed, room) = ids("s-closed", "r-1");
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        table.insert(closed.clone(), room.clone(), tx);
        let frame = OutboundFrame::Frame(ChatFrame::system(room.clone(), "x"));
        assert!(matches!(
            table.send(&closed, frame.clone()),
            Err(SendError::Closed(_))
        ));

        let (full, _) = ids("s-full", "r-1");
        let (tx, _rx) = mpsc::channel(1);
        table.insert(full.clone(), room, tx);
        table.send(&full, frame.clone()).unwrap();
        assert!(matches!(
            table.send(&full, frame.clone()),
            Err(SendError::Backpressure(_))
        ));

        let (unknown, _) = ids("s-unknown", "r-1");
        assert!(matches!(
            table.send(&unknown, frame),
            Err(SendError::NotFound(_))
        ));
    }
}
