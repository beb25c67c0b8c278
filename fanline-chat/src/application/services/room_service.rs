//! 房间生命周期
//!
//! 房间记录以 JSON 保存在 `room:{id}`，存活期由 [`RoomTtlPolicy`] 按房间类型计算。
//! 记录的键 TTL 比存活期多出一段宽限期，到期清理任务因此总能读到记录并把房间转为 TIMEOUT；
//! 活跃房间集合和按日期的房间索引用于清理和运维查询。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::application::error::ChatError;
use crate::application::services::session_registry::SessionRegistry;
use crate::domain::model::{
    ChatFrame, RoomConditions, RoomRecord, RoomStatus, RoomType, close_code,
};
use crate::domain::service::RoomTtlPolicy;
use crate::domain::value_object::RoomId;
use crate::infrastructure::store::{KeySpace, SharedStore, StoreError};

/// 进入终止状态后房间记录的保留时长
const FINISHED_ROOM_RETENTION: Duration = Duration::from_secs(3600);

/// 存活期结束后记录继续保留的默认时长，需覆盖至少两轮到期清理
pub const DEFAULT_EXPIRY_GRACE: Duration = Duration::from_secs(600);

/// 创建房间所需的参数
#[derive(Debug, Clone)]
pub struct NewRoom {
    pub room_type: RoomType,
    pub game_id: String,
    pub conditions: RoomConditions,
    pub created_by: String,
    /// 比赛开始时间（比赛房间按“开赛后一天”计算存活时长）
    pub event_time: Option<String>,
}

pub struct RoomService {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    policy: RoomTtlPolicy,
    registry: Arc<SessionRegistry>,
    expiry_grace: Duration,
}

impl RoomService {
    pub fn new(
        store: Arc<dyn SharedStore>,
        keys: KeySpace,
        policy: RoomTtlPolicy,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            store,
            keys,
            policy,
            registry,
            expiry_grace: DEFAULT_EXPIRY_GRACE,
        }
    }

    pub fn with_expiry_grace(mut self, grace: Duration) -> Self {
        self.expiry_grace = grace.max(Duration::from_secs(1));
        self
    }

    pub fn policy(&self) -> &RoomTtlPolicy {
        &self.policy
    }

    pub async fn create_room(&self, room_id: RoomId, room: NewRoom) -> Result<RoomRecord, ChatError> {
        self.create_room_at(room_id, room, Utc::now()).await
    }

    pub async fn create_room_at(
        &self,
        room_id: RoomId,
        room: NewRoom,
        now: DateTime<Utc>,
    ) -> Result<RoomRecord, ChatError> {
        room.conditions
            .validate()
            .map_err(ChatError::InvalidRequest)?;

        let ttl = self
            .policy
            .for_room(room.room_type, room.event_time.as_deref(), now);
        let lifetime = chrono::Duration::from_std(ttl)
            .map_err(|err| ChatError::InvalidRequest(err.to_string()))?;
        let record = RoomRecord::new(
            room_id,
            room.room_type,
            room.game_id,
            room.conditions,
            room.created_by,
            now,
            now + lifetime,
        );

        self.save(&record, ttl + self.expiry_grace).await?;
        self.store
            .sadd(&self.keys.active_rooms(), record.room_id.as_str())
            .await?;

        let date_key = self.keys.rooms_by_date(&self.policy.date_key(now));
        self.store
            .zadd(
                &date_key,
                record.room_id.as_str(),
                now.timestamp_millis() as f64,
            )
            .await?;
        // 日期索引保留到次日结束
        self.store
            .expire(
                &date_key,
                self.policy.until_next_midnight(now) + Duration::from_secs(86_400),
            )
            .await?;

        info!(
            room_id = %record.room_id,
            room_type = record.room_type.as_str(),
            status = record.status.as_str(),
            ttl_secs = ttl.as_secs(),
            "room created"
        );
        Ok(record)
    }

    async fn save(&self, record: &RoomRecord, ttl: Duration) -> Result<(), StoreError> {
        let payload = serde_json::to_string(record)?;
        self.store
            .set_ex(&self.keys.room(&record.room_id), &payload, ttl)
            .await
    }

    /// 按记录中的过期时间加宽限期保存；已过期的记录至少保留一个宽限期
    async fn save_keeping_horizon(
        &self,
        record: &RoomRecord,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let remaining = (record.expires_at - now).to_std().unwrap_or(Duration::ZERO);
        self.save(record, remaining + self.expiry_grace).await
    }

    pub async fn get_room(&self, room_id: &RoomId) -> Result<Option<RoomRecord>, ChatError> {
        let key = self.keys.room(room_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<RoomRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(room_id = %room_id, error = %err, "corrupt room record dropped");
                self.store.del(&key).await?;
                Ok(None)
            }
        }
    }

    pub async fn require_room(&self, room_id: &RoomId) -> Result<RoomRecord, ChatError> {
        self.get_room(room_id)
            .await?
            .ok_or_else(|| ChatError::RoomNotFound(room_id.clone()))
    }

    /// 以注册表中的在线人数刷新房间记录的参与人数
    pub async fn sync_participants(&self, room_id: &RoomId) -> Result<Option<RoomRecord>, ChatError> {
        let Some(mut record) = self.get_room(room_id).await? else {
            return Ok(None);
        };
        if record.status.is_terminal() {
            return Ok(Some(record));
        }
        let count = self.registry.session_count(room_id).await;
        let before = record.status;
        record.set_participant_count(u32::try_from(count).unwrap_or(u32::MAX));
        self.save_keeping_horizon(&record, Utc::now()).await?;
        if before != record.status {
            info!(
                room_id = %room_id,
                from = before.as_str(),
                to = record.status.as_str(),
                "room status changed"
            );
        }
        Ok(Some(record))
    }

    /// 运维强制完成
    pub async fn complete_room(&self, room_id: &RoomId) -> Result<RoomRecord, ChatError> {
        self.finish_room(room_id, RoomStatus::Completed, "the room has been completed")
            .await
    }

    /// 运维强制取消
    pub async fn cancel_room(&self, room_id: &RoomId) -> Result<RoomRecord, ChatError> {
        self.finish_room(room_id, RoomStatus::Closed, "the room has been cancelled")
            .await
    }

    async fn finish_room(
        &self,
        room_id: &RoomId,
        status: RoomStatus,
        notice: &str,
    ) -> Result<RoomRecord, ChatError> {
        let mut record = self.require_room(room_id).await?;
        if !record.finish(status) {
            return Err(ChatError::RoomInactive(room_id.clone()));
        }
        self.save(&record, FINISHED_ROOM_RETENTION).await?;
        self.tear_down(&record, notice).await?;
        info!(room_id = %room_id, status = status.as_str(), "room finished");
        Ok(record)
    }

    /// 通知房间、断开所有实例上的连接并清理成员索引
    async fn tear_down(&self, record: &RoomRecord, notice: &str) -> Result<(), ChatError> {
        let room_id = &record.room_id;
        self.registry
            .close_room_connections(
                room_id,
                ChatFrame::system(room_id.clone(), notice),
                close_code::ROOM_CLOSED,
            )
            .await;
        for session in self.registry.get_active_sessions_in_room(room_id).await? {
            self.registry.unregister(room_id, &session.session_id).await?;
        }
        self.store
            .srem(&self.keys.active_rooms(), room_id.as_str())
            .await?;
        Ok(())
    }

    /// 到期房间转为 TIMEOUT 并拆除；记录已消失的房间从活跃集合中移除
    pub async fn expire_due_rooms(&self, now: DateTime<Utc>) -> Result<Vec<RoomId>, ChatError> {
        let mut expired = Vec::new();
        for raw in self.store.smembers(&self.keys.active_rooms()).await? {
            let Ok(room_id) = RoomId::parse(raw) else {
                continue;
            };
            match self.get_room(&room_id).await? {
                None => {
                    // 没有房间记录的条目（例如直连休息室）仍有在线会话时保留
                    if self.registry.session_count(&room_id).await == 0 {
                        self.store
                            .srem(&self.keys.active_rooms(), room_id.as_str())
                            .await?;
                        debug!(room_id = %room_id, "vanished room dropped from active index");
                    }
                }
                Some(mut record) if record.is_expired_at(now) => {
                    if record.finish(RoomStatus::Timeout) {
                        self.save(&record, FINISHED_ROOM_RETENTION).await?;
                    }
                    self.tear_down(&record, "the room has expired").await?;
                    info!(room_id = %room_id, "room expired");
                    expired.push(room_id);
                }
                Some(_) => {}
            }
        }
        Ok(expired)
    }

    /// 指定日期（`yyyymmdd`）创建的房间，按创建时间排序
    pub async fn rooms_created_on(&self, date: &str) -> Result<Vec<RoomId>, ChatError> {
        let members = self
            .store
            .zrange_by_score(
                &self.keys.rooms_by_date(date),
                f64::NEG_INFINITY,
                f64::INFINITY,
            )
            .await?;
        Ok(members
            .into_iter()
            .filter_map(|raw| RoomId::parse(raw).ok())
            .collect())
    }

    pub async fn rooms_created_today(&self) -> Result<Vec<RoomId>, ChatError> {
        self.rooms_created_on(&self.policy.date_key(Utc::now()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::session_registry::RegistrySettings;
    use crate::domain::model::SessionInfo;
    use crate::domain::repository::RoomEventSink;
    use crate::domain::value_object::{InstanceId, SessionId};
    use crate::infrastructure::connection::{LocalConnectionTable, OutboundFrame};
    use crate::infrastructure::messaging::InProcessRoomBus;
    use crate::infrastructure::store::MemoryStore;
    use tokio::sync::mpsc;

    struct Fixture {
        rooms: RoomService,
        registry: Arc<SessionRegistry>,
        _bus: Arc<InProcessRoomBus>,
    }

    fn fixture() -> Fixture {
        fixture_with(RoomTtlPolicy::default())
    }

    fn fixture_with(policy: RoomTtlPolicy) -> Fixture {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let bus = Arc::new(InProcessRoomBus::new());
        let registry = Arc::new(SessionRegistry::new(
            InstanceId::parse("inst-a").unwrap(),
            store.clone(),
            KeySpace::default(),
            Arc::new(LocalConnectionTable::new()),
            bus.clone(),
            RegistrySettings::default(),
        ));
        let sink: Arc<dyn RoomEventSink> = registry.clone();
        bus.attach(&sink);
        let rooms = RoomService::new(
            store,
            KeySpace::default(),
            policy,
            registry.clone(),
        );
        Fixture {
            rooms,
            registry,
            _bus: bus,
        }
    }

    fn new_room(room_type: RoomType, capacity: Option<u32>) -> NewRoom {
        NewRoom {
            room_type,
            game_id: "game-7".to_string(),
            conditions: RoomConditions {
                capacity,
                ..RoomConditions::default()
            },
            created_by: "user-1".to_string(),
            event_time: Some("2099-05-10T18:30:00+09:00".to_string()),
        }
    }

    async fn join(
        fx: &Fixture,
        session: &str,
        room_id: &RoomId,
    ) -> mpsc::Receiver<OutboundFrame> {
        let (tx, rx) = mpsc::channel(8);
        let info = SessionInfo::new(
            SessionId::parse(session).unwrap(),
            room_id.clone(),
            fx.registry.instance_id().clone(),
            session,
            session,
        );
        fx.registry.register(room_id, tx, info, None).await.unwrap();
        rx
    }

    #[tokio::test]
    async fn created_room_is_indexed() {
        let fx = fixture();
        let room_id = RoomId::parse("room-1").unwrap();
        let record = fx
            .rooms
            .create_room(room_id.clone(), new_room(RoomType::Game, None))
            .await
            .unwrap();
        assert_eq!(record.status, RoomStatus::Active);
        assert!(record.expires_at > record.created_at);

        assert_eq!(fx.rooms.require_room(&room_id).await.unwrap(), record);
        assert_eq!(fx.registry.active_rooms().await.unwrap(), vec![room_id.clone()]);
        assert_eq!(fx.rooms.rooms_created_today().await.unwrap(), vec![room_id]);
    }

    #[tokio::test]
    async fn invalid_conditions_are_rejected() {
        let fx = fixture();
        let result = fx
            .rooms
            .create_room(
                RoomId::parse("room-1").unwrap(),
                new_room(RoomType::Matching, Some(1)),
            )
            .await;
        assert!(matches!(result, Err(ChatError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn matching_room_activates_when_full() {
        let fx = fixture();
        let room_id = RoomId::parse("match-1").unwrap();
        let record = fx
            .rooms
            .create_room(room_id.clone(), new_room(RoomType::Matching, Some(2)))
            .await
            .unwrap();
        assert_eq!(record.status, RoomStatus::Waiting);

        let _a = join(&fx, "s-1", &room_id).await;
        let synced = fx.rooms.sync_participants(&room_id).await.unwrap().unwrap();
        assert_eq!(synced.status, RoomStatus::Waiting);

        let _b = join(&fx, "s-2", &room_id).await;
        let synced = fx.rooms.sync_participants(&room_id).await.unwrap().unwrap();
        assert_eq!(synced.participant_count, 2);
        assert_eq!(synced.status, RoomStatus::Active);
    }

    #[tokio::test]
    async fn completing_room_closes_connections_once() {
        let fx = fixture();
        let room_id = RoomId::parse("room-1").unwrap();
        fx.rooms
            .create_room(room_id.clone(), new_room(RoomType::Lounge, None))
            .await
            .unwrap();
        let mut rx = join(&fx, "s-1", &room_id).await;

        let record = fx.rooms.complete_room(&room_id).await.unwrap();
        assert_eq!(record.status, RoomStatus::Completed);
        assert!(matches!(rx.recv().await, Some(OutboundFrame::Frame(_))));
        assert!(matches!(
            rx.recv().await,
            Some(OutboundFrame::Close {
                code: close_code::ROOM_CLOSED,
                ..
            })
        ));
        assert_eq!(fx.registry.session_count(&room_id).await, 0);
        assert!(fx.registry.active_rooms().await.unwrap().is_empty());

        assert!(matches!(
            fx.rooms.cancel_room(&room_id).await,
            Err(ChatError::RoomInactive(_))
        ));
        assert!(matches!(
            fx.rooms.cancel_room(&RoomId::parse("missing").unwrap()).await,
            Err(ChatError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn due_rooms_time_out() {
        let fx = fixture();
        let now = Utc::now();
        let due = RoomId::parse("due").unwrap();
        let fresh = RoomId::parse("fresh").unwrap();
        fx.rooms
            .create_room_at(due.clone(), new_room(RoomType::Lounge, None), now)
            .await
            .unwrap();
        fx.rooms
            .create_room_at(
                fresh.clone(),
                new_room(RoomType::Lounge, None),
                now + chrono::Duration::hours(5),
            )
            .await
            .unwrap();

        // 休息室默认存活 6 小时
        let expired = fx
            .rooms
            .expire_due_rooms(now + chrono::Duration::hours(7))
            .await
            .unwrap();
        assert_eq!(expired, vec![due.clone()]);
        assert_eq!(
            fx.rooms.require_room(&due).await.unwrap().status,
            RoomStatus::Timeout
        );
        assert_eq!(fx.registry.active_rooms().await.unwrap(), vec![fresh]);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_pass_sees_record_once_store_clock_passes_horizon() {
        let ttl = Duration::from_secs(60);
        let fx = fixture_with(RoomTtlPolicy::new(
            chrono_tz::Asia::Seoul,
            Duration::from_secs(30),
            ttl,
            ttl,
        ));
        let start = Utc::now();
        let room_id = RoomId::parse("lounge-1").unwrap();
        fx.rooms
            .create_room_at(room_id.clone(), new_room(RoomType::Lounge, None), start)
            .await
            .unwrap();
        let mut rx = join(&fx, "s-1", &room_id).await;

        let session_id = SessionId::parse("s-1").unwrap();
        for _ in 0..13 {
            tokio::time::advance(Duration::from_secs(5)).await;
            assert!(fx.registry.heartbeat(&session_id).await.unwrap());
        }

        let expired = fx
            .rooms
            .expire_due_rooms(start + chrono::Duration::seconds(65))
            .await
            .unwrap();
        assert_eq!(expired, vec![room_id.clone()]);
        assert_eq!(
            fx.rooms.require_room(&room_id).await.unwrap().status,
            RoomStatus::Timeout
        );
        assert!(matches!(rx.recv().await, Some(OutboundFrame::Frame(_))));
        assert!(matches!(
            rx.recv().await,
            Some(OutboundFrame::Close {
                code: close_code::ROOM_CLOSED,
                ..
            })
        ));
        assert_eq!(fx.registry.session_count(&room_id).await, 0);
        assert!(fx.registry.active_rooms().await.unwrap().is_empty());
    }
}
