//! 分布式会话注册表
//!
//! 共享存储中按房间、按实例维护会话集合，是跨实例的唯一事实来源；连接句柄只保存在所属实例的
//! [`LocalConnectionTable`] 中。存活以心跳为准：网络分区可能吞掉断开事件，因此清理任务只看
//! 心跳是否新鲜，而不依赖显式断开。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use fanline_core::metrics::CHAT_METRICS;
use tracing::{debug, info, warn};

use crate::application::error::ChatError;
use crate::domain::model::{ChatFrame, RoomEvent, SessionInfo, close_code};
use crate::domain::repository::{RoomEventPublisher, RoomEventSink};
use crate::domain::value_object::{InstanceId, RoomId, SessionId};
use crate::infrastructure::connection::{LocalConnectionTable, OutboundFrame};
use crate::infrastructure::store::{BoundedAdd, KeySpace, SharedStore, StoreError};

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// 会话元数据与索引集合的 TTL（注册与心跳时刷新）
    pub session_ttl: Duration,
    pub heartbeat_ttl: Duration,
    /// 心跳超过该时长视为失活
    pub inactivity_threshold: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(180),
            heartbeat_ttl: Duration::from_secs(90),
            inactivity_threshold: Duration::from_secs(60),
        }
    }
}

/// 一次清理的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed_sessions: Vec<SessionId>,
    pub reaped_instances: Vec<InstanceId>,
}

pub struct SessionRegistry {
    instance_id: InstanceId,
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    connections: Arc<LocalConnectionTable>,
    publisher: Arc<dyn RoomEventPublisher>,
    settings: RegistrySettings,
}

const FIELD_SESSION_ID: &str = "sessionId";
const FIELD_ROOM_ID: &str = "roomId";
const FIELD_INSTANCE_ID: &str = "instanceId";
const FIELD_USER_ID: &str = "userId";
const FIELD_NICKNAME: &str = "nickname";
const FIELD_CONNECTED_AT: &str = "connectedAt";
const FIELD_LAST_HEARTBEAT: &str = "lastHeartbeat";

fn session_fields(info: &SessionInfo) -> Vec<(String, String)> {
    vec![
        (FIELD_SESSION_ID.to_string(), info.session_id.to_string()),
        (FIELD_ROOM_ID.to_string(), info.room_id.to_string()),
        (FIELD_INSTANCE_ID.to_string(), info.instance_id.to_string()),
        (FIELD_USER_ID.to_string(), info.user_id.clone()),
        (FIELD_NICKNAME.to_string(), info.nickname.clone()),
        (
            FIELD_CONNECTED_AT.to_string(),
            info.connected_at.timestamp_millis().to_string(),
        ),
        (
            FIELD_LAST_HEARTBEAT.to_string(),
            info.last_heartbeat.timestamp_millis().to_string(),
        ),
    ]
}

fn millis_to_datetime(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn session_from_fields(fields: &HashMap<String, String>) -> Option<SessionInfo> {
    Some(SessionInfo {
        session_id: SessionId::parse(fields.get(FIELD_SESSION_ID)?.as_str()).ok()?,
        room_id: RoomId::parse(fields.get(FIELD_ROOM_ID)?.as_str()).ok()?,
        instance_id: InstanceId::parse(fields.get(FIELD_INSTANCE_ID)?.as_str()).ok()?,
        user_id: fields.get(FIELD_USER_ID)?.clone(),
        nickname: fields.get(FIELD_NICKNAME).cloned().unwrap_or_default(),
        connected_at: millis_to_datetime(fields.get(FIELD_CONNECTED_AT)?)?,
        last_heartbeat: millis_to_datetime(fields.get(FIELD_LAST_HEARTBEAT)?)?,
    })
}

impl SessionRegistry {
    pub fn new(
        instance_id: InstanceId,
        store: Arc<dyn SharedStore>,
        keys: KeySpace,
        connections: Arc<LocalConnectionTable>,
        publisher: Arc<dyn RoomEventPublisher>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            instance_id,
            store,
            keys,
            connections,
            publisher,
            settings,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn connections(&self) -> &Arc<LocalConnectionTable> {
        &self.connections
    }

    /// 注册会话
    ///
    /// 声明了容量的房间使用存储端原子的有界添加，满员时返回 [`ChatError::RoomFull`]。
    /// 连接句柄只进入本地连接表。
    pub async fn register(
        &self,
        room_id: &RoomId,
        connection: tokio::sync::mpsc::Sender<OutboundFrame>,
        info: SessionInfo,
        capacity: Option<u32>,
    ) -> Result<(), ChatError> {
        let session_id = info.session_id.clone();
        let room_key = self.keys.room_sessions(room_id);

        match capacity {
            Some(capacity) => {
                let outcome = self
                    .store
                    .sadd_bounded(&room_key, session_id.as_str(), capacity, self.settings.session_ttl)
                    .await?;
                if outcome == BoundedAdd::Full {
                    debug!(room_id = %room_id, capacity, "room full, registration refused");
                    return Err(ChatError::RoomFull {
                        room_id: room_id.clone(),
                        capacity,
                    });
                }
            }
            None => {
                self.store.sadd(&room_key, session_id.as_str()).await?;
                self.store.expire(&room_key, self.settings.session_ttl).await?;
            }
        }

        if let Err(err) = self.write_session_metadata(room_id, &info).await {
            // 已加入房间集合，回滚后再报错
            if let Err(cleanup) = self.unregister(room_id, &session_id).await {
                warn!(session_id = %session_id, error = %cleanup, "rollback after failed registration failed");
            }
            return Err(err.into());
        }

        self.connections
            .insert(session_id.clone(), room_id.clone(), connection);
        CHAT_METRICS.local_sessions.set(self.connections.len() as i64);

        info!(
            session_id = %session_id,
            room_id = %room_id,
            instance_id = %self.instance_id,
            user_id = %info.user_id,
            "session registered"
        );
        Ok(())
    }

    async fn write_session_metadata(
        &self,
        room_id: &RoomId,
        info: &SessionInfo,
    ) -> Result<(), StoreError> {
        let ttl = self.settings.session_ttl;
        let instance_key = self.keys.instance_sessions(&info.instance_id);
        self.store
            .sadd(&instance_key, info.session_id.as_str())
            .await?;
        self.store.expire(&instance_key, ttl).await?;

        let session_key = self.keys.session(&info.session_id);
        self.store
            .hset_multiple(&session_key, &session_fields(info))
            .await?;
        self.store.expire(&session_key, ttl).await?;

        self.store
            .set_ex(
                &self.keys.heartbeat(&info.session_id),
                &info.last_heartbeat.timestamp_millis().to_string(),
                self.settings.heartbeat_ttl,
            )
            .await?;
        self.store
            .sadd(&self.keys.active_rooms(), room_id.as_str())
            .await?;
        Ok(())
    }

    /// 注销会话；重复调用不报错
    pub async fn unregister(
        &self,
        room_id: &RoomId,
        session_id: &SessionId,
    ) -> Result<(), ChatError> {
        let owner = self
            .load_session(session_id)
            .await?
            .map(|info| info.instance_id)
            .unwrap_or_else(|| self.instance_id.clone());

        self.store
            .srem(&self.keys.room_sessions(room_id), session_id.as_str())
            .await?;
        self.store
            .srem(&self.keys.instance_sessions(&owner), session_id.as_str())
            .await?;
        if owner != self.instance_id {
            // 元数据中的实例可能已过期，本实例集合里也清一次
            self.store
                .srem(
                    &self.keys.instance_sessions(&self.instance_id),
                    session_id.as_str(),
                )
                .await?;
        }
        self.store.del(&self.keys.session(session_id)).await?;
        self.store.del(&self.keys.heartbeat(session_id)).await?;

        if self.connections.remove(session_id).is_some() {
            CHAT_METRICS.local_sessions.set(self.connections.len() as i64);
            debug!(session_id = %session_id, room_id = %room_id, "local connection released");
        }
        Ok(())
    }

    /// 房间未知时注销：枚举活跃房间逐个探测成员关系（房间数远小于会话数）
    pub async fn unregister_from_all_rooms(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<RoomId>, ChatError> {
        let mut removed_from = Vec::new();
        for raw in self.store.smembers(&self.keys.active_rooms()).await? {
            let Ok(room_id) = RoomId::parse(raw) else {
                continue;
            };
            if self
                .store
                .sismember(&self.keys.room_sessions(&room_id), session_id.as_str())
                .await?
            {
                self.unregister(&room_id, session_id).await?;
                removed_from.push(room_id);
            }
        }

        // 不在任何房间集合中也要清掉元数据与本地句柄
        if removed_from.is_empty() {
            let room_id = self.connections.room_of(session_id);
            if let Some(room_id) = room_id {
                self.unregister(&room_id, session_id).await?;
            } else {
                self.store.del(&self.keys.session(session_id)).await?;
                self.store.del(&self.keys.heartbeat(session_id)).await?;
            }
        }
        Ok(removed_from)
    }

    /// 刷新心跳；会话已不存在时返回 `false`
    pub async fn heartbeat(&self, session_id: &SessionId) -> Result<bool, ChatError> {
        self.heartbeat_at(session_id, Utc::now()).await
    }

    pub async fn heartbeat_at(
        &self,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<bool, ChatError> {
        let Some(mut info) = self.load_session(session_id).await? else {
            return Ok(false);
        };
        info.touch(now);
        let last = info.last_heartbeat.timestamp_millis().to_string();
        let ttl = self.settings.session_ttl;

        self.store
            .set_ex(
                &self.keys.heartbeat(session_id),
                &last,
                self.settings.heartbeat_ttl,
            )
            .await?;
        let session_key = self.keys.session(session_id);
        self.store
            .hset_multiple(&session_key, &[(FIELD_LAST_HEARTBEAT.to_string(), last)])
            .await?;
        self.store.expire(&session_key, ttl).await?;
        self.store
            .expire(&self.keys.room_sessions(&info.room_id), ttl)
            .await?;
        self.store
            .expire(&self.keys.instance_sessions(&info.instance_id), ttl)
            .await?;
        Ok(true)
    }

    pub async fn load_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionInfo>, StoreError> {
        let fields = self.store.hgetall(&self.keys.session(session_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(session_from_fields(&fields))
    }

    pub async fn cleanup_inactive_sessions(&self) -> Result<Vec<SessionId>, ChatError> {
        self.cleanup_inactive_sessions_at(Utc::now()).await
    }

    /// 移除心跳超过阈值（或心跳已过期）的会话
    pub async fn cleanup_inactive_sessions_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionId>, ChatError> {
        let threshold_ms = self.settings.inactivity_threshold.as_millis() as i64;
        let now_ms = now.timestamp_millis();
        let mut removed = Vec::new();

        for raw_room in self.store.smembers(&self.keys.active_rooms()).await? {
            let Ok(room_id) = RoomId::parse(raw_room) else {
                continue;
            };
            for raw_session in self.store.smembers(&self.keys.room_sessions(&room_id)).await? {
                let Ok(session_id) = SessionId::parse(raw_session) else {
                    continue;
                };
                let last_beat = self
                    .store
                    .get(&self.keys.heartbeat(&session_id))
                    .await?
                    .and_then(|raw| raw.parse::<i64>().ok());
                let stale = match last_beat {
                    Some(beat) => now_ms - beat > threshold_ms,
                    None => true,
                };
                if !stale {
                    continue;
                }

                self.connections
                    .send(
                        &session_id,
                        OutboundFrame::Close {
                            code: close_code::SESSION_EXPIRED,
                            reason: "heartbeat timeout".to_string(),
                        },
                    )
                    .ok();
                self.unregister(&room_id, &session_id).await?;
                removed.push(session_id);
            }
        }

        if !removed.is_empty() {
            CHAT_METRICS.swept_sessions_total.inc_by(removed.len() as u64);
            info!(removed = removed.len(), "inactive sessions swept");
        }
        Ok(removed)
    }

    /// 宣告本实例存活
    pub async fn announce_instance(&self) -> Result<(), ChatError> {
        self.announce_instance_at(Utc::now()).await
    }

    pub async fn announce_instance_at(&self, now: DateTime<Utc>) -> Result<(), ChatError> {
        self.store
            .zadd(
                &self.keys.instances(),
                self.instance_id.as_str(),
                now.timestamp_millis() as f64,
            )
            .await?;
        self.store
            .expire(
                &self.keys.instance_sessions(&self.instance_id),
                self.settings.session_ttl,
            )
            .await?;
        Ok(())
    }

    /// 回收存活宣告超过阈值的实例（整个实例消失的情况）
    pub async fn reap_dead_instances_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<InstanceId>, ChatError> {
        let cutoff = now.timestamp_millis() - self.settings.inactivity_threshold.as_millis() as i64;
        let dead = self
            .store
            .zrange_by_score(&self.keys.instances(), f64::NEG_INFINITY, cutoff as f64)
            .await?;

        let mut reaped = Vec::new();
        for raw in dead {
            let Ok(instance_id) = InstanceId::parse(raw) else {
                continue;
            };
            if instance_id == self.instance_id {
                continue;
            }
            let sessions = self
                .store
                .smembers(&self.keys.instance_sessions(&instance_id))
                .await?;
            for raw_session in &sessions {
                let Ok(session_id) = SessionId::parse(raw_session.as_str()) else {
                    continue;
                };
                match self.load_session(&session_id).await? {
                    Some(info) => self.unregister(&info.room_id, &session_id).await?,
                    None => {
                        self.unregister_from_all_rooms(&session_id).await?;
                    }
                }
            }
            self.store
                .del(&self.keys.instance_sessions(&instance_id))
                .await?;
            self.store
                .zrem(&self.keys.instances(), instance_id.as_str())
                .await?;
            warn!(
                instance_id = %instance_id,
                sessions = sessions.len(),
                "dead instance reaped"
            );
            reaped.push(instance_id);
        }
        Ok(reaped)
    }

    /// 一轮完整清理：失活会话 + 失联实例
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, ChatError> {
        let removed_sessions = self.cleanup_inactive_sessions_at(now).await?;
        let reaped_instances = self.reap_dead_instances_at(now).await?;
        Ok(SweepReport {
            removed_sessions,
            reaped_instances,
        })
    }

    /// 实例下线：断开并注销本地全部会话，撤销存活宣告
    pub async fn retire_instance(&self) -> Result<usize, ChatError> {
        let sessions = self.connections.session_ids();
        for session_id in &sessions {
            self.connections
                .send(
                    session_id,
                    OutboundFrame::Close {
                        code: close_code::GOING_AWAY,
                        reason: "server shutting down".to_string(),
                    },
                )
                .ok();
            match self.connections.room_of(session_id) {
                Some(room_id) => self.unregister(&room_id, session_id).await?,
                None => {
                    self.unregister_from_all_rooms(session_id).await?;
                }
            }
        }
        self.store
            .del(&self.keys.instance_sessions(&self.instance_id))
            .await?;
        self.store
            .zrem(&self.keys.instances(), self.instance_id.as_str())
            .await?;
        info!(instance_id = %self.instance_id, sessions = sessions.len(), "instance retired");
        Ok(sessions.len())
    }

    pub async fn get_active_sessions_in_room(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<SessionInfo>, ChatError> {
        let mut sessions = Vec::new();
        for raw in self.store.smembers(&self.keys.room_sessions(room_id)).await? {
            let Ok(session_id) = SessionId::parse(raw) else {
                continue;
            };
            if let Some(info) = self.load_session(&session_id).await? {
                sessions.push(info);
            }
        }
        sessions.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        Ok(sessions)
    }

    /// 房间在线人数；存储不可用时记日志并返回 0
    pub async fn session_count(&self, room_id: &RoomId) -> u64 {
        match self.store.scard(&self.keys.room_sessions(room_id)).await {
            Ok(count) => count,
            Err(err) => {
                CHAT_METRICS.record_store_error("scard");
                warn!(room_id = %room_id, error = %err, "session count unavailable");
                0
            }
        }
    }

    /// 各实例持有的会话数
    pub async fn instance_distribution(&self) -> Result<BTreeMap<String, u64>, ChatError> {
        let instances = self
            .store
            .zrange_by_score(&self.keys.instances(), f64::NEG_INFINITY, f64::INFINITY)
            .await?;
        let mut distribution = BTreeMap::new();
        for instance in instances {
            let Ok(instance_id) = InstanceId::parse(instance) else {
                continue;
            };
            let count = self
                .store
                .scard(&self.keys.instance_sessions(&instance_id))
                .await?;
            distribution.insert(instance_id.to_string(), count);
        }
        Ok(distribution)
    }

    pub async fn active_rooms(&self) -> Result<Vec<RoomId>, ChatError> {
        let mut rooms: Vec<RoomId> = self
            .store
            .smembers(&self.keys.active_rooms())
            .await?
            .into_iter()
            .filter_map(|raw| RoomId::parse(raw).ok())
            .collect();
        rooms.sort();
        Ok(rooms)
    }

    /// 本实例持有连接的房间
    pub fn local_rooms(&self) -> HashSet<RoomId> {
        self.connections.rooms()
    }

    /// 投递给本实例持有的房间连接；单个连接失败只记录，不影响其余连接
    pub fn deliver_local(&self, room_id: &RoomId, frame: &ChatFrame) -> usize {
        let mut delivered = 0;
        for session_id in self.connections.sessions_in_room(room_id) {
            match self
                .connections
                .send(&session_id, OutboundFrame::Frame(frame.clone()))
            {
                Ok(()) => delivered += 1,
                Err(err) => {
                    CHAT_METRICS.broadcast_failures_total.inc();
                    warn!(
                        session_id = %session_id,
                        room_id = %room_id,
                        error = %err,
                        "failed to deliver frame to connection"
                    );
                }
            }
        }
        delivered
    }

    /// 房间广播：本地连接直接投递，同时经房间频道发布给其他实例
    ///
    /// `exclude_instance` 指定的实例不投递（可以是本实例）。返回本地投递数。
    pub async fn broadcast_to_room(
        &self,
        room_id: &RoomId,
        frame: ChatFrame,
        exclude_instance: Option<&InstanceId>,
    ) -> usize {
        self.fan_out(room_id, frame, exclude_instance, None).await
    }

    /// 广播最后一帧后断开房间内所有实例上的连接
    pub async fn close_room_connections(&self, room_id: &RoomId, frame: ChatFrame, code: u16) {
        self.fan_out(room_id, frame, None, Some(code)).await;
    }

    async fn fan_out(
        &self,
        room_id: &RoomId,
        frame: ChatFrame,
        exclude_instance: Option<&InstanceId>,
        close: Option<u16>,
    ) -> usize {
        let delivered = if exclude_instance == Some(&self.instance_id) {
            0
        } else {
            let delivered = self.deliver_local(room_id, &frame);
            if let Some(code) = close {
                self.close_local(room_id, code);
            }
            delivered
        };

        let event = RoomEvent {
            origin_instance: self.instance_id.clone(),
            exclude_instance: exclude_instance.cloned(),
            room_id: room_id.clone(),
            frame,
            close_code: close,
        };
        if let Err(err) = self.publisher.publish(&event).await {
            CHAT_METRICS.broadcast_failures_total.inc();
            warn!(room_id = %room_id, error = %err, "failed to publish room event");
        }
        delivered
    }

    fn close_local(&self, room_id: &RoomId, code: u16) {
        for session_id in self.connections.sessions_in_room(room_id) {
            self.connections
                .send(
                    &session_id,
                    OutboundFrame::Close {
                        code,
                        reason: "room closed".to_string(),
                    },
                )
                .ok();
            self.connections.remove(&session_id);
        }
        CHAT_METRICS.local_sessions.set(self.connections.len() as i64);
    }
}

impl RoomEventSink for SessionRegistry {
    fn deliver(&self, event: RoomEvent) {
        if !event.should_deliver_on(&self.instance_id) {
            return;
        }
        self.deliver_local(&event.room_id, &event.frame);
        if let Some(code) = event.close_code {
            self.close_local(&event.room_id, code);
        }
    }
}
