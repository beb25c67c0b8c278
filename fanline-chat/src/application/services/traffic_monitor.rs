//! 房间流量监控
//!
//! 每个房间按固定宽度的时间桶计数，滑动窗口内的合计超过阈值时向房间广播一次高流量提示。
//! 提示由存储中的标记限流：同一窗口内最多一次。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fanline_core::metrics::CHAT_METRICS;
use tracing::{info, warn};

use crate::application::services::session_registry::SessionRegistry;
use crate::domain::model::ChatFrame;
use crate::domain::value_object::RoomId;
use crate::infrastructure::store::{KeySpace, SharedStore, StoreError};

pub const HIGH_TRAFFIC_CODE: &str = "HIGH_TRAFFIC";
const HIGH_TRAFFIC_MESSAGE: &str = "The room is very busy right now, messages may be delayed.";

#[derive(Debug, Clone)]
pub struct TrafficSettings {
    pub bucket_width: Duration,
    pub window_buckets: u32,
    /// 窗口内消息数超过该值视为激增
    pub threshold: u64,
}

impl Default for TrafficSettings {
    fn default() -> Self {
        Self {
            bucket_width: Duration::from_secs(60),
            window_buckets: 3,
            threshold: 100,
        }
    }
}

pub struct TrafficMonitor {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    registry: Arc<SessionRegistry>,
    settings: TrafficSettings,
}

impl TrafficMonitor {
    pub fn new(
        store: Arc<dyn SharedStore>,
        keys: KeySpace,
        registry: Arc<SessionRegistry>,
        settings: TrafficSettings,
    ) -> Self {
        Self {
            store,
            keys,
            registry,
            settings,
        }
    }

    pub fn settings(&self) -> &TrafficSettings {
        &self.settings
    }

    fn bucket_secs(&self) -> i64 {
        self.settings.bucket_width.as_secs().max(1) as i64
    }

    fn bucket_of(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp().div_euclid(self.bucket_secs())
    }

    pub async fn increment(&self, room_id: &RoomId) -> Result<i64, StoreError> {
        self.increment_at(room_id, Utc::now()).await
    }

    /// 当前桶计数加一；计数键在窗口滑过后自然过期
    pub async fn increment_at(
        &self,
        room_id: &RoomId,
        at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let key = self.keys.traffic(room_id, self.bucket_of(at));
        let ttl = self.settings.bucket_width * (self.settings.window_buckets + 1);
        self.store.incr_ex(&key, ttl).await
    }

    /// 最近 `window` 个桶的合计，缺失的桶按 0 计
    pub async fn window_total_at(
        &self,
        room_id: &RoomId,
        window: u32,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let current = self.bucket_of(at);
        let keys: Vec<String> = (0..i64::from(window.max(1)))
            .map(|offset| self.keys.traffic(room_id, current - offset))
            .collect();
        let total = self
            .store
            .mget(&keys)
            .await?
            .into_iter()
            .flatten()
            .filter_map(|raw| raw.parse::<u64>().ok())
            .sum();
        Ok(total)
    }

    pub async fn check_spike(&self, room_id: &RoomId, window: u32, threshold: u64) -> bool {
        self.check_spike_at(room_id, window, threshold, Utc::now())
            .await
    }

    /// 窗口合计超过阈值时返回 `true`，并在本窗口尚未提示过时广播提示
    ///
    /// 存储不可用时返回 `false`。
    pub async fn check_spike_at(
        &self,
        room_id: &RoomId,
        window: u32,
        threshold: u64,
        at: DateTime<Utc>,
    ) -> bool {
        let total = match self.window_total_at(room_id, window, at).await {
            Ok(total) => total,
            Err(err) => {
                CHAT_METRICS.record_store_error("traffic_window");
                warn!(room_id = %room_id, error = %err, "traffic window unavailable");
                return false;
            }
        };
        if total <= threshold {
            return false;
        }

        let marker_ttl = self.settings.bucket_width * window.max(1);
        match self
            .store
            .set_nx_ex(&self.keys.traffic_notice(room_id), "1", marker_ttl)
            .await
        {
            Ok(true) => {
                CHAT_METRICS.spike_notices_total.inc();
                info!(room_id = %room_id, total, threshold, "traffic spike detected");
                self.registry
                    .broadcast_to_room(
                        room_id,
                        ChatFrame::notice(room_id.clone(), HIGH_TRAFFIC_CODE, HIGH_TRAFFIC_MESSAGE),
                        None,
                    )
                    .await;
            }
            Ok(false) => {}
            Err(err) => {
                CHAT_METRICS.record_store_error("traffic_notice");
                warn!(room_id = %room_id, error = %err, "traffic notice marker unavailable");
            }
        }
        true
    }

    /// 检查本实例持有连接的所有房间
    pub async fn check_local_rooms(&self) -> usize {
        let mut spiking = 0;
        for room_id in self.registry.local_rooms() {
            if self
                .check_spike(&room_id, self.settings.window_buckets, self.settings.threshold)
                .await
            {
                spiking += 1;
            }
        }
        spiking
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::session_registry::RegistrySettings;
    use crate::domain::model::SessionInfo;
    use crate::domain::value_object::{InstanceId, SessionId};
    use crate::infrastructure::connection::{LocalConnectionTable, OutboundFrame};
    use crate::infrastructure::messaging::InProcessRoomBus;
    use crate::infrastructure::store::{MemoryStore, UnavailableStore};
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    async fn monitor_with_listener(
        room_id: &RoomId,
    ) -> (TrafficMonitor, mpsc::Receiver<OutboundFrame>) {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new(
            InstanceId::parse("inst-a").unwrap(),
            store.clone(),
            KeySpace::default(),
            Arc::new(LocalConnectionTable::new()),
            Arc::new(InProcessRoomBus::new()),
            RegistrySettings::default(),
        ));
        let (tx, rx) = mpsc::channel(16);
        let info = SessionInfo::new(
            SessionId::parse("listener").unwrap(),
            room_id.clone(),
            registry.instance_id().clone(),
            "u-1",
            "listener",
        );
        registry.register(room_id, tx, info, None).await.unwrap();
        let monitor = TrafficMonitor::new(
            store,
            KeySpace::default(),
            registry,
            TrafficSettings::default(),
        );
        (monitor, rx)
    }

    fn minute(n: i64) -> DateTime<Utc> {
        // 对齐到整分钟
        Utc.timestamp_opt(1_700_000_040 + n * 60, 0).unwrap()
    }

    async fn spread(monitor: &TrafficMonitor, room_id: &RoomId, total: u32) {
        for i in 0..total {
            let at = minute(i64::from(i % 3)) + chrono::Duration::seconds(i64::from(i % 50));
            monitor.increment_at(room_id, at).await.unwrap();
        }
    }

    fn drain_notices(rx: &mut mpsc::Receiver<OutboundFrame>) -> usize {
        let mut notices = 0;
        while let Ok(frame) = rx.try_recv() {
            if let OutboundFrame::Frame(ChatFrame::Notice { code, .. }) = frame {
                assert_eq!(code, HIGH_TRAFFIC_CODE);
                notices += 1;
            }
        }
        notices
    }

    #[tokio::test]
    async fn spike_over_threshold_notifies_once() {
        let room_id = RoomId::parse("r-busy").unwrap();
        let (monitor, mut rx) = monitor_with_listener(&room_id).await;
        spread(&monitor, &room_id, 101).await;

        assert_eq!(
            monitor.window_total_at(&room_id, 3, minute(2)).await.unwrap(),
            101
        );
        assert!(monitor.check_spike_at(&room_id, 3, 100, minute(2)).await);
        assert_eq!(drain_notices(&mut rx), 1);

        // 同一窗口内再次检查仍判定为激增，但不再提示
        assert!(monitor.check_spike_at(&room_id, 3, 100, minute(2)).await);
        assert_eq!(drain_notices(&mut rx), 0);
    }

    #[tokio::test]
    async fn below_threshold_is_quiet() {
        let room_id = RoomId::parse("r-calm").unwrap();
        let (monitor, mut rx) = monitor_with_listener(&room_id).await;
        spread(&monitor, &room_id, 99).await;

        assert!(!monitor.check_spike_at(&room_id, 3, 100, minute(2)).await);
        assert_eq!(drain_notices(&mut rx), 0);
    }

    #[tokio::test]
    async fn old_buckets_fall_out_of_window() {
        let room_id = RoomId::parse("r-old").unwrap();
        let (monitor, _rx) = monitor_with_listener(&room_id).await;
        spread(&monitor, &room_id, 101).await;

        // 三分钟后窗口只剩最后一个桶
        let total = monitor.window_total_at(&room_id, 3, minute(4)).await.unwrap();
        assert_eq!(total, 33);
        assert!(!monitor.check_spike_at(&room_id, 3, 100, minute(4)).await);
    }

    #[tokio::test]
    async fn store_outage_reports_no_spike() {
        let store: Arc<dyn SharedStore> = Arc::new(UnavailableStore);
        let registry = Arc::new(SessionRegistry::new(
            InstanceId::parse("inst-a").unwrap(),
            store.clone(),
            KeySpace::default(),
            Arc::new(LocalConnectionTable::new()),
            Arc::new(InProcessRoomBus::new()),
            RegistrySettings::default(),
        ));
        let monitor = TrafficMonitor::new(
            store,
            KeySpace::default(),
            registry,
            TrafficSettings::default(),
        );
        let room_id = RoomId::parse("busy").unwrap();

        assert!(monitor.increment_at(&room_id, minute(0)).await.is_err());
        assert!(!monitor.check_spike_at(&room_id, 3, 0, minute(0)).await);
    }
}
