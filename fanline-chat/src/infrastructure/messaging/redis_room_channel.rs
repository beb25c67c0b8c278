//! 基于 Redis Pub/Sub 的跨实例房间频道
//!
//! 每个房间一个频道 `{prefix}:room-events:{roomId}`，各实例以模式订阅接收全部房间事件。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::domain::model::RoomEvent;
use crate::domain::repository::{PublishError, RoomEventPublisher, RoomEventSink};
use crate::infrastructure::store::KeySpace;

const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(200);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);

pub struct RedisRoomChannel {
    client: redis::Client,
    conn: ConnectionManager,
    keys: KeySpace,
}

impl RedisRoomChannel {
    pub async fn connect(url: &str, keys: KeySpace) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn, keys })
    }

    /// 订阅循环：断线后按指数退避重连，收到关闭信号后退出
    pub async fn run_subscriber(
        self: Arc<Self>,
        sink: Arc<dyn RoomEventSink>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let pattern = self.keys.room_events_pattern();
        let mut delay = RECONNECT_INITIAL_DELAY;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.subscribe_once(&pattern, sink.as_ref(), &mut shutdown).await {
                Ok(SubscriptionEnd::Shutdown) => break,
                Ok(SubscriptionEnd::StreamClosed) => {
                    warn!(pattern = %pattern, "room event stream closed, reconnecting");
                    delay = RECONNECT_INITIAL_DELAY;
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "room event subscription failed"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(RECONNECT_MAX_DELAY);
        }

        info!("room event subscriber stopped");
    }

    async fn subscribe_once(
        &self,
        pattern: &str,
        sink: &dyn RoomEventSink,
        shutdown: &mut watch::Receiver<bool>,
    ) -> redis::RedisResult<SubscriptionEnd> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        info!(pattern = %pattern, "subscribed to room events");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(SubscriptionEnd::Shutdown),
                message = stream.next() => {
                    let Some(message) = message else {
                        return Ok(SubscriptionEnd::StreamClosed);
                    };
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(error = %err, "invalid room event payload");
                            continue;
                        }
                    };
                    self.handle_payload(message.get_channel_name(), &payload, sink);
                }
            }
        }
    }

    fn handle_payload(&self, channel: &str, payload: &str, sink: &dyn RoomEventSink) {
        let event: RoomEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(channel, error = %err, "failed to decode room event");
                return;
            }
        };
        if self.keys.room_from_channel(channel).as_ref() != Some(&event.room_id) {
            debug!(channel, room_id = %event.room_id, "room event on foreign channel ignored");
            return;
        }
        sink.deliver(event);
    }
}

enum SubscriptionEnd {
    Shutdown,
    StreamClosed,
}

#[async_trait]
impl RoomEventPublisher for RedisRoomChannel {
    async fn publish(&self, event: &RoomEvent) -> Result<(), PublishError> {
        let payload =
            serde_json::to_string(event).map_err(|err| PublishError::Encode(err.to_string()))?;
        let channel = self.keys.room_events_channel(&event.room_id);
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(&channel, payload)
            .await
            .map_err(|err| PublishError::Unavailable(err.to_string()))?;
        debug!(channel = %channel, receivers, "room event published");
        Ok(())
    }
}
