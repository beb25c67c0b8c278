//! 进程内房间事件总线
//!
//! 单机部署与测试使用：多个注册表挂在同一条总线上即可模拟多实例广播。

use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;

use crate::domain::model::RoomEvent;
use crate::domain::repository::{PublishError, RoomEventPublisher, RoomEventSink};

#[derive(Default)]
pub struct InProcessRoomBus {
    sinks: RwLock<Vec<Weak<dyn RoomEventSink>>>,
}

impl InProcessRoomBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, sink: &Arc<dyn RoomEventSink>) {
        let mut sinks = self
            .sinks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sinks.retain(|existing| existing.strong_count() > 0);
        sinks.push(Arc::downgrade(sink));
    }

    fn live_sinks(&self) -> Vec<Arc<dyn RoomEventSink>> {
        self.sinks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

#[async_trait]
impl RoomEventPublisher for InProcessRoomBus {
    async fn publish(&self, event: &RoomEvent) -> Result<(), PublishError> {
        for sink in self.live_sinks() {
            sink.deliver(event.clone());
        }
        Ok(())
    }
}
