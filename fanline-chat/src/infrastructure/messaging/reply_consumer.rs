//! 授权回复 Kafka 消费者
//!
//! 独立的接收任务：解码回复后交给关联器，由关联器唤醒对应的等待方。
//! 每个实例使用自己的消费组，保证每个实例都能看到全部回复。

use std::sync::Arc;
use std::time::Duration;

use fanline_core::error::{ErrorBuilder, ErrorCode, Result, map_infra_error};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ChatServerConfig;
use crate::domain::model::AuthorizationReply;
use crate::domain::repository::{AuthReplySink, ReplyDisposition};
use crate::infrastructure::messaging::kafka_publisher::base_client_config;

const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// 解码一条回复消息并交给接收方；无法解码的消息返回 `None`
pub fn dispatch_reply(sink: &dyn AuthReplySink, payload: &[u8]) -> Option<ReplyDisposition> {
    match serde_json::from_slice::<AuthorizationReply>(payload) {
        Ok(reply) => Some(sink.complete(reply)),
        Err(err) => {
            warn!(error = %err, "failed to decode authorization reply");
            None
        }
    }
}

pub struct AuthReplyConsumer {
    consumer: StreamConsumer,
    sink: Arc<dyn AuthReplySink>,
    topic: String,
    group: String,
}

impl AuthReplyConsumer {
    pub fn new(config: &ChatServerConfig, sink: Arc<dyn AuthReplySink>) -> Result<Self> {
        let group = config.reply_consumer_group();
        let consumer: StreamConsumer = base_client_config(config)
            .set("group.id", &group)
            .set("enable.auto.commit", "true")
            // 新实例只关心自己启动之后发出的请求
            .set("auto.offset.reset", "latest")
            .set("session.timeout.ms", "30000")
            .create()
            .map_err(|err| {
                ErrorBuilder::new(
                    ErrorCode::ServiceUnavailable,
                    "failed to build auth reply consumer",
                )
                .details(err.to_string())
                .build_error()
            })?;

        consumer
            .subscribe(&[config.auth_reply_topic.as_str()])
            .map_err(|err| {
                map_infra_error(
                    err,
                    ErrorCode::ServiceUnavailable,
                    "failed to subscribe auth reply topic",
                )
            })?;

        info!(
            bootstrap = %config.kafka_bootstrap,
            group = %group,
            topic = %config.auth_reply_topic,
            "auth reply consumer subscribed"
        );

        Ok(Self {
            consumer,
            sink,
            topic: config.auth_reply_topic.clone(),
            group,
        })
    }

    /// 消费循环；收到关闭信号后退出
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(topic = %self.topic, group = %self.group, "auth reply consumer started");
        let mut delivered = 0u64;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                message = self.consumer.recv() => match message {
                    Ok(message) => {
                        let Some(payload) = message.payload() else {
                            debug!(offset = message.offset(), "empty auth reply skipped");
                            continue;
                        };
                        if dispatch_reply(self.sink.as_ref(), payload)
                            == Some(ReplyDisposition::Delivered)
                        {
                            delivered += 1;
                        }
                    }
                    Err(err) => {
                        error!(error = %err, topic = %self.topic, "auth reply consumer error");
                        tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        info!(delivered, "auth reply consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<String>>,
    }

    impl AuthReplySink for RecordingSink {
        fn complete(&self, reply: AuthorizationReply) -> ReplyDisposition {
            self.seen
                .lock()
                .unwrap()
                .push(reply.correlation_id.to_string());
            ReplyDisposition::Delivered
        }
    }

    #[test]
    fn decodes_and_forwards_replies() {
        let sink = RecordingSink::default();
        let payload = br#"{"correlationId":"abc-1","success":true,"identitySnapshot":{"userId":"u-1","nickname":"kim"}}"#;
        assert_eq!(
            dispatch_reply(&sink, payload),
            Some(ReplyDisposition::Delivered)
        );
        assert_eq!(dispatch_reply(&sink, b"not json"), None);
        assert_eq!(*sink.seen.lock().unwrap(), vec!["abc-1".to_string()]);
    }
}
