use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fanline_core::error::{ErrorBuilder, ErrorCode, Result};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde_json::to_vec;
use tracing::debug;

use crate::config::ChatServerConfig;
use crate::domain::model::{AuthorizationRequest, CorrelationEnvelope};
use crate::domain::repository::{AuthRequestPublisher, PublishError, RequestTopic};

/// 构建带公共选项的 Kafka 客户端配置
pub(crate) fn base_client_config(config: &ChatServerConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.kafka_bootstrap);
    if let Some(client_id) = &config.kafka_client_id {
        client.set("client.id", client_id);
    }
    if let Some(protocol) = &config.kafka_security_protocol {
        client.set("security.protocol", protocol);
    }
    for (key, value) in &config.kafka_options {
        client.set(key, value);
    }
    client
}

/// 授权请求的 Kafka 发布者，消息键为关联 ID
pub struct KafkaAuthRequestPublisher {
    config: Arc<ChatServerConfig>,
    producer: Arc<FutureProducer>,
}

impl KafkaAuthRequestPublisher {
    pub fn new(config: Arc<ChatServerConfig>) -> Result<Self> {
        let producer: FutureProducer = base_client_config(&config)
            .set("message.timeout.ms", config.kafka_timeout_ms.to_string())
            .create()
            .map_err(|err| {
                ErrorBuilder::new(
                    ErrorCode::ServiceUnavailable,
                    "failed to create kafka producer",
                )
                .details(err.to_string())
                .build_error()
            })?;

        Ok(Self {
            config,
            producer: Arc::new(producer),
        })
    }

    fn topic_for(&self, topic: RequestTopic) -> &str {
        let dedicated = match topic {
            RequestTopic::RoomCreate => self.config.room_create_topic.as_deref(),
            RequestTopic::RoomJoin => self.config.room_join_topic.as_deref(),
        };
        dedicated.unwrap_or(&self.config.generic_auth_topic)
    }
}

#[async_trait]
impl AuthRequestPublisher for KafkaAuthRequestPublisher {
    async fn publish(
        &self,
        topic: RequestTopic,
        envelope: &CorrelationEnvelope<AuthorizationRequest>,
    ) -> std::result::Result<(), PublishError> {
        let payload = to_vec(envelope).map_err(|err| PublishError::Encode(err.to_string()))?;
        let topic_name = self.topic_for(topic);
        let key = envelope.correlation_id.as_str();

        let record = FutureRecord::to(topic_name).payload(&payload).key(key);

        self.producer
            .send(record, Duration::from_millis(self.config.kafka_timeout_ms))
            .await
            .map_err(|(err, _)| PublishError::Unavailable(err.to_string()))?;

        debug!(
            topic = %topic_name,
            correlation_id = %envelope.correlation_id,
            "authorization request published"
        );
        Ok(())
    }
}
