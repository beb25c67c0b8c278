//! 领域层依赖的外部能力抽象

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::model::{
    AuthAction, AuthorizationReply, AuthorizationRequest, CallerClaims, CorrelationEnvelope,
    RoomEvent,
};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// 授权请求按关注点划分的主题；未单独配置的关注点落到通用主题
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestTopic {
    RoomCreate,
    RoomJoin,
}

impl RequestTopic {
    pub fn for_action(action: AuthAction) -> Self {
        match action {
            AuthAction::Create => RequestTopic::RoomCreate,
            AuthAction::Join => RequestTopic::RoomJoin,
        }
    }
}

/// 授权请求发布者（消息以关联 ID 作为键）
#[async_trait]
pub trait AuthRequestPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: RequestTopic,
        envelope: &CorrelationEnvelope<AuthorizationRequest>,
    ) -> Result<(), PublishError>;
}

/// 跨实例房间事件发布者
#[async_trait]
pub trait RoomEventPublisher: Send + Sync {
    async fn publish(&self, event: &RoomEvent) -> Result<(), PublishError>;
}

/// 回复的投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    /// 交给了仍在等待的调用方
    Delivered,
    /// 调用方已超时，回复被丢弃
    Late,
    /// 不是本实例发出的请求
    Foreign,
}

/// 授权回复接收方，由回复消费任务调用，不得阻塞
pub trait AuthReplySink: Send + Sync {
    fn complete(&self, reply: AuthorizationReply) -> ReplyDisposition;
}

/// 其他实例发布的房间事件的接收方，不得阻塞
pub trait RoomEventSink: Send + Sync {
    fn deliver(&self, event: RoomEvent);
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential missing")]
    Missing,
    #[error("credential rejected: {0}")]
    Rejected(String),
}

/// 用户凭证校验器；凭证本身对核心层不透明
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, credential: &str) -> Result<CallerClaims, CredentialError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_follows_action() {
        assert_eq!(
            RequestTopic::for_action(AuthAction::Create),
            RequestTopic::RoomCreate
        );
        assert_eq!(
            RequestTopic::for_action(AuthAction::Join),
            RequestTopic::RoomJoin
        );
    }
}
