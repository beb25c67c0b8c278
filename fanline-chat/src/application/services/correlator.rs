//! 请求/回复关联器
//!
//! 把异步的 broker 请求/回复桥接成同步调用：调用方先生成关联 ID 并登记等待通道，再发送请求，
//! 因此即使回复先于 `await_reply` 到达也不会丢失。回复由独立的消费任务通过 [`AuthReplySink`]
//! 交付到对应的 oneshot 通道，消费循环从不阻塞。
//!
//! 超时只取消调用方的等待；关联 ID 随即退役，之后到达的回复被丢弃并记录告警。
//! 调用方在发送或等待途中被取消（例如 HTTP 客户端断开）时，关联 ID 同样退役。

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fanline_core::metrics::CHAT_METRICS;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::domain::model::{AuthorizationReply, AuthorizationRequest, CorrelationEnvelope};
use crate::domain::repository::{
    AuthReplySink, AuthRequestPublisher, PublishError, ReplyDisposition, RequestTopic,
};
use crate::domain::value_object::CorrelationId;

/// 退役 ID 的保留时长，用于区分“迟到回复”与“其他实例的回复”
const DEFAULT_RETIRED_RETENTION: Duration = Duration::from_secs(300);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("authorization broker unavailable: {0}")]
    BrokerUnavailable(String),
    #[error("authorization reply timed out")]
    Timeout,
    #[error("correlation id {0} is already in use")]
    Duplicate(CorrelationId),
    #[error("correlation id {0} has no outstanding wait")]
    UnknownCorrelation(CorrelationId),
}

/// 发送和等待期间持有；未解除就被丢弃说明调用方已取消，此时清理登记并退役关联 ID
struct InFlight<'a> {
    correlator: &'a RequestReplyCorrelator,
    correlation_id: &'a CorrelationId,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn new(correlator: &'a RequestReplyCorrelator, correlation_id: &'a CorrelationId) -> Self {
        Self {
            correlator,
            correlation_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.correlator.waiters.remove(self.correlation_id);
            self.correlator.retire(self.correlation_id);
            debug!(correlation_id = %self.correlation_id, "cancelled authorization wait retired");
        }
    }
}

struct PendingReply {
    sender: oneshot::Sender<AuthorizationReply>,
    sent_at: Instant,
}

pub struct RequestReplyCorrelator {
    publisher: Arc<dyn AuthRequestPublisher>,
    pending: DashMap<CorrelationId, PendingReply>,
    waiters: DashMap<CorrelationId, oneshot::Receiver<AuthorizationReply>>,
    retired: DashMap<CorrelationId, Instant>,
    retired_retention: Duration,
}

impl RequestReplyCorrelator {
    pub fn new(publisher: Arc<dyn AuthRequestPublisher>) -> Self {
        Self::with_retention(publisher, DEFAULT_RETIRED_RETENTION)
    }

    pub fn with_retention(publisher: Arc<dyn AuthRequestPublisher>, retention: Duration) -> Self {
        Self {
            publisher,
            pending: DashMap::new(),
            waiters: DashMap::new(),
            retired: DashMap::new(),
            retired_retention: retention,
        }
    }

    /// 生成关联 ID 并发送请求
    pub async fn request(
        &self,
        topic: RequestTopic,
        request: AuthorizationRequest,
    ) -> Result<CorrelationId, CorrelationError> {
        self.request_with_id(CorrelationId::generate(), topic, request)
            .await
    }

    /// 使用调用方给定的关联 ID 发送请求；ID 在退役前不可复用
    pub async fn request_with_id(
        &self,
        correlation_id: CorrelationId,
        topic: RequestTopic,
        request: AuthorizationRequest,
    ) -> Result<CorrelationId, CorrelationError> {
        if self.retired.contains_key(&correlation_id)
            || self.waiters.contains_key(&correlation_id)
        {
            return Err(CorrelationError::Duplicate(correlation_id));
        }

        let (sender, receiver) = oneshot::channel();
        match self.pending.entry(correlation_id.clone()) {
            Entry::Occupied(_) => return Err(CorrelationError::Duplicate(correlation_id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingReply {
                    sender,
                    sent_at: Instant::now(),
                });
            }
        }
        self.waiters.insert(correlation_id.clone(), receiver);

        let guard = InFlight::new(self, &correlation_id);
        let envelope = CorrelationEnvelope::new(correlation_id.clone(), request);
        let published = self.publisher.publish(topic, &envelope).await;
        guard.disarm();
        if let Err(err) = published {
            self.pending.remove(&correlation_id);
            self.waiters.remove(&correlation_id);
            warn!(
                correlation_id = %correlation_id,
                error = %err,
                "failed to publish authorization request"
            );
            return Err(match err {
                PublishError::Unavailable(reason) | PublishError::Encode(reason) => {
                    CorrelationError::BrokerUnavailable(reason)
                }
            });
        }

        debug!(correlation_id = %correlation_id, "authorization request sent");
        Ok(correlation_id)
    }

    /// 等待关联回复；只阻塞当前调用任务
    pub async fn await_reply(
        &self,
        correlation_id: &CorrelationId,
        timeout: Duration,
    ) -> Result<AuthorizationReply, CorrelationError> {
        let Some((_, receiver)) = self.waiters.remove(correlation_id) else {
            return Err(CorrelationError::UnknownCorrelation(correlation_id.clone()));
        };

        let guard = InFlight::new(self, correlation_id);
        let outcome = tokio::time::timeout(timeout, receiver).await;
        guard.disarm();
        match outcome {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.retire(correlation_id);
                Err(CorrelationError::BrokerUnavailable(
                    "reply channel closed".to_string(),
                ))
            }
            Err(_) => {
                self.retire(correlation_id);
                warn!(
                    correlation_id = %correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "authorization reply timed out"
                );
                Err(CorrelationError::Timeout)
            }
        }
    }

    /// 发送并等待
    pub async fn call(
        &self,
        topic: RequestTopic,
        request: AuthorizationRequest,
        timeout: Duration,
    ) -> Result<(CorrelationId, AuthorizationReply), CorrelationError> {
        let correlation_id = self.request(topic, request).await?;
        let reply = self.await_reply(&correlation_id, timeout).await?;
        Ok((correlation_id, reply))
    }

    /// 未完成的关联数（只发送、尚未开始等待的请求也计入）
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn is_retired(&self, correlation_id: &CorrelationId) -> bool {
        self.retired.contains_key(correlation_id)
    }

    fn retire(&self, correlation_id: &CorrelationId) {
        self.pending.remove(correlation_id);
        let now = Instant::now();
        self.retired
            .retain(|_, retired_at| now.duration_since(*retired_at) < self.retired_retention);
        self.retired.insert(correlation_id.clone(), now);
    }
}

impl AuthReplySink for RequestReplyCorrelator {
    fn complete(&self, reply: AuthorizationReply) -> ReplyDisposition {
        let correlation_id = reply.correlation_id.clone();

        if let Some((_, pending)) = self.pending.remove(&correlation_id) {
            let elapsed = pending.sent_at.elapsed();
            return match pending.sender.send(reply) {
                Ok(()) => {
                    CHAT_METRICS
                        .auth_round_trip_seconds
                        .observe(elapsed.as_secs_f64());
                    debug!(
                        correlation_id = %correlation_id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "authorization reply delivered"
                    );
                    ReplyDisposition::Delivered
                }
                Err(_) => {
                    // 等待方在回复到达的同一时刻超时
                    self.retire(&correlation_id);
                    CHAT_METRICS.late_replies_total.inc();
                    warn!(correlation_id = %correlation_id, "late authorization reply dropped");
                    ReplyDisposition::Late
                }
            };
        }

        if self.retired.contains_key(&correlation_id) {
            CHAT_METRICS.late_replies_total.inc();
            warn!(correlation_id = %correlation_id, "late authorization reply dropped");
            return ReplyDisposition::Late;
        }

        debug!(correlation_id = %correlation_id, "reply for another instance ignored");
        ReplyDisposition::Foreign
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{
        AuthAction, CallerClaims, DenialReason, IdentitySnapshot, RoomConditions, RoomType,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        sent: Mutex<Vec<(RequestTopic, CorrelationId)>>,
        fail: bool,
    }

    #[async_trait]
    impl AuthRequestPublisher for RecordingPublisher {
        async fn publish(
            &self,
            topic: RequestTopic,
            envelope: &CorrelationEnvelope<AuthorizationRequest>,
        ) -> Result<(), PublishError> {
            if self.fail {
                return Err(PublishError::Unavailable("broker down".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((topic, envelope.correlation_id.clone()));
            Ok(())
        }
    }

    fn request() -> AuthorizationRequest {
        AuthorizationRequest {
            action: AuthAction::Join,
            room_type: RoomType::Game,
            target_id: "room-1".to_string(),
            caller_claims: CallerClaims {
                user_id: "u-1".to_string(),
                team_id: None,
                gender: None,
                age: None,
                nickname: "kim".to_string(),
            },
            room_conditions: RoomConditions::default(),
        }
    }

    fn snapshot(user: &str) -> IdentitySnapshot {
        IdentitySnapshot {
            user_id: user.to_string(),
            team_id: None,
            team_name: None,
            gender: None,
            age: None,
            nickname: user.to_string(),
            win_rate: None,
        }
    }

    #[tokio::test]
    async fn reply_before_await_is_not_lost() {
        let correlator = RequestReplyCorrelator::new(Arc::new(RecordingPublisher::default()));
        let id = CorrelationId::parse("abc-1").unwrap();
        correlator
            .request_with_id(id.clone(), RequestTopic::RoomJoin, request())
            .await
            .unwrap();

        let disposition =
            correlator.complete(AuthorizationReply::authorized(id.clone(), snapshot("u-1")));
        assert_eq!(disposition, ReplyDisposition::Delivered);

        let reply = correlator
            .await_reply(&id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.correlation_id, id);
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn concurrent_correlations_receive_their_own_reply() {
        let correlator = Arc::new(RequestReplyCorrelator::new(Arc::new(
            RecordingPublisher::default(),
        )));
        let mut ids = Vec::new();
        for _ in 0..8 {
            ids.push(
                correlator
                    .request(RequestTopic::RoomJoin, request())
                    .await
                    .unwrap(),
            );
        }

        let waits: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let correlator = correlator.clone();
                tokio::spawn(async move {
                    let reply = correlator
                        .await_reply(&id, Duration::from_secs(5))
                        .await
                        .unwrap();
                    (id, reply)
                })
            })
            .collect();

        // 逆序回复
        for id in ids.iter().rev() {
            correlator.complete(AuthorizationReply::denied(
                id.clone(),
                DenialReason::ConditionMismatch,
            ));
        }

        for wait in waits {
            let (id, reply) = wait.await.unwrap();
            assert_eq!(reply.correlation_id, id);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_does_not_resurrect_wait() {
        let correlator = RequestReplyCorrelator::new(Arc::new(RecordingPublisher::default()));
        let id = correlator
            .request(RequestTopic::RoomCreate, request())
            .await
            .unwrap();

        let result = correlator.await_reply(&id, Duration::from_millis(50)).await;
        assert_eq!(result, Err(CorrelationError::Timeout));
        assert!(correlator.is_retired(&id));

        let disposition =
            correlator.complete(AuthorizationReply::authorized(id.clone(), snapshot("u-1")));
        assert_eq!(disposition, ReplyDisposition::Late);

        // 退役的 ID 不可复用，也没有可等待的回复
        assert!(matches!(
            correlator
                .request_with_id(id.clone(), RequestTopic::RoomCreate, request())
                .await,
            Err(CorrelationError::Duplicate(_))
        ));
        assert!(matches!(
            correlator.await_reply(&id, Duration::from_millis(10)).await,
            Err(CorrelationError::UnknownCorrelation(_))
        ));
    }

    #[tokio::test]
    async fn foreign_replies_are_ignored() {
        let correlator = RequestReplyCorrelator::new(Arc::new(RecordingPublisher::default()));
        let disposition = correlator.complete(AuthorizationReply::authorized(
            CorrelationId::parse("someone-else").unwrap(),
            snapshot("u-9"),
        ));
        assert_eq!(disposition, ReplyDisposition::Foreign);
    }

    #[tokio::test]
    async fn broker_failure_surfaces_and_clears_state() {
        let publisher = RecordingPublisher {
            fail: true,
            ..RecordingPublisher::default()
        };
        let correlator = RequestReplyCorrelator::new(Arc::new(publisher));
        let id = CorrelationId::parse("abc-2").unwrap();
        let result = correlator
            .request_with_id(id.clone(), RequestTopic::RoomJoin, request())
            .await;
        assert!(matches!(result, Err(CorrelationError::BrokerUnavailable(_))));
        assert_eq!(correlator.outstanding(), 0);
        assert!(matches!(
            correlator.await_reply(&id, Duration::from_millis(10)).await,
            Err(CorrelationError::UnknownCorrelation(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_outstanding_id_is_rejected() {
        let publisher = Arc::new(RecordingPublisher::default());
        let correlator = RequestReplyCorrelator::new(publisher.clone());
        let id = CorrelationId::parse("dup").unwrap();
        correlator
            .request_with_id(id.clone(), RequestTopic::RoomJoin, request())
            .await
            .unwrap();
        assert_eq!(
            correlator
                .request_with_id(id.clone(), RequestTopic::RoomJoin, request())
                .await,
            Err(CorrelationError::Duplicate(id))
        );
        assert_eq!(publisher.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_call_retires_its_correlation() {
        let publisher = Arc::new(RecordingPublisher::default());
        let correlator = Arc::new(RequestReplyCorrelator::new(publisher.clone()));

        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .call(RequestTopic::RoomJoin, request(), Duration::from_secs(5))
                    .await
            })
        };
        while publisher.sent.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        let id = publisher.sent.lock().unwrap()[0].1.clone();

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        tokio::time::advance(Duration::from_secs(3600)).await;

        assert_eq!(correlator.outstanding(), 0);
        assert!(correlator.waiters.is_empty());
        assert!(correlator.is_retired(&id));
        assert_eq!(
            correlator.complete(AuthorizationReply::authorized(id, snapshot("u-1"))),
            ReplyDisposition::Late
        );
    }
}
