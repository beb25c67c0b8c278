//! 集成测试公共装配：内存存储、进程内房间总线、同步回复的身份服务替身

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use fanline_chat::application::services::RequestReplyCorrelator;
use fanline_chat::config::{ChatServerConfig, StoreKind};
use fanline_chat::domain::model::{
    AuthorizationReply, AuthorizationRequest, CorrelationEnvelope, DenialReason, IdentitySnapshot,
};
use fanline_chat::domain::repository::{
    AuthReplySink, AuthRequestPublisher, PublishError, RequestTopic, RoomEventSink,
};
use fanline_chat::domain::value_object::InstanceId;
use fanline_chat::infrastructure::auth::JwtCredentialValidator;
use fanline_chat::infrastructure::messaging::InProcessRoomBus;
use fanline_chat::infrastructure::store::MemoryStore;
use fanline_chat::service::{ChatContext, assemble};

pub const CREDENTIAL_SECRET: &str = "integration-secret";
pub const ADMIN_TOKEN: &str = "ops-secret";

/// 以 `banned` 开头的用户一律被拒绝，其余用户获得带队名的身份快照
pub struct LoopbackIdentity {
    correlator: Mutex<Option<Weak<RequestReplyCorrelator>>>,
    pub requests: Mutex<Vec<(RequestTopic, CorrelationEnvelope<AuthorizationRequest>)>>,
}

impl LoopbackIdentity {
    fn new() -> Self {
        Self {
            correlator: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn reply_to(envelope: &CorrelationEnvelope<AuthorizationRequest>) -> AuthorizationReply {
        let claims = &envelope.payload.caller_claims;
        if claims.user_id.starts_with("banned") {
            return AuthorizationReply::denied(
                envelope.correlation_id.clone(),
                DenialReason::ConditionMismatch,
            );
        }
        AuthorizationReply::authorized(
            envelope.correlation_id.clone(),
            IdentitySnapshot {
                user_id: claims.user_id.clone(),
                team_id: claims.team_id,
                team_name: Some("Tigers".to_string()),
                gender: claims.gender,
                age: claims.age,
                nickname: format!("{}#verified", claims.nickname),
                win_rate: Some(55.0),
            },
        )
    }
}

#[async_trait]
impl AuthRequestPublisher for LoopbackIdentity {
    async fn publish(
        &self,
        topic: RequestTopic,
        envelope: &CorrelationEnvelope<AuthorizationRequest>,
    ) -> Result<(), PublishError> {
        self.requests.lock().unwrap().push((topic, envelope.clone()));
        let correlator = self.correlator.lock().unwrap().as_ref().and_then(Weak::upgrade);
        if let Some(correlator) = correlator {
            correlator.complete(Self::reply_to(envelope));
        }
        Ok(())
    }
}

pub struct Harness {
    pub context: ChatContext,
    pub identity: Arc<LoopbackIdentity>,
}

pub fn test_config() -> ChatServerConfig {
    ChatServerConfig {
        instance_id: InstanceId::parse("inst-test").unwrap(),
        store_kind: StoreKind::Memory,
        credential_secret: CREDENTIAL_SECRET.to_string(),
        admin_token: Some(ADMIN_TOKEN.to_string()),
        ..ChatServerConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: ChatServerConfig) -> Harness {
    let config = Arc::new(config);
    let identity = Arc::new(LoopbackIdentity::new());
    let bus = Arc::new(InProcessRoomBus::new());
    let credentials = Arc::new(JwtCredentialValidator::new(CREDENTIAL_SECRET, None));

    let context = assemble(
        config,
        Arc::new(MemoryStore::new()),
        bus.clone(),
        identity.clone(),
        credentials,
    )
    .unwrap();

    let sink: Arc<dyn RoomEventSink> = context.registry.clone();
    bus.attach(&sink);
    *identity.correlator.lock().unwrap() = Some(Arc::downgrade(&context.correlator));

    Harness { context, identity }
}
