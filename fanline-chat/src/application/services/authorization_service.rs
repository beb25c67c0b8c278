//! 授权编排
//!
//! 一个入口按 `(RoomType, AuthAction)` 分派：构造授权请求，经关联器向身份服务发起请求并等待回复，
//! 用状态机收敛结果；授权通过后以回复中的身份快照签发会话令牌，而不是请求中的声明。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use fanline_core::metrics::CHAT_METRICS;
use thiserror::Error;
use tracing::{info, warn};

use crate::application::error::ChatError;
use crate::application::services::correlator::{CorrelationError, RequestReplyCorrelator};
use crate::application::services::room_service::{NewRoom, RoomService};
use crate::application::services::token_service::{SessionTokenService, TokenError};
use crate::domain::model::{
    AuthAction, AuthorizationRequest, AuthorizationState, CallerClaims, DenialReason,
    IdentitySnapshot, RoomConditions, RoomRecord, RoomType, SessionToken,
};
use crate::domain::repository::RequestTopic;
use crate::domain::value_object::{CorrelationId, RoomId};

#[derive(Debug, Clone)]
pub struct AuthorizationSettings {
    pub reply_timeout: Duration,
    pub token_ttl: Duration,
}

impl Default for AuthorizationSettings {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(5),
            token_ttl: Duration::from_secs(300),
        }
    }
}

/// 授权指令
#[derive(Debug, Clone)]
pub enum AuthorizationCommand {
    Create {
        room_type: RoomType,
        game_id: String,
        conditions: RoomConditions,
        event_time: Option<String>,
    },
    Join {
        room_id: RoomId,
    },
}

impl AuthorizationCommand {
    pub fn action(&self) -> AuthAction {
        match self {
            AuthorizationCommand::Create { .. } => AuthAction::Create,
            AuthorizationCommand::Join { .. } => AuthAction::Join,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("authorization denied: {}", .0.code())]
    Denied(DenialReason),
    #[error("authorization unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Room(#[from] ChatError),
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// 授权成功的结果
#[derive(Debug, Clone)]
pub struct AuthorizationGrant {
    pub correlation_id: CorrelationId,
    pub room: RoomRecord,
    pub subject: IdentitySnapshot,
    pub token: SessionToken,
}

/// 请求构造完成、等待身份服务裁决的授权
struct PreparedRequest {
    room_id: RoomId,
    existing: Option<RoomRecord>,
    new_room: Option<NewRoom>,
    request: AuthorizationRequest,
}

pub struct AuthorizationService {
    correlator: Arc<RequestReplyCorrelator>,
    rooms: Arc<RoomService>,
    tokens: Arc<SessionTokenService>,
    settings: AuthorizationSettings,
}

impl AuthorizationService {
    pub fn new(
        correlator: Arc<RequestReplyCorrelator>,
        rooms: Arc<RoomService>,
        tokens: Arc<SessionTokenService>,
        settings: AuthorizationSettings,
    ) -> Self {
        Self {
            correlator,
            rooms,
            tokens,
            settings,
        }
    }

    pub async fn authorize(
        &self,
        caller: CallerClaims,
        command: AuthorizationCommand,
    ) -> Result<AuthorizationGrant, AuthorizationError> {
        self.authorize_with_id(CorrelationId::generate(), caller, command)
            .await
    }

    /// 使用指定关联 ID 完成一次授权
    pub async fn authorize_with_id(
        &self,
        correlation_id: CorrelationId,
        caller: CallerClaims,
        command: AuthorizationCommand,
    ) -> Result<AuthorizationGrant, AuthorizationError> {
        let action = command.action();
        let prepared = self.prepare(caller, command).await?;
        let room_type = prepared.request.room_type;
        let started = Instant::now();

        let state = self
            .exchange(correlation_id.clone(), prepared.request)
            .await;
        CHAT_METRICS
            .auth_requests_total
            .with_label_values(&[action.as_str(), state.label()])
            .inc();

        let subject = match state {
            AuthorizationState::Authorized(snapshot) => snapshot,
            AuthorizationState::Denied(reason) => {
                info!(
                    correlation_id = %correlation_id,
                    action = action.as_str(),
                    reason = reason.code(),
                    "authorization denied"
                );
                return Err(AuthorizationError::Denied(reason));
            }
            AuthorizationState::TimedOut => {
                return Err(AuthorizationError::Unavailable(
                    "identity service did not reply in time".to_string(),
                ));
            }
            AuthorizationState::Pending => {
                return Err(AuthorizationError::Unavailable(
                    "identity service unreachable".to_string(),
                ));
            }
        };

        let room = match (prepared.existing, prepared.new_room) {
            (Some(existing), _) => existing,
            (None, Some(mut new_room)) => {
                new_room.created_by = subject.user_id.clone();
                self.rooms.create_room(prepared.room_id, new_room).await?
            }
            (None, None) => return Err(ChatError::RoomNotFound(prepared.room_id).into()),
        };

        let token = self
            .tokens
            .issue(
                subject.clone(),
                room.room_id.clone(),
                room_type,
                self.settings.token_ttl,
            )
            .await?;

        info!(
            correlation_id = %correlation_id,
            action = action.as_str(),
            room_id = %room.room_id,
            user_id = %subject.user_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "authorization granted"
        );
        Ok(AuthorizationGrant {
            correlation_id,
            room,
            subject,
            token,
        })
    }

    /// 按房间类型与动作构造授权请求
    async fn prepare(
        &self,
        caller: CallerClaims,
        command: AuthorizationCommand,
    ) -> Result<PreparedRequest, AuthorizationError> {
        match command {
            AuthorizationCommand::Join { room_id } => {
                let room = self.rooms.require_room(&room_id).await?;
                if !room.is_open_at(Utc::now()) {
                    return Err(ChatError::RoomInactive(room_id).into());
                }
                let request = AuthorizationRequest {
                    action: AuthAction::Join,
                    room_type: room.room_type,
                    target_id: room_id.to_string(),
                    caller_claims: caller,
                    room_conditions: room.conditions.clone(),
                };
                Ok(PreparedRequest {
                    room_id,
                    existing: Some(room),
                    new_room: None,
                    request,
                })
            }
            AuthorizationCommand::Create {
                room_type,
                game_id,
                conditions,
                event_time,
            } => {
                conditions.validate().map_err(ChatError::InvalidRequest)?;
                match (room_type, game_id.trim().is_empty()) {
                    (RoomType::Game, true) | (RoomType::Matching, true) => {
                        return Err(ChatError::InvalidRequest(format!(
                            "{} room requires a game id",
                            room_type.as_str()
                        ))
                        .into());
                    }
                    (RoomType::Matching, false) if conditions.capacity.is_none() => {
                        return Err(ChatError::InvalidRequest(
                            "MATCHING room requires a capacity".to_string(),
                        )
                        .into());
                    }
                    _ => {}
                }
                let request = AuthorizationRequest {
                    action: AuthAction::Create,
                    room_type,
                    target_id: game_id.clone(),
                    caller_claims: caller.clone(),
                    room_conditions: conditions.clone(),
                };
                Ok(PreparedRequest {
                    room_id: RoomId::generate(),
                    existing: None,
                    new_room: Some(NewRoom {
                        room_type,
                        game_id,
                        conditions,
                        created_by: caller.user_id,
                        event_time,
                    }),
                    request,
                })
            }
        }
    }

    /// 发送请求并把回复（或超时）推进状态机；发送失败时停留在 PENDING
    async fn exchange(
        &self,
        correlation_id: CorrelationId,
        request: AuthorizationRequest,
    ) -> AuthorizationState {
        let state = AuthorizationState::Pending;
        let topic = RequestTopic::for_action(request.action);
        if let Err(err) = self
            .correlator
            .request_with_id(correlation_id.clone(), topic, request)
            .await
        {
            warn!(correlation_id = %correlation_id, error = %err, "authorization request not sent");
            return state;
        }

        match self
            .correlator
            .await_reply(&correlation_id, self.settings.reply_timeout)
            .await
        {
            Ok(reply) => state.on_reply(&correlation_id, reply),
            Err(CorrelationError::Timeout) => state.on_timeout(),
            Err(err) => {
                warn!(correlation_id = %correlation_id, error = %err, "authorization reply lost");
                state
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::session_registry::{RegistrySettings, SessionRegistry};
    use crate::domain::model::{AuthorizationReply, CorrelationEnvelope, RoomStatus};
    use crate::domain::repository::{AuthReplySink, AuthRequestPublisher, PublishError};
    use crate::domain::service::RoomTtlPolicy;
    use crate::domain::value_object::InstanceId;
    use crate::infrastructure::connection::LocalConnectionTable;
    use crate::infrastructure::messaging::InProcessRoomBus;
    use crate::infrastructure::store::{KeySpace, MemoryStore, SharedStore};
    use async_trait::async_trait;
    use std::sync::{Mutex, Weak};

    /// 按预设规则立即回复的身份服务替身
    struct ScriptedIdentity {
        sink: Mutex<Option<Weak<RequestReplyCorrelator>>>,
        reply: Box<dyn Fn(&CorrelationEnvelope<AuthorizationRequest>) -> Option<AuthorizationReply> + Send + Sync>,
        seen: Mutex<Vec<(RequestTopic, AuthorizationRequest)>>,
    }

    #[async_trait]
    impl AuthRequestPublisher for ScriptedIdentity {
        async fn publish(
            &self,
            topic: RequestTopic,
            envelope: &CorrelationEnvelope<AuthorizationRequest>,
        ) -> Result<(), PublishError> {
            self.seen
                .lock()
                .unwrap()
                .push((topic, envelope.payload.clone()));
            let sink = self.sink.lock().unwrap().as_ref().and_then(Weak::upgrade);
            if let (Some(sink), Some(reply)) = (sink, (self.reply)(envelope)) {
                sink.complete(reply);
            }
            Ok(())
        }
    }

    struct Fixture {
        service: AuthorizationService,
        rooms: Arc<RoomService>,
        identity: Arc<ScriptedIdentity>,
    }

    fn fixture<F>(reply: F) -> Fixture
    where
        F: Fn(&CorrelationEnvelope<AuthorizationRequest>) -> Option<AuthorizationReply>
            + Send
            + Sync
            + 'static,
    {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let identity = Arc::new(ScriptedIdentity {
            sink: Mutex::new(None),
            reply: Box::new(reply),
            seen: Mutex::new(Vec::new()),
        });
        let correlator = Arc::new(RequestReplyCorrelator::new(identity.clone()));
        *identity.sink.lock().unwrap() = Some(Arc::downgrade(&correlator));

        let registry = Arc::new(SessionRegistry::new(
            InstanceId::parse("inst-a").unwrap(),
            store.clone(),
            KeySpace::default(),
            Arc::new(LocalConnectionTable::new()),
            Arc::new(InProcessRoomBus::new()),
            RegistrySettings::default(),
        ));
        let rooms = Arc::new(RoomService::new(
            store.clone(),
            KeySpace::default(),
            RoomTtlPolicy::default(),
            registry,
        ));
        let tokens = Arc::new(SessionTokenService::new(store, KeySpace::default()));
        let service = AuthorizationService::new(
            correlator,
            rooms.clone(),
            tokens,
            AuthorizationSettings {
                reply_timeout: Duration::from_millis(200),
                token_ttl: Duration::from_secs(60),
            },
        );
        Fixture {
            service,
            rooms,
            identity,
        }
    }

    fn caller() -> CallerClaims {
        CallerClaims {
            user_id: "user-1".to_string(),
            team_id: Some(3),
            gender: None,
            age: Some(20),
            nickname: "claimed".to_string(),
        }
    }

    fn enriched(envelope: &CorrelationEnvelope<AuthorizationRequest>) -> AuthorizationReply {
        AuthorizationReply::authorized(
            envelope.correlation_id.clone(),
            IdentitySnapshot {
                user_id: envelope.payload.caller_claims.user_id.clone(),
                team_id: Some(3),
                team_name: Some("Tigers".to_string()),
                gender: None,
                age: Some(20),
                nickname: "verified".to_string(),
                win_rate: Some(61.5),
            },
        )
    }

    fn create_lounge() -> AuthorizationCommand {
        AuthorizationCommand::Create {
            room_type: RoomType::Lounge,
            game_id: "game-1".to_string(),
            conditions: RoomConditions::default(),
            event_time: None,
        }
    }

    #[tokio::test]
    async fn create_issues_token_from_reply_snapshot() {
        let fx = fixture(|env| Some(enriched(env)));
        let grant = fx.service.authorize(caller(), create_lounge()).await.unwrap();

        assert_eq!(grant.subject.nickname, "verified");
        assert_eq!(grant.token.info.subject.team_name.as_deref(), Some("Tigers"));
        assert_eq!(grant.room.created_by, "user-1");
        assert_eq!(grant.room.status, RoomStatus::Active);
        assert!(fx.rooms.get_room(&grant.room.room_id).await.unwrap().is_some());

        let seen = fx.identity.seen.lock().unwrap();
        assert_eq!(seen[0].0, RequestTopic::RoomCreate);
        assert_eq!(seen[0].1.action, AuthAction::Create);
    }

    #[tokio::test]
    async fn join_uses_room_conditions_and_join_topic() {
        let fx = fixture(|env| Some(enriched(env)));
        let created = fx.service.authorize(caller(), create_lounge()).await.unwrap();
        let grant = fx
            .service
            .authorize(
                caller(),
                AuthorizationCommand::Join {
                    room_id: created.room.room_id.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(grant.room.room_id, created.room.room_id);

        let seen = fx.identity.seen.lock().unwrap();
        assert_eq!(seen[1].0, RequestTopic::RoomJoin);
        assert_eq!(seen[1].1.target_id, created.room.room_id.to_string());
    }

    #[tokio::test]
    async fn denial_is_reported_and_creates_nothing() {
        let fx = fixture(|env| {
            Some(AuthorizationReply::denied(
                env.correlation_id.clone(),
                DenialReason::ConditionMismatch,
            ))
        });
        let result = fx.service.authorize(caller(), create_lounge()).await;
        assert!(matches!(
            result,
            Err(AuthorizationError::Denied(DenialReason::ConditionMismatch))
        ));
        assert!(fx.rooms.rooms_created_today().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn silence_becomes_unavailable() {
        let fx = fixture(|_| None);
        let result = fx.service.authorize(caller(), create_lounge()).await;
        assert!(matches!(result, Err(AuthorizationError::Unavailable(_))));
    }

    #[tokio::test]
    async fn join_of_unknown_room_fails_before_request() {
        let fx = fixture(|env| Some(enriched(env)));
        let result = fx
            .service
            .authorize(
                caller(),
                AuthorizationCommand::Join {
                    room_id: RoomId::parse("nope").unwrap(),
                },
            )
            .await;
        assert!(matches!(
            result,
            Err(AuthorizationError::Room(ChatError::RoomNotFound(_)))
        ));
        assert!(fx.identity.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn matching_room_needs_capacity() {
        let fx = fixture(|env| Some(enriched(env)));
        let result = fx
            .service
            .authorize(
                caller(),
                AuthorizationCommand::Create {
                    room_type: RoomType::Matching,
                    game_id: "game-1".to_string(),
                    conditions: RoomConditions::default(),
                    event_time: None,
                },
            )
            .await;
        assert!(matches!(
            result,
            Err(AuthorizationError::Room(ChatError::InvalidRequest(_)))
        ));
    }
}
