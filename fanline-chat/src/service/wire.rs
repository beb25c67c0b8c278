//! 依赖装配
//!
//! 按依赖顺序构建聊天服务的全部组件；存储、房间事件通道、授权请求发布者由调用方注入，
//! 因此同一套装配既用于生产启动，也用于内存替身下的集成测试。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::application::services::{
    AuthorizationService, AuthorizationSettings, HandshakeService, RegistrySettings,
    RequestReplyCorrelator, RoomService, SessionRegistry, SessionTokenService, TrafficMonitor,
    TrafficSettings,
};
use crate::config::{ChatServerConfig, StoreKind};
use crate::domain::repository::{AuthRequestPublisher, CredentialValidator, RoomEventPublisher};
use crate::infrastructure::auth::JwtCredentialValidator;
use crate::infrastructure::connection::LocalConnectionTable;
use crate::infrastructure::store::{KeySpace, MemoryStore, RedisStore, SharedStore};
use crate::interface::http::AppState;

/// 单个连接的下行缓冲帧数
const OUTBOUND_BUFFER: usize = 64;

/// 应用上下文：已装配好的全部服务
pub struct ChatContext {
    pub config: Arc<ChatServerConfig>,
    pub registry: Arc<SessionRegistry>,
    pub rooms: Arc<RoomService>,
    pub tokens: Arc<SessionTokenService>,
    pub traffic: Arc<TrafficMonitor>,
    pub correlator: Arc<RequestReplyCorrelator>,
    pub authorization: Arc<AuthorizationService>,
    pub handshake: Arc<HandshakeService>,
    pub credentials: Arc<dyn CredentialValidator>,
}

impl ChatContext {
    pub fn app_state(&self) -> AppState {
        AppState {
            authorization: self.authorization.clone(),
            handshake: self.handshake.clone(),
            registry: self.registry.clone(),
            rooms: self.rooms.clone(),
            tokens: self.tokens.clone(),
            traffic: self.traffic.clone(),
            credentials: self.credentials.clone(),
            admin_token: self.config.admin_token.as_deref().map(Arc::from),
            outbound_buffer: OUTBOUND_BUFFER,
        }
    }
}

/// 按配置构建共享存储
pub async fn build_store(config: &ChatServerConfig) -> Result<Arc<dyn SharedStore>> {
    match config.store_kind {
        StoreKind::Redis => {
            let store = RedisStore::connect(
                &config.redis_url,
                Duration::from_millis(config.redis_response_timeout_ms),
            )
            .await
            .with_context(|| format!("failed to connect to redis at {}", config.redis_url))?;
            Ok(Arc::new(store))
        }
        StoreKind::Memory => {
            tracing::warn!("using in-memory store, state is not shared between instances");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub fn default_credentials(config: &ChatServerConfig) -> Arc<dyn CredentialValidator> {
    Arc::new(JwtCredentialValidator::new(
        &config.credential_secret,
        config.credential_issuer.as_deref(),
    ))
}

/// 装配全部服务
pub fn assemble(
    config: Arc<ChatServerConfig>,
    store: Arc<dyn SharedStore>,
    room_events: Arc<dyn RoomEventPublisher>,
    auth_requests: Arc<dyn AuthRequestPublisher>,
    credentials: Arc<dyn CredentialValidator>,
) -> Result<ChatContext> {
    let keys = KeySpace::new(config.key_prefix.clone());

    let registry = Arc::new(SessionRegistry::new(
        config.instance_id.clone(),
        store.clone(),
        keys.clone(),
        Arc::new(LocalConnectionTable::new()),
        room_events,
        RegistrySettings {
            session_ttl: config.session_ttl(),
            heartbeat_ttl: config.heartbeat_ttl(),
            inactivity_threshold: config.inactivity_threshold(),
        },
    ));
    let rooms = Arc::new(
        RoomService::new(
            store.clone(),
            keys.clone(),
            config.ttl_policy()?,
            registry.clone(),
        )
        .with_expiry_grace(config.room_expiry_grace()),
    );
    let tokens = Arc::new(SessionTokenService::new(store.clone(), keys.clone()));
    let traffic = Arc::new(TrafficMonitor::new(
        store,
        keys,
        registry.clone(),
        TrafficSettings {
            bucket_width: Duration::from_secs(config.traffic_bucket_seconds),
            window_buckets: config.traffic_window_buckets,
            threshold: config.traffic_threshold,
        },
    ));
    let correlator = Arc::new(RequestReplyCorrelator::new(auth_requests));
    let authorization = Arc::new(AuthorizationService::new(
        correlator.clone(),
        rooms.clone(),
        tokens.clone(),
        AuthorizationSettings {
            reply_timeout: config.auth_timeout(),
            token_ttl: config.session_token_ttl(),
        },
    ));
    let handshake = Arc::new(HandshakeService::new(
        tokens.clone(),
        rooms.clone(),
        registry.clone(),
        config.allow_direct_claims,
    ));

    Ok(ChatContext {
        config,
        registry,
        rooms,
        tokens,
        traffic,
        correlator,
        authorization,
        handshake,
        credentials,
    })
}
