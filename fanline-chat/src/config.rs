//! 聊天服务配置
//!
//! 取值优先级：`FANLINE_CHAT_*` 环境变量 > `services.chat` 配置段 > 引用的 redis/kafka 档案 > 默认值。

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use fanline_core::config::FanlineAppConfig;
use tracing::warn;

use crate::domain::service::{DEFAULT_TIMEZONE, RoomTtlPolicy};
use crate::domain::value_object::InstanceId;
use crate::infrastructure::store::keys::DEFAULT_KEY_PREFIX;

const ENV_PREFIX: &str = "FANLINE_CHAT_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Redis,
    Memory,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreKind::Redis),
            "memory" | "in-memory" => Ok(StoreKind::Memory),
            other => Err(format!("unknown store kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatServerConfig {
    pub instance_id: InstanceId,
    pub listen_addr: String,
    pub store_kind: StoreKind,
    pub redis_url: String,
    pub redis_response_timeout_ms: u64,
    pub key_prefix: String,
    pub kafka_bootstrap: String,
    pub kafka_client_id: Option<String>,
    pub kafka_security_protocol: Option<String>,
    pub kafka_timeout_ms: u64,
    pub kafka_options: HashMap<String, String>,
    pub consumer_group: String,
    // 授权请求/回复主题
    pub room_create_topic: Option<String>,
    pub room_join_topic: Option<String>,
    pub generic_auth_topic: String,
    pub auth_reply_topic: String,
    pub auth_timeout_ms: u64,
    // 会话与令牌
    pub session_token_ttl_seconds: u64,
    pub session_ttl_seconds: u64,
    pub heartbeat_ttl_seconds: u64,
    pub inactivity_threshold_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    // 房间存活时长
    pub timezone: String,
    pub min_room_ttl_seconds: u64,
    pub fallback_room_ttl_seconds: u64,
    pub lounge_room_ttl_seconds: u64,
    // 流量监控
    pub traffic_bucket_seconds: u64,
    pub traffic_window_buckets: u32,
    pub traffic_threshold: u64,
    pub traffic_check_interval_seconds: u64,
    // 接入
    pub credential_secret: String,
    pub credential_issuer: Option<String>,
    pub allow_direct_claims: bool,
    pub admin_token: Option<String>,
}

impl Default for ChatServerConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            listen_addr: "0.0.0.0:8080".to_string(),
            store_kind: StoreKind::Redis,
            redis_url: "redis://127.0.0.1/".to_string(),
            redis_response_timeout_ms: 2_000,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            kafka_bootstrap: "127.0.0.1:29092".to_string(),
            kafka_client_id: None,
            kafka_security_protocol: None,
            kafka_timeout_ms: 5_000,
            kafka_options: HashMap::new(),
            consumer_group: "fanline-chat".to_string(),
            room_create_topic: Some("chat-room-create-requests".to_string()),
            room_join_topic: Some("chat-room-join-requests".to_string()),
            generic_auth_topic: "chat-auth-requests".to_string(),
            auth_reply_topic: "chat-auth-replies".to_string(),
            auth_timeout_ms: 5_000,
            session_token_ttl_seconds: 300,
            session_ttl_seconds: 180,
            heartbeat_ttl_seconds: 90,
            inactivity_threshold_seconds: 60,
            sweep_interval_seconds: 30,
            heartbeat_interval_seconds: 10,
            timezone: DEFAULT_TIMEZONE.to_string(),
            min_room_ttl_seconds: 60,
            fallback_room_ttl_seconds: 3_600,
            lounge_room_ttl_seconds: 6 * 3_600,
            traffic_bucket_seconds: 60,
            traffic_window_buckets: 3,
            traffic_threshold: 100,
            traffic_check_interval_seconds: 20,
            credential_secret: "change-me".to_string(),
            credential_issuer: None,
            allow_direct_claims: false,
            admin_token: None,
        }
    }
}

fn default_instance_id() -> InstanceId {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    InstanceId::parse(format!("chat-{}", &suffix[..8])).unwrap_or_else(|_| InstanceId::generate())
}

fn env_string(name: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|value| value.parse::<T>().ok())
}

/// 空字符串表示“不单独配置”
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl ChatServerConfig {
    pub fn from_app_config(app: &FanlineAppConfig) -> Result<Self> {
        let service = app.chat_service();
        let defaults = Self::default();

        let redis_name = service.redis.as_deref().unwrap_or("chat_store");
        let kafka_name = service.kafka.as_deref().unwrap_or("chat");
        let redis_profile = app.redis_profile(redis_name).cloned();
        let kafka_profile = app.kafka_profile(kafka_name).cloned();

        let instance_id = match env_string("INSTANCE_ID").or_else(|| service.instance_id.clone()) {
            Some(raw) => InstanceId::parse(raw).map_err(|err| anyhow!(err))?,
            None => {
                warn!(
                    instance_id = %defaults.instance_id,
                    "no instance_id configured, reply consumer group will change on restart"
                );
                defaults.instance_id.clone()
            }
        };

        let store_kind = match env_string("STORE").or_else(|| service.store_kind.clone()) {
            Some(raw) => raw.parse::<StoreKind>().map_err(|err| anyhow!(err))?,
            None => defaults.store_kind,
        };

        let redis_url = env_string("REDIS_URL")
            .or_else(|| redis_profile.as_ref().map(|cfg| cfg.url.clone()))
            .unwrap_or(defaults.redis_url);

        let redis_response_timeout_ms = redis_profile
            .as_ref()
            .and_then(|cfg| cfg.response_timeout_ms)
            .unwrap_or(defaults.redis_response_timeout_ms);

        let key_prefix = env_string("KEY_PREFIX")
            .or_else(|| service.key_prefix.clone())
            .or_else(|| redis_profile.as_ref().and_then(|cfg| cfg.namespace.clone()))
            .unwrap_or(defaults.key_prefix);

        let kafka_bootstrap = env_string("KAFKA_BOOTSTRAP")
            .or_else(|| kafka_profile.as_ref().map(|cfg| cfg.bootstrap_servers.clone()))
            .unwrap_or(defaults.kafka_bootstrap);

        let kafka_timeout_ms = env_parse("KAFKA_TIMEOUT_MS")
            .or_else(|| kafka_profile.as_ref().and_then(|cfg| cfg.timeout_ms))
            .unwrap_or(defaults.kafka_timeout_ms);

        let consumer_group = env_string("CONSUMER_GROUP")
            .or_else(|| service.consumer_group.clone())
            .unwrap_or(defaults.consumer_group);

        // 主题显式配置为空字符串时落到通用主题
        let room_create_topic = match env::var(format!("{}ROOM_CREATE_TOPIC", ENV_PREFIX)).ok() {
            Some(value) => non_empty(Some(value)),
            None => match service.room_create_topic.clone() {
                Some(value) => non_empty(Some(value)),
                None => defaults.room_create_topic,
            },
        };
        let room_join_topic = match env::var(format!("{}ROOM_JOIN_TOPIC", ENV_PREFIX)).ok() {
            Some(value) => non_empty(Some(value)),
            None => match service.room_join_topic.clone() {
                Some(value) => non_empty(Some(value)),
                None => defaults.room_join_topic,
            },
        };

        let config = Self {
            instance_id,
            listen_addr: env_string("LISTEN_ADDR").unwrap_or_else(|| app.chat_listen_addr()),
            store_kind,
            redis_url,
            redis_response_timeout_ms,
            key_prefix,
            kafka_bootstrap,
            kafka_client_id: kafka_profile.as_ref().and_then(|cfg| cfg.client_id.clone()),
            kafka_security_protocol: kafka_profile
                .as_ref()
                .and_then(|cfg| cfg.security_protocol.clone()),
            kafka_timeout_ms,
            kafka_options: kafka_profile
                .map(|cfg| cfg.options)
                .unwrap_or_default(),
            consumer_group,
            room_create_topic,
            room_join_topic,
            generic_auth_topic: env_string("GENERIC_AUTH_TOPIC")
                .or_else(|| service.generic_auth_topic.clone())
                .unwrap_or(defaults.generic_auth_topic),
            auth_reply_topic: env_string("AUTH_REPLY_TOPIC")
                .or_else(|| service.auth_reply_topic.clone())
                .unwrap_or(defaults.auth_reply_topic),
            auth_timeout_ms: env_parse("AUTH_TIMEOUT_MS")
                .or(service.auth_timeout_ms)
                .unwrap_or(defaults.auth_timeout_ms),
            session_token_ttl_seconds: env_parse("SESSION_TOKEN_TTL")
                .or(service.session_token_ttl_seconds)
                .unwrap_or(defaults.session_token_ttl_seconds),
            session_ttl_seconds: env_parse("SESSION_TTL")
                .or(service.session_ttl_seconds)
                .unwrap_or(defaults.session_ttl_seconds),
            heartbeat_ttl_seconds: env_parse("HEARTBEAT_TTL")
                .or(service.heartbeat_ttl_seconds)
                .unwrap_or(defaults.heartbeat_ttl_seconds),
            inactivity_threshold_seconds: env_parse("INACTIVITY_THRESHOLD")
                .or(service.inactivity_threshold_seconds)
                .unwrap_or(defaults.inactivity_threshold_seconds),
            sweep_interval_seconds: env_parse("SWEEP_INTERVAL")
                .or(service.sweep_interval_seconds)
                .unwrap_or(defaults.sweep_interval_seconds),
            heartbeat_interval_seconds: env_parse("HEARTBEAT_INTERVAL")
                .or(service.heartbeat_interval_seconds)
                .unwrap_or(defaults.heartbeat_interval_seconds),
            timezone: env_string("TIMEZONE")
                .or_else(|| service.timezone.clone())
                .unwrap_or(defaults.timezone),
            min_room_ttl_seconds: env_parse("MIN_ROOM_TTL")
                .or(service.min_room_ttl_seconds)
                .unwrap_or(defaults.min_room_ttl_seconds),
            fallback_room_ttl_seconds: env_parse("FALLBACK_ROOM_TTL")
                .or(service.fallback_room_ttl_seconds)
                .unwrap_or(defaults.fallback_room_ttl_seconds),
            lounge_room_ttl_seconds: env_parse("LOUNGE_ROOM_TTL")
                .or(service.lounge_room_ttl_seconds)
                .unwrap_or(defaults.lounge_room_ttl_seconds),
            traffic_bucket_seconds: env_parse("TRAFFIC_BUCKET_SECONDS")
                .or(service.traffic_bucket_seconds)
                .unwrap_or(defaults.traffic_bucket_seconds),
            traffic_window_buckets: env_parse("TRAFFIC_WINDOW_BUCKETS")
                .or(service.traffic_window_buckets)
                .unwrap_or(defaults.traffic_window_buckets),
            traffic_threshold: env_parse("TRAFFIC_THRESHOLD")
                .or(service.traffic_threshold)
                .unwrap_or(defaults.traffic_threshold),
            traffic_check_interval_seconds: env_parse("TRAFFIC_CHECK_INTERVAL")
                .or(service.traffic_check_interval_seconds)
                .unwrap_or(defaults.traffic_check_interval_seconds),
            credential_secret: env_string("CREDENTIAL_SECRET")
                .or_else(|| service.credential_secret.clone())
                .unwrap_or(defaults.credential_secret),
            credential_issuer: env_string("CREDENTIAL_ISSUER")
                .or_else(|| service.credential_issuer.clone()),
            allow_direct_claims: env_parse("ALLOW_DIRECT_CLAIMS")
                .or(service.allow_direct_claims)
                .unwrap_or(defaults.allow_direct_claims),
            admin_token: env_string("ADMIN_TOKEN").or_else(|| service.admin_token.clone()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth_timeout_ms == 0 {
            return Err(anyhow!("auth_timeout_ms must be greater than zero"));
        }
        if self.session_token_ttl_seconds == 0 {
            return Err(anyhow!("session_token_ttl_seconds must be greater than zero"));
        }
        if self.traffic_bucket_seconds == 0 || self.traffic_window_buckets == 0 {
            return Err(anyhow!("traffic bucket width and window must be greater than zero"));
        }
        if self.min_room_ttl_seconds == 0 && self.fallback_room_ttl_seconds == 0 {
            return Err(anyhow!(
                "min_room_ttl_seconds and fallback_room_ttl_seconds cannot both be zero"
            ));
        }
        if self.min_room_ttl_seconds == 0 && self.lounge_room_ttl_seconds == 0 {
            return Err(anyhow!("lounge rooms would get a zero ttl"));
        }
        if self.session_ttl_seconds < self.inactivity_threshold_seconds {
            return Err(anyhow!(
                "session_ttl_seconds ({}) must not be shorter than inactivity_threshold_seconds ({})",
                self.session_ttl_seconds,
                self.inactivity_threshold_seconds
            ));
        }
        if self.heartbeat_ttl_seconds < self.inactivity_threshold_seconds {
            return Err(anyhow!(
                "heartbeat_ttl_seconds ({}) must not be shorter than inactivity_threshold_seconds ({})",
                self.heartbeat_ttl_seconds,
                self.inactivity_threshold_seconds
            ));
        }
        self.ttl_policy()
            .context("invalid room ttl configuration")?;
        Ok(())
    }

    pub fn ttl_policy(&self) -> Result<RoomTtlPolicy> {
        RoomTtlPolicy::with_timezone_name(
            &self.timezone,
            Duration::from_secs(self.min_room_ttl_seconds),
            Duration::from_secs(self.fallback_room_ttl_seconds),
            Duration::from_secs(self.lounge_room_ttl_seconds),
        )
        .map_err(|err| anyhow!(err))
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn session_token_ttl(&self) -> Duration {
        Duration::from_secs(self.session_token_ttl_seconds)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_seconds)
    }

    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.inactivity_threshold_seconds)
    }

    /// 房间记录在存活期之后的保留时长，覆盖至少两轮到期清理
    pub fn room_expiry_grace(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.saturating_mul(2).max(60))
    }

    /// 本实例专属的回复消费组：每个实例都要看到全部回复
    ///
    /// 组名取自 `instance_id`。部署时应为每个实例配置稳定的 `instance_id`，否则每次重启都会
    /// 生成新的随机 ID，留下无人消费的旧组，并且新组在分区分配完成前到达的回复会被跳过。
    pub fn reply_consumer_group(&self) -> String {
        format!("{}-{}", self.consumer_group, self.instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ChatServerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.instance_id.as_str().starts_with("chat-"));
        assert_eq!(config.room_expiry_grace(), Duration::from_secs(60));
        assert_eq!(config.store_kind, StoreKind::Redis);
    }

    #[test]
    fn service_section_and_profiles_apply() {
        let app = fanline_core::parse_config_str(
            r#"
            [service]
            name = "fanline-chat"

            [server]
            address = "127.0.0.1"
            port = 9000

            [redis.chat_store]
            url = "redis://cache:6379/2"
            namespace = "fan"

            [kafka.chat]
            bootstrap_servers = "kafka:9092"
            timeout_ms = 3000

            [services.chat]
            instance_id = "chat-a"
            store_kind = "memory"
            room_join_topic = ""
            traffic_threshold = 250
            timezone = "Asia/Seoul"
            "#,
        )
        .unwrap();

        let config = ChatServerConfig::from_app_config(&app).unwrap();
        assert_eq!(config.instance_id.as_str(), "chat-a");
        assert_eq!(config.store_kind, StoreKind::Memory);
        assert_eq!(config.redis_url, "redis://cache:6379/2");
        assert_eq!(config.key_prefix, "fan");
        assert_eq!(config.kafka_bootstrap, "kafka:9092");
        assert_eq!(config.kafka_timeout_ms, 3000);
        assert_eq!(config.room_join_topic, None);
        assert!(config.room_create_topic.is_some());
        assert_eq!(config.traffic_threshold, 250);
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.reply_consumer_group(), "fanline-chat-chat-a");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let config = ChatServerConfig {
            timezone: "Nowhere/City".to_string(),
            ..ChatServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ChatServerConfig {
            heartbeat_ttl_seconds: 10,
            inactivity_threshold_seconds: 60,
            ..ChatServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ChatServerConfig {
            session_ttl_seconds: 30,
            inactivity_threshold_seconds: 60,
            ..ChatServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ChatServerConfig {
            min_room_ttl_seconds: 0,
            fallback_room_ttl_seconds: 0,
            ..ChatServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ChatServerConfig {
            min_room_ttl_seconds: 0,
            lounge_room_ttl_seconds: 0,
            ..ChatServerConfig::default()
        };
        assert!(config.validate().is_err());
        assert!("disk".parse::<StoreKind>().is_err());
    }
}
