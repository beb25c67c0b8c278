//! Fanline Core 配置模块
//!
//! 该模块提供应用程序配置管理功能，包括：
//! - 配置文件（单文件或目录）加载与合并
//! - 环境特定配置覆盖（见 [`ConfigManager`]）
//! - Redis / Kafka 命名配置与聊天服务配置定义

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use toml::Value;
use tracing::warn;

mod manager;
pub use manager::ConfigManager;

/// 全局应用配置实例，使用 OnceLock 确保只初始化一次
static APP_CONFIG: OnceLock<FanlineAppConfig> = OnceLock::new();

/// 服务标识配置
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// 监听地址配置
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
}

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别（可被 RUST_LOG 覆盖）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 输出格式：text / json
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_true")]
    pub with_target: bool,
    #[serde(default)]
    pub with_thread_ids: bool,
    #[serde(default)]
    pub with_file: bool,
    #[serde(default)]
    pub with_line_number: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
        }
    }
}

/// Redis 连接配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RedisPoolConfig {
    /// Redis 服务器地址
    pub url: String,
    /// 命名空间前缀
    #[serde(default)]
    pub namespace: Option<String>,
    /// 单次命令超时（毫秒）
    #[serde(default)]
    pub response_timeout_ms: Option<u64>,
}

/// Kafka 集群配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct KafkaClusterConfig {
    /// Kafka 服务器地址列表
    pub bootstrap_servers: String,
    /// 客户端标识
    #[serde(default)]
    pub client_id: Option<String>,
    /// 安全协议
    #[serde(default)]
    pub security_protocol: Option<String>,
    /// 超时时间（毫秒）
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// 其他 librdkafka 选项
    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// 服务端点配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServiceEndpointConfig {
    pub address: Option<String>,
    pub port: Option<u16>,
}

/// 服务运行时配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServiceRuntimeConfig {
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub server: Option<ServiceEndpointConfig>,
}

/// 聊天服务配置（原始值，缺省项由服务侧补齐）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChatServiceConfig {
    /// 运行时配置
    #[serde(flatten)]
    pub runtime: ServiceRuntimeConfig,
    /// 实例 ID（缺省时启动时生成）
    #[serde(default)]
    pub instance_id: Option<String>,
    /// 共享存储类型：redis / memory
    #[serde(default)]
    pub store_kind: Option<String>,
    /// Redis 配置引用
    #[serde(default)]
    pub redis: Option<String>,
    /// 存储键前缀
    #[serde(default)]
    pub key_prefix: Option<String>,
    /// Kafka 配置引用
    #[serde(default)]
    pub kafka: Option<String>,
    /// 授权回复消费者组前缀
    #[serde(default)]
    pub consumer_group: Option<String>,
    /// 创建房间授权主题
    #[serde(default)]
    pub room_create_topic: Option<String>,
    /// 加入房间授权主题
    #[serde(default)]
    pub room_join_topic: Option<String>,
    /// 通用授权主题
    #[serde(default)]
    pub generic_auth_topic: Option<String>,
    /// 授权回复主题
    #[serde(default)]
    pub auth_reply_topic: Option<String>,
    /// 授权等待超时（毫秒）
    #[serde(default)]
    pub auth_timeout_ms: Option<u64>,
    /// 会话令牌有效期（秒）
    #[serde(default)]
    pub session_token_ttl_seconds: Option<u64>,
    /// 会话信息过期时间（秒）
    #[serde(default)]
    pub session_ttl_seconds: Option<u64>,
    /// 心跳键过期时间（秒）
    #[serde(default)]
    pub heartbeat_ttl_seconds: Option<u64>,
    /// 不活跃判定阈值（秒）
    #[serde(default)]
    pub inactivity_threshold_seconds: Option<u64>,
    /// 清理任务间隔（秒）
    #[serde(default)]
    pub sweep_interval_seconds: Option<u64>,
    /// 实例心跳间隔（秒）
    #[serde(default)]
    pub heartbeat_interval_seconds: Option<u64>,
    /// 统一时区（IANA 名称）
    #[serde(default)]
    pub timezone: Option<String>,
    /// 房间 TTL 下限（秒）
    #[serde(default)]
    pub min_room_ttl_seconds: Option<u64>,
    /// 房间 TTL 计算失败时的兜底值（秒）
    #[serde(default)]
    pub fallback_room_ttl_seconds: Option<u64>,
    /// Lounge 房间固定 TTL（秒）
    #[serde(default)]
    pub lounge_room_ttl_seconds: Option<u64>,
    /// 流量桶宽度（秒）
    #[serde(default)]
    pub traffic_bucket_seconds: Option<u64>,
    /// 滑动窗口桶数
    #[serde(default)]
    pub traffic_window_buckets: Option<u32>,
    /// 窗口消息阈值
    #[serde(default)]
    pub traffic_threshold: Option<u64>,
    /// 流量检查间隔（秒）
    #[serde(default)]
    pub traffic_check_interval_seconds: Option<u64>,
    /// 用户凭证（JWT）密钥
    #[serde(default)]
    pub credential_secret: Option<String>,
    /// 用户凭证签发方
    #[serde(default)]
    pub credential_issuer: Option<String>,
    /// 是否允许 Lounge 房间以原始身份声明握手
    #[serde(default)]
    pub allow_direct_claims: Option<bool>,
    /// 管理接口令牌
    #[serde(default)]
    pub admin_token: Option<String>,
}

/// 服务配置集合
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServicesConfig {
    #[serde(default)]
    pub chat: Option<ChatServiceConfig>,
}

/// Fanline 应用配置主结构体
#[derive(Debug, Clone, Deserialize)]
pub struct FanlineAppConfig {
    pub service: ServiceConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Redis 配置映射
    #[serde(default)]
    pub redis: HashMap<String, RedisPoolConfig>,
    /// Kafka 配置映射
    #[serde(default)]
    pub kafka: HashMap<String, KafkaClusterConfig>,
    /// 服务配置
    #[serde(default)]
    pub services: ServicesConfig,
}

impl FanlineAppConfig {
    /// 获取 Redis 配置
    pub fn redis_profile(&self, name: &str) -> Option<&RedisPoolConfig> {
        self.redis.get(name)
    }

    /// 获取 Kafka 配置
    pub fn kafka_profile(&self, name: &str) -> Option<&KafkaClusterConfig> {
        self.kafka.get(name)
    }

    /// 获取聊天服务配置
    pub fn chat_service(&self) -> ChatServiceConfig {
        self.services.chat.clone().unwrap_or_default()
    }

    /// 聊天服务最终监听地址（服务级配置优先）
    pub fn chat_listen_addr(&self) -> String {
        let runtime = self.chat_service().runtime;
        let endpoint = runtime.server.unwrap_or_default();
        let address = endpoint
            .address
            .unwrap_or_else(|| self.server.address.clone());
        let port = endpoint.port.unwrap_or(self.server.port);
        format!("{}:{}", address, port)
    }

    /// 确保配置有默认值
    fn ensure_defaults(&mut self) {
        if self.server.address.is_empty() {
            self.server.address = "0.0.0.0".to_string();
        }
        if self.server.port == 0 {
            self.server.port = 8080;
        }
    }
}

/// 加载配置
///
/// 未指定路径时依次尝试 `config/` 目录与 `config.toml`。
pub fn load_config(path: Option<&str>) -> &'static FanlineAppConfig {
    let candidates: Vec<PathBuf> = match path {
        Some(p) => vec![PathBuf::from(p)],
        None => vec![PathBuf::from("config"), PathBuf::from("config.toml")],
    };

    APP_CONFIG.get_or_init(|| load_with_fallback(&candidates))
}

/// 使用备选方案加载配置
fn load_with_fallback(candidates: &[PathBuf]) -> FanlineAppConfig {
    for path in candidates {
        match load_config_from_source(path) {
            Ok(cfg) => return cfg,
            Err(err) => {
                warn!("failed to load config from {}: {err:#}", path.display());
            }
        }
    }

    warn!("no configuration source succeeded, falling back to defaults");
    default_config()
}

/// 从源加载配置（文件或目录），并叠加环境配置
pub fn load_config_from_source(path: &Path) -> Result<FanlineAppConfig> {
    if !path.exists() {
        return Err(anyhow!(
            "configuration path {} does not exist",
            path.display()
        ));
    }

    let metadata = path
        .metadata()
        .with_context(|| format!("unable to read metadata for {}", path.display()))?;

    let mut merged = if metadata.is_dir() {
        load_directory_value(path)?
    } else {
        load_toml_value(path)?
    };

    let env_root = if metadata.is_dir() {
        path.to_path_buf()
    } else {
        path.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    };
    ConfigManager::apply_environment_overlay(&mut merged, &env_root)?;

    parse_config_value(merged)
        .with_context(|| format!("invalid configuration in {}", path.display()))
}

/// 从 TOML 文本解析配置（测试与嵌入式场景）
pub fn parse_config_str(content: &str) -> Result<FanlineAppConfig> {
    let value: Value = toml::from_str(content).context("invalid TOML content")?;
    parse_config_value(value)
}

fn parse_config_value(value: Value) -> Result<FanlineAppConfig> {
    let mut cfg: FanlineAppConfig = value.try_into().context("invalid config format")?;
    cfg.ensure_defaults();
    Ok(cfg)
}

/// 从目录加载：base.toml + shared/ + services/ + overrides/
fn load_directory_value(path: &Path) -> Result<Value> {
    let base_file = path.join("base.toml");
    if !base_file.exists() {
        return Err(anyhow!(
            "missing base configuration: {}",
            base_file.display()
        ));
    }

    let mut merged = load_toml_value(&base_file)?;

    if !merged.is_table() {
        return Err(anyhow!(
            "base configuration must be a table: {}",
            base_file.display()
        ));
    }

    merge_directory(&mut merged, &path.join("shared"))?;
    merge_directory(&mut merged, &path.join("services"))?;
    merge_directory(&mut merged, &path.join("overrides"))?;

    Ok(merged)
}

/// 合并目录中的配置片段（按文件名排序）
fn merge_directory(root: &mut Value, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("unable to read config directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(OsStr::to_str)
                .map(|ext| ext.eq_ignore_ascii_case("toml"))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();

    entries.sort_by_key(|entry| entry.path());

    for entry in entries {
        let value = load_toml_value(&entry.path())?;
        merge_value(&mut *root, value);
    }

    Ok(())
}

fn load_toml_value(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read config fragment {}", path.display()))?;
    let value: Value = toml::from_str(&content)
        .with_context(|| format!("invalid TOML content in fragment {}", path.display()))?;
    Ok(value)
}

/// 深度合并：表按键递归合并，其余类型整体覆盖
pub(crate) fn merge_value(base: &mut Value, overlay: Value) {
    match overlay {
        Value::Table(overlay_table) => {
            if let Value::Table(base_table) = base {
                for (key, overlay_value) in overlay_table.into_iter() {
                    match base_table.get_mut(&key) {
                        Some(base_value) => merge_value(base_value, overlay_value),
                        None => {
                            base_table.insert(key, overlay_value);
                        }
                    }
                }
            } else {
                *base = Value::Table(overlay_table);
            }
        }
        other => {
            *base = other;
        }
    }
}

/// 默认配置
fn default_config() -> FanlineAppConfig {
    FanlineAppConfig {
        service: ServiceConfig {
            name: "fanline-chat".to_string(),
            version: default_version(),
        },
        server: ServerConfig {
            address: "0.0.0.0".to_string(),
            port: 8080,
        },
        logging: LoggingConfig::default(),
        redis: HashMap::new(),
        kafka: HashMap::new(),
        services: ServicesConfig::default(),
    }
}
