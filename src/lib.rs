//! Fanline Core 公共库
//!
//! 提供统一的配置加载、错误类型、日志初始化与指标注册

pub mod config;
pub mod error;
pub mod metrics;
pub mod tracing;

pub use config::{
    ChatServiceConfig, ConfigManager, FanlineAppConfig, KafkaClusterConfig, LoggingConfig,
    RedisPoolConfig, ServiceRuntimeConfig, load_config, load_config_from_source,
    parse_config_str,
};
pub use error::{ErrorBuilder, ErrorCode, FanlineError, Result, map_infra_error};
pub use metrics::{CHAT_METRICS, ChatMetrics, gather_metrics};
