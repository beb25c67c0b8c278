//! 配置管理器 - 负责处理不同环境下的配置覆盖
//!
//! 加载 `{config_root}/environments/{environment}.toml`，深度合并到基础配置之上。

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use toml::Value;
use tracing::debug;

use super::merge_value;

/// 环境变量：当前运行环境
pub const ENV_VAR: &str = "FANLINE_ENV";

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    /// 获取当前环境名称
    ///
    /// 从环境变量 FANLINE_ENV 获取，未设置时默认为 "development"
    pub fn get_environment() -> String {
        env::var(ENV_VAR).unwrap_or_else(|_| "development".to_string())
    }

    /// 叠加当前环境的配置文件（文件不存在时不做任何处理）
    pub fn apply_environment_overlay(base: &mut Value, config_root: &Path) -> Result<()> {
        let environment = Self::get_environment();
        Self::apply_named_overlay(base, config_root, &environment)
    }

    /// 叠加指定环境的配置文件
    pub fn apply_named_overlay(base: &mut Value, config_root: &Path, environment: &str) -> Result<()> {
        let env_config_path = config_root
            .join("environments")
            .join(format!("{}.toml", environment));

        if !env_config_path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(&env_config_path).with_context(|| {
            format!(
                "unable to read environment config {}",
                env_config_path.display()
            )
        })?;
        let overlay: Value = toml::from_str(&content).with_context(|| {
            format!(
                "invalid environment config format {}",
                env_config_path.display()
            )
        })?;

        debug!(%environment, path = %env_config_path.display(), "applying environment overlay");
        merge_value(base, overlay);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_overlay_merges_into_base() {
        let root = std::env::temp_dir().join(format!("fanline-env-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(root.join("environments")).unwrap();
        fs::write(
            root.join("environments").join("staging.toml"),
            "[services.chat]\ntraffic_threshold = 250\n",
        )
        .unwrap();

        let mut base: Value = toml::from_str(
            "[services.chat]\ntraffic_threshold = 100\ntimezone = \"Asia/Seoul\"\n",
        )
        .unwrap();
        ConfigManager::apply_named_overlay(&mut base, &root, "staging").unwrap();

        let chat = base.get("services").and_then(|s| s.get("chat")).unwrap();
        assert_eq!(chat.get("traffic_threshold").and_then(Value::as_integer), Some(250));
        assert_eq!(chat.get("timezone").and_then(Value::as_str), Some("Asia/Seoul"));

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn missing_overlay_is_noop() {
        let mut base: Value = toml::from_str("[server]\nport = 1\n").unwrap();
        let before = base.clone();
        ConfigManager::apply_named_overlay(&mut base, Path::new("/nonexistent"), "prod").unwrap();
        assert_eq!(base, before);
    }
}
