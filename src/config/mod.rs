//! # 配置管理模块
//!
//! 处理应用配置加载与验证

mod app_config;
mod database;

pub use app_config::{
    AppConfig, CacheConfig, CacheType, ChannelConfig, QuotaConfig, RedisConfig,
    SubscriptionConfig, TaskConfig,
};
pub use database::DatabaseConfig;

use std::env;
use std::path::Path;

use crate::error::{GatewayError, Result};

/// 按 `RUST_ENV` 加载 `config/config.{env}.toml`
pub fn load_config() -> Result<AppConfig> {
    let env = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
    load_config_from(format!("config/config.{env}.toml"))
}

/// 从指定路径加载配置文件
pub fn load_config_from(config_file: impl AsRef<Path>) -> Result<AppConfig> {
    let config_file = config_file.as_ref();
    if !config_file.exists() {
        return Err(GatewayError::config(format!(
            "配置文件不存在: {}",
            config_file.display()
        )));
    }

    let config_content = std::fs::read_to_string(config_file).map_err(|e| {
        GatewayError::config_with_source(
            format!("读取配置文件失败: {}", config_file.display()),
            e,
        )
    })?;

    parse_config(&config_content)
}

/// 解析并验证 TOML 配置内容
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}
