//! # 应用配置结构定义

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ensure_config;
use crate::error::Result;

/// 应用主配置结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 日志级别
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// 数据库配置
    pub database: super::DatabaseConfig,
    /// 缓存配置
    pub cache: CacheConfig,
    /// 渠道配置
    pub channel: ChannelConfig,
    /// 额度配置
    pub quota: QuotaConfig,
    /// 订阅配置
    pub subscription: SubscriptionConfig,
    /// 异步任务配置
    pub task: TaskConfig,
}

/// 缓存类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// 内存缓存
    #[default]
    Memory,
    /// Redis缓存
    Redis,
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 是否启用令牌快照与额度镜像
    pub enabled: bool,
    /// 缓存类型
    pub cache_type: CacheType,
    /// 内存缓存最大条目数
    pub memory_max_entries: usize,
    /// 默认过期时间（秒）
    pub default_ttl: u64,
    /// Redis 缓存配置
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_type: CacheType::Memory,
            memory_max_entries: 10000,
            default_ttl: 300,
            redis: None,
        }
    }
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// 连接超时时间（秒）
    pub connection_timeout: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            connection_timeout: 10,
        }
    }
}

/// 渠道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// 是否使用内存渠道快照 (关闭时每次直接查询数据库)
    pub memory_cache_enabled: bool,
    /// 渠道快照刷新间隔（秒）
    pub sync_frequency_secs: u64,
    /// `auto` 分组按顺序尝试的分组列表
    pub auto_groups: Vec<String>,
    /// 轮询锁清理间隔（秒）
    pub polling_lock_sweep_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            memory_cache_enabled: true,
            sync_frequency_secs: 60,
            auto_groups: vec!["default".to_string()],
            polling_lock_sweep_secs: 600,
        }
    }
}

/// 额度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// 是否启用批量写回
    pub batch_update_enabled: bool,
    /// 批量写回间隔（秒）
    pub batch_update_interval_secs: u64,
    /// 未提供预估值时使用的默认预扣额度
    pub pre_consume_estimate: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            batch_update_enabled: false,
            batch_update_interval_secs: 5,
            pre_consume_estimate: 500,
        }
    }
}

/// 订阅配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// 额度重置扫描间隔（秒）
    pub reset_interval_secs: u64,
    /// 过期扫描间隔（秒）
    pub expire_interval_secs: u64,
    /// 每轮扫描处理的最大订阅数
    pub batch_limit: u64,
    /// 预扣记录保留时长（秒）
    pub pre_consume_record_ttl_secs: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            reset_interval_secs: 60,
            expire_interval_secs: 60,
            batch_limit: 300,
            pre_consume_record_ttl_secs: 7 * 24 * 3600,
        }
    }
}

/// 异步任务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// 任务超时时长（秒）
    pub timeout_secs: i64,
    /// 超时扫描间隔（秒）
    pub sweep_interval_secs: u64,
    /// 每轮扫描处理的最大任务数
    pub sweep_limit: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 24 * 3600,
            sweep_interval_secs: 300,
            sweep_limit: 100,
        }
    }
}

impl AppConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        ensure_config!(!self.database.url.is_empty(), "数据库URL不能为空");
        ensure_config!(self.database.max_connections > 0, "数据库最大连接数必须大于0");

        match self.cache.cache_type {
            CacheType::Memory => {
                ensure_config!(
                    self.cache.redis.is_none(),
                    "cache.redis 配置仅在 cache_type = \"redis\" 时可用"
                );
            }
            CacheType::Redis => {
                let redis_url = self.cache.redis.as_ref().map(|r| r.url.as_str());
                ensure_config!(
                    redis_url.is_some_and(|url| !url.is_empty()),
                    "Redis 缓存需要配置 cache.redis.url"
                );
            }
        }

        ensure_config!(self.channel.sync_frequency_secs > 0, "渠道同步间隔必须大于0");
        ensure_config!(
            self.channel.auto_groups.iter().all(|g| !g.trim().is_empty()),
            "auto_groups 中不能包含空分组"
        );
        ensure_config!(
            !self.quota.batch_update_enabled || self.quota.batch_update_interval_secs > 0,
            "批量写回间隔必须大于0"
        );
        ensure_config!(self.quota.pre_consume_estimate >= 0, "默认预扣额度不能为负数");
        ensure_config!(self.channel.polling_lock_sweep_secs > 0, "轮询锁清理间隔必须大于0");
        ensure_config!(
            self.subscription.reset_interval_secs > 0 && self.subscription.expire_interval_secs > 0,
            "订阅扫描间隔必须大于0"
        );
        ensure_config!(self.subscription.batch_limit > 0, "订阅扫描批量必须大于0");
        ensure_config!(self.task.sweep_interval_secs > 0, "任务扫描间隔必须大于0");
        ensure_config!(self.task.timeout_secs > 0, "任务超时时长必须大于0");
        ensure_config!(self.task.sweep_limit > 0, "任务扫描批量必须大于0");
        ensure_config!(
            u64::try_from(self.task.timeout_secs)
                .is_ok_and(|timeout| self.subscription.pre_consume_record_ttl_secs > timeout),
            "预扣记录保留时长必须大于任务超时时长"
        );

        Ok(())
    }

    /// 渠道快照刷新间隔
    #[must_use]
    pub const fn channel_sync_interval(&self) -> Duration {
        Duration::from_secs(self.channel.sync_frequency_secs)
    }

    /// 批量写回间隔
    #[must_use]
    pub const fn batch_update_interval(&self) -> Duration {
        Duration::from_secs(self.quota.batch_update_interval_secs)
    }

    /// 预扣记录保留时长
    #[must_use]
    pub const fn pre_consume_record_ttl(&self) -> Duration {
        Duration::from_secs(self.subscription.pre_consume_record_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.channel.memory_cache_enabled);
        assert_eq!(config.channel.auto_groups, vec!["default".to_string()]);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = parse_config(
            r#"
            [database]
            url = "sqlite::memory:"

            [channel]
            auto_groups = ["default", "vip"]

            [quota]
            batch_update_enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.channel.auto_groups, vec!["default", "vip"]);
        assert!(config.quota.batch_update_enabled);
        assert_eq!(config.quota.batch_update_interval_secs, 5);
        assert_eq!(config.task.timeout_secs, 24 * 3600);
    }

    #[test]
    fn test_redis_requires_url() {
        let err = parse_config(
            r#"
            [cache]
            cache_type = "redis"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cache.redis.url"));
    }

    #[test]
    fn test_pre_consume_ttl_must_outlive_task_timeout() {
        let mut config = AppConfig::default();
        config.subscription.pre_consume_record_ttl_secs = 3600;
        config.task.timeout_secs = 3600;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("预扣记录保留时长"));

        config.subscription.pre_consume_record_ttl_secs = 3601;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_auto_group_rejected() {
        let mut config = AppConfig::default();
        config.channel.auto_groups = vec!["default".to_string(), " ".to_string()];
        assert!(config.validate().is_err());
    }
}
