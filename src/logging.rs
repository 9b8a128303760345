//! # 日志配置模块
//!
//! 提供日志初始化以及带阶段/组件标签的结构化日志宏

use std::env;
use std::fmt;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 日志所处的处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStage {
    Startup,
    Shutdown,
    Configuration,
    Db,
    Cache,
    Scheduling,
    KeySelection,
    Billing,
    Settlement,
    BackgroundTask,
    Internal,
}

impl LogStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Configuration => "configuration",
            Self::Db => "db",
            Self::Cache => "cache",
            Self::Scheduling => "scheduling",
            Self::KeySelection => "key_selection",
            Self::Billing => "billing",
            Self::Settlement => "settlement",
            Self::BackgroundTask => "background_task",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for LogStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 产生日志的组件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogComponent {
    Main,
    Config,
    Database,
    Cache,
    ChannelRegistry,
    ChannelSelector,
    Ability,
    KeyPool,
    QuotaLedger,
    BatchUpdater,
    Token,
    Subscription,
    Billing,
    TaskReconciler,
    Scheduler,
}

impl LogComponent {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Config => "config",
            Self::Database => "database",
            Self::Cache => "cache",
            Self::ChannelRegistry => "channel_registry",
            Self::ChannelSelector => "channel_selector",
            Self::Ability => "ability",
            Self::KeyPool => "key_pool",
            Self::QuotaLedger => "quota_ledger",
            Self::BatchUpdater => "batch_updater",
            Self::Token => "token",
            Self::Subscription => "subscription",
            Self::Billing => "billing",
            Self::TaskReconciler => "task_reconciler",
            Self::Scheduler => "scheduler",
        }
    }
}

impl fmt::Display for LogComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 结构化 info 日志
///
/// 参数依次为: 请求ID, 阶段, 组件, 操作名, 消息, 以及可选的 tracing 字段
#[macro_export]
macro_rules! linfo {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr $(, $($fields:tt)+)?) => {
        ::tracing::info!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation,
            $($($fields)+,)?
            "{}",
            $message
        )
    };
}

/// 结构化 debug 日志
#[macro_export]
macro_rules! ldebug {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr $(, $($fields:tt)+)?) => {
        ::tracing::debug!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation,
            $($($fields)+,)?
            "{}",
            $message
        )
    };
}

/// 结构化 warn 日志
#[macro_export]
macro_rules! lwarn {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr $(, $($fields:tt)+)?) => {
        ::tracing::warn!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation,
            $($($fields)+,)?
            "{}",
            $message
        )
    };
}

/// 结构化 error 日志
#[macro_export]
macro_rules! lerror {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr $(, $($fields:tt)+)?) => {
        ::tracing::error!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation,
            $($($fields)+,)?
            "{}",
            $message
        )
    };
}

/// 初始化日志系统
pub fn init_optimized_logging(log_level: Option<&String>) {
    let level = log_level.map_or("info", String::as_str);

    // 默认配置：禁止数据库查询的详细日志
    let default_filter = format!(
        "{level},gateway_core=debug,sqlx::query=off,sea_orm::query=warn,sqlx=warn"
    );

    let log_filter = env::var("RUST_LOG").unwrap_or(default_filter);

    let result = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into()))
        .with(
            tracing_fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init();

    if result.is_err() {
        // 已有全局 subscriber (例如测试环境), 保持原样
        return;
    }

    if env::var("RUST_LOG").is_ok_and(|v| v.contains("sqlx::query=info") || v.contains("sqlx::query=debug")) {
        tracing::info!("SQLx database query logging enabled");
    } else {
        tracing::info!("SQLx database query logging disabled");
    }
}

/// 环境变量设置指南
pub fn print_logging_help() {
    println!("日志配置指南:");
    println!("  RUST_LOG=info                      # 标准日志级别");
    println!("  RUST_LOG=debug                     # 调试级别");
    println!("  RUST_LOG=info,sqlx::query=off      # 生产环境：禁止数据库查询日志");
    println!("  RUST_LOG=info,sqlx::query=info     # 开发环境：启用数据库查询日志");
    println!("  RUST_LOG=gateway_core=trace        # 核心模块详细追踪");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_and_component_display() {
        assert_eq!(LogStage::BackgroundTask.to_string(), "background_task");
        assert_eq!(LogComponent::TaskReconciler.to_string(), "task_reconciler");
    }

    #[test]
    fn test_macros_expand_with_and_without_fields() {
        let channel_id = 7;
        linfo!("system", LogStage::Startup, LogComponent::Main, "noop", "plain message");
        lwarn!(
            "req-1",
            LogStage::Scheduling,
            LogComponent::ChannelSelector,
            "noop",
            "with fields",
            channel_id = channel_id,
            reason = %"test"
        );
    }
}
