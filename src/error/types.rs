//! # 错误类型定义

use thiserror::Error;

use super::{BillingError, ChannelError, DatabaseError, ErrorCategory, KeyPoolError, TokenError};

/// 网关核心主要错误类型
#[derive(Debug, Error)]
pub enum GatewayError {
    /// 配置相关错误
    #[error("配置错误: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 数据库相关错误
    #[error("数据库错误: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 缓存相关错误
    #[error("缓存错误: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// IO相关错误
    #[error("IO错误: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// 序列化/反序列化错误
    #[error("序列化错误: {message}")]
    Serialization {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    /// 渠道错误
    #[error("渠道错误: {0}")]
    Channel(#[from] ChannelError),

    /// 多密钥错误
    #[error("密钥错误: {0}")]
    KeyPool(#[from] KeyPoolError),

    /// 计费错误
    #[error("计费错误: {0}")]
    Billing(#[from] BillingError),

    /// 令牌错误
    #[error("令牌错误: {0}")]
    Token(#[from] TokenError),

    /// 业务逻辑错误
    #[error("业务错误: {message}")]
    Business { message: String },

    /// 系统内部错误
    #[error("内部错误: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 服务初始化错误
    #[error("服务初始化错误: {message}")]
    ServerInit {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 附加上下文的错误
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<GatewayError>,
    },
}

impl GatewayError {
    /// 稳定的机器可读错误码
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Cache { .. } => "CACHE_ERROR",
            Self::Io { .. } => "IO_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::Channel(err) => match err {
                ChannelError::NotFound(_) => "CHANNEL_NOT_FOUND",
                ChannelError::NoAvailableChannel { .. } | ChannelError::AutoGroupsExhausted { .. } => {
                    "NO_AVAILABLE_CHANNEL"
                }
                ChannelError::DataInconsistency(_) => "CHANNEL_DATA_INCONSISTENCY",
                ChannelError::SelectionMissed => "CHANNEL_SELECTION_MISSED",
                ChannelError::RebuildInProgress => "ABILITY_REBUILD_IN_PROGRESS",
            },
            Self::KeyPool(_) => "CHANNEL_KEY_ERROR",
            Self::Billing(err) => {
                if err.is_insufficient() {
                    "INSUFFICIENT_QUOTA"
                } else {
                    "BILLING_ERROR"
                }
            }
            Self::Token(_) => "TOKEN_INVALID",
            Self::Business { .. } => "BUSINESS_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
            Self::ServerInit { .. } => "SERVER_INIT_ERROR",
            Self::Context { source, .. } => source.error_code(),
        }
    }

    /// 错误归类, 用于告警
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Billing(_) | Self::Token(_) | Self::Business { .. } => ErrorCategory::Client,
            Self::Channel(err) if err.is_exhaustion() => ErrorCategory::Client,
            Self::Context { source, .. } => source.category(),
            _ => ErrorCategory::Server,
        }
    }

    /// 去掉上下文包装后的根错误
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// 根错误是否为计费错误, 是则返回
    #[must_use]
    pub fn as_billing(&self) -> Option<&BillingError> {
        match self.root() {
            Self::Billing(err) => Some(err),
            _ => None,
        }
    }

    /// 根错误是否为渠道错误, 是则返回
    #[must_use]
    pub fn as_channel(&self) -> Option<&ChannelError> {
        match self.root() {
            Self::Channel(err) => Some(err),
            _ => None,
        }
    }

    /// 创建配置错误
    pub fn config<T: Into<String>>(message: T) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的配置错误
    pub fn config_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建数据库错误
    pub fn database<T: Into<String>>(message: T) -> Self {
        Self::Database {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的数据库错误
    pub fn database_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Database {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建缓存错误
    pub fn cache<T: Into<String>>(message: T) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的缓存错误
    pub fn cache_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Cache {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建业务错误
    pub fn business<T: Into<String>>(message: T) -> Self {
        Self::Business {
            message: message.into(),
        }
    }

    /// 创建内部错误
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的内部错误
    pub fn internal_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建服务初始化错误
    pub fn server_init<T: Into<String>>(message: T) -> Self {
        Self::ServerInit {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的服务初始化错误
    pub fn server_init_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::ServerInit {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

// 自动转换常见错误类型
impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: "文件操作失败".to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        Self::config_with_source("TOML解析失败", err)
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: "JSON处理失败".to_string(),
            source: err.into(),
        }
    }
}

impl From<sea_orm::DbErr> for GatewayError {
    fn from(err: sea_orm::DbErr) -> Self {
        Self::database_with_source("数据库操作失败", err)
    }
}

impl From<DatabaseError> for GatewayError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Query(db_err) => db_err.into(),
            other => Self::database_with_source(other.to_string(), other),
        }
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        Self::cache_with_source("Redis操作失败", err)
    }
}
