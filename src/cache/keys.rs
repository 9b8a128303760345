//! # 缓存键命名规范
//!
//! 令牌相关键一律使用令牌的 SHA-256 摘要, 避免明文密钥落入缓存

use sha2::{Digest, Sha256};
use std::fmt;

/// 缓存键类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKey {
    /// 令牌快照 - `token:snapshot:{token_hash}`
    TokenSnapshot { token_hash: String },

    /// 令牌剩余额度镜像 - `token:quota:{token_hash}`
    TokenQuota { token_hash: String },

    /// 用户钱包额度镜像 - `user:quota:{user_id}`
    UserQuota { user_id: i32 },
}

impl CacheKey {
    /// 生成缓存键字符串
    #[must_use]
    pub fn build(&self) -> String {
        match self {
            Self::TokenSnapshot { token_hash } => format!("token:snapshot:{token_hash}"),
            Self::TokenQuota { token_hash } => format!("token:quota:{token_hash}"),
            Self::UserQuota { user_id } => format!("user:quota:{user_id}"),
        }
    }

    /// 获取缓存键的命名空间
    #[must_use]
    pub const fn namespace(&self) -> &'static str {
        match self {
            Self::TokenSnapshot { .. } | Self::TokenQuota { .. } => "token",
            Self::UserQuota { .. } => "user",
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.build())
    }
}

/// 计算令牌摘要
#[must_use]
pub fn hash_token_key(token_key: &str) -> String {
    hex::encode(Sha256::digest(token_key.as_bytes()))
}

/// 缓存键构建器
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// 构建令牌快照缓存键
    #[must_use]
    pub fn token_snapshot(token_key: &str) -> CacheKey {
        CacheKey::TokenSnapshot {
            token_hash: hash_token_key(token_key),
        }
    }

    /// 构建令牌额度镜像缓存键
    #[must_use]
    pub fn token_quota(token_key: &str) -> CacheKey {
        CacheKey::TokenQuota {
            token_hash: hash_token_key(token_key),
        }
    }

    /// 构建用户额度镜像缓存键
    #[must_use]
    pub const fn user_quota(user_id: i32) -> CacheKey {
        CacheKey::UserQuota { user_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_build() {
        let key = CacheKeyBuilder::user_quota(42);
        assert_eq!(key.build(), "user:quota:42");
        assert_eq!(key.namespace(), "user");

        let quota = CacheKeyBuilder::token_quota("sk-secret");
        assert!(quota.build().starts_with("token:quota:"));
        assert!(!quota.build().contains("sk-secret"));
        assert_eq!(quota.namespace(), "token");
    }

    #[test]
    fn test_token_hash_is_stable() {
        assert_eq!(hash_token_key("abc"), hash_token_key("abc"));
        assert_ne!(hash_token_key("abc"), hash_token_key("abd"));
        assert_eq!(hash_token_key("abc").len(), 64);
    }
}
