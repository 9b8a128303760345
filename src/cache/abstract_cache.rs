//! # 缓存抽象层
//!
//! 提供统一的缓存接口，支持内存缓存和Redis缓存

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Serialize, de::DeserializeOwned};

use crate::config::{CacheConfig, CacheType};
use crate::error::{GatewayError, Result};
use crate::{linfo, logging::{LogComponent, LogStage}};

/// 缓存项
#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> CacheEntry<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expires_at| Instant::now() > expires_at)
    }
}

/// 缓存抽象trait
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// 设置缓存值
    async fn set<T>(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Send;

    /// 获取缓存值
    async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send;

    /// 删除缓存值
    async fn delete(&self, key: &str) -> Result<()>;

    /// 检查键是否存在
    async fn exists(&self, key: &str) -> Result<bool>;

    /// 增加数字值
    async fn incr(&self, key: &str, delta: i64) -> Result<i64>;
}

/// 内存缓存实现
pub struct MemoryCache {
    data: RwLock<HashMap<String, CacheEntry<Vec<u8>>>>,
    max_entries: usize,
}

impl MemoryCache {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    fn ensure_capacity(data: &mut HashMap<String, CacheEntry<Vec<u8>>>, max_entries: usize) {
        if data.len() < max_entries {
            return;
        }
        data.retain(|_, entry| !entry.is_expired());
        if data.len() >= max_entries {
            if let Some(key) = data.keys().next().cloned() {
                data.remove(&key);
            }
        }
    }
}

#[async_trait]
impl CacheProvider for MemoryCache {
    async fn set<T>(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Send,
    {
        let serialized = serde_json::to_vec(&value)
            .map_err(|e| GatewayError::cache_with_source("序列化缓存值失败", e))?;

        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        if !data.contains_key(key) {
            Self::ensure_capacity(&mut data, self.max_entries);
        }
        data.insert(key.to_string(), CacheEntry::new(serialized, ttl));
        Ok(())
    }

    async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        match data.get(key) {
            Some(entry) if !entry.is_expired() => {
                let value = serde_json::from_slice(&entry.value)
                    .map_err(|e| GatewayError::cache_with_source("反序列化缓存值失败", e))?;
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(data.get(key).is_some_and(|entry| !entry.is_expired()))
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);

        let (current, expires_at) = match data.get(key) {
            Some(entry) if !entry.is_expired() => (
                serde_json::from_slice::<i64>(&entry.value).unwrap_or(0),
                entry.expires_at,
            ),
            _ => (0, None),
        };

        let new_value = current + delta;
        let serialized = serde_json::to_vec(&new_value)
            .map_err(|e| GatewayError::cache_with_source("序列化数字值失败", e))?;

        data.insert(
            key.to_string(),
            CacheEntry {
                value: serialized,
                expires_at,
            },
        );
        Ok(new_value)
    }
}

/// Redis缓存实现
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| GatewayError::cache_with_source("创建Redis客户端失败", e))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| GatewayError::cache_with_source("建立Redis连接失败", e))?;

        Ok(Self { manager })
    }
}

#[async_trait]
impl CacheProvider for RedisCache {
    async fn set<T>(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Send,
    {
        let serialized = serde_json::to_string(&value)
            .map_err(|e| GatewayError::cache_with_source("序列化缓存值失败", e))?;

        let mut conn = self.manager.clone();
        match ttl {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, serialized, ttl.as_secs().max(1)).await?,
            None => conn.set::<_, _, ()>(key, serialized).await?,
        }
        Ok(())
    }

    async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        let mut conn = self.manager.clone();
        let result: Option<String> = conn.get(key).await?;

        result
            .map(|data| {
                serde_json::from_str(&data)
                    .map_err(|e| GatewayError::cache_with_source("反序列化缓存值失败", e))
            })
            .transpose()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        Ok(conn.exists(key).await?)
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.manager.clone();
        Ok(conn.incr(key, delta).await?)
    }
}

/// 缓存提供者枚举 - 避免 trait object 兼容性问题
pub enum CacheProviderType {
    Memory(MemoryCache),
    Redis(RedisCache),
}

impl CacheProviderType {
    /// 设置缓存值
    pub async fn set<T>(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Send,
    {
        match self {
            Self::Memory(cache) => cache.set(key, value, ttl).await,
            Self::Redis(cache) => cache.set(key, value, ttl).await,
        }
    }

    /// 获取缓存值
    pub async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self {
            Self::Memory(cache) => cache.get(key).await,
            Self::Redis(cache) => cache.get(key).await,
        }
    }

    /// 删除缓存值
    pub async fn delete(&self, key: &str) -> Result<()> {
        match self {
            Self::Memory(cache) => cache.delete(key).await,
            Self::Redis(cache) => cache.delete(key).await,
        }
    }

    /// 检查键是否存在
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self {
            Self::Memory(cache) => cache.exists(key).await,
            Self::Redis(cache) => cache.exists(key).await,
        }
    }

    /// 增加数字值
    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        match self {
            Self::Memory(cache) => cache.incr(key, delta).await,
            Self::Redis(cache) => cache.incr(key, delta).await,
        }
    }
}

/// 统一缓存管理器
pub struct UnifiedCacheManager {
    provider: CacheProviderType,
    default_ttl: Duration,
}

impl UnifiedCacheManager {
    /// 根据配置创建缓存管理器
    pub async fn new(config: &CacheConfig) -> Result<Self> {
        let provider = match config.cache_type {
            CacheType::Memory => {
                linfo!(
                    "system",
                    LogStage::Startup,
                    LogComponent::Cache,
                    "init_memory_cache",
                    "使用内存缓存",
                    max_entries = config.memory_max_entries
                );
                CacheProviderType::Memory(MemoryCache::new(config.memory_max_entries))
            }
            CacheType::Redis => {
                let redis = config
                    .redis
                    .as_ref()
                    .ok_or_else(|| GatewayError::config("Redis 缓存需要配置 cache.redis.url"))?;
                linfo!("system", LogStage::Startup, LogComponent::Cache, "init_redis_cache", "使用Redis缓存");
                CacheProviderType::Redis(RedisCache::new(&redis.url).await?)
            }
        };

        Ok(Self {
            provider,
            default_ttl: Duration::from_secs(config.default_ttl),
        })
    }

    /// 仅使用内存后端的管理器
    #[must_use]
    pub fn memory(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            provider: CacheProviderType::Memory(MemoryCache::new(max_entries)),
            default_ttl,
        }
    }

    /// 获取缓存提供者的引用
    #[must_use]
    pub const fn provider(&self) -> &CacheProviderType {
        &self.provider
    }

    /// 默认过期时间
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// 设置缓存值
    pub async fn set<T>(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Send,
    {
        self.provider.set(key, value, ttl).await
    }

    /// 获取缓存值
    pub async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        self.provider.get(key).await
    }

    /// 删除缓存值
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.provider.delete(key).await
    }

    /// 检查键是否存在
    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.provider.exists(key).await
    }

    /// 增加数字值
    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        self.provider.incr(key, delta).await
    }

    /// 仅在键存在时增加数字值
    ///
    /// 镜像只跟随已缓存的值, 缺失时等待下一次整体回填。
    pub async fn incr_if_exists(&self, key: &str, delta: i64) -> Result<Option<i64>> {
        if self.provider.exists(key).await? {
            Ok(Some(self.provider.incr(key, delta).await?))
        } else {
            Ok(None)
        }
    }
}
