//! # 缓存模块
//!
//! 令牌快照与额度镜像使用的缓存抽象, 支持内存与 Redis 两种后端

pub mod abstract_cache;
pub mod keys;

pub use abstract_cache::{CacheProvider, CacheProviderType, MemoryCache, RedisCache, UnifiedCacheManager};
pub use keys::{CacheKey, CacheKeyBuilder, hash_token_key};
