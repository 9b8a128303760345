use crate::cache::UnifiedCacheManager;
use crate::config::AppConfig;
use crate::error::Result;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

/// 应用基础资源：配置、数据库、缓存等底层依赖
pub struct AppResources {
    config: Arc<AppConfig>,
    database: Arc<DatabaseConnection>,
    cache: Option<Arc<UnifiedCacheManager>>,
}

impl AppResources {
    /// 根据配置与数据库连接构建资源层
    ///
    /// `cache.enabled = false` 时不创建缓存, 令牌与额度直接读写数据库。
    pub async fn build(config: Arc<AppConfig>, database: Arc<DatabaseConnection>) -> Result<Arc<Self>> {
        let cache = if config.cache.enabled {
            Some(Arc::new(UnifiedCacheManager::new(&config.cache).await?))
        } else {
            None
        };
        Ok(Arc::new(Self {
            config,
            database,
            cache,
        }))
    }

    #[must_use]
    pub fn config(&self) -> Arc<AppConfig> {
        Arc::clone(&self.config)
    }

    #[must_use]
    pub fn database(&self) -> Arc<DatabaseConnection> {
        Arc::clone(&self.database)
    }

    #[must_use]
    pub fn cache(&self) -> Option<Arc<UnifiedCacheManager>> {
        self.cache.clone()
    }
}
