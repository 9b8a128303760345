//! # 测试辅助函数
//!
//! 提供通用的测试工具和辅助函数

use std::sync::{Arc, Once};
use std::time::Duration;

use entity::{tokens, users};
use sea_orm::{ActiveModelTrait, ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use tracing::Level;

use super::fixtures::{TokenFixture, UserFixture};
use crate::cache::UnifiedCacheManager;
use crate::error::{DatabaseError, Result};

static INIT: Once = Once::new();

/// 初始化测试环境
pub fn init_test_env() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// 创建已完成迁移的内存数据库
///
/// 内存库只能使用单连接, 事务内的查询必须走事务句柄。
pub async fn create_test_db() -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).sqlx_logging(false);
    let db = Database::connect(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

/// 创建内存缓存
#[must_use]
pub fn create_test_cache() -> Arc<UnifiedCacheManager> {
    Arc::new(UnifiedCacheManager::memory(1024, Duration::from_secs(300)))
}

/// 插入一个钱包用户及其令牌
pub async fn seed_wallet_user(
    db: &DatabaseConnection,
    wallet: i64,
    token_remain: i64,
) -> Result<(users::Model, tokens::Model)> {
    let user = UserFixture::new().quota(wallet).to_active_model().insert(db).await?;
    let token = TokenFixture::new()
        .user_id(user.id)
        .remain_quota(token_remain)
        .to_active_model()
        .insert(db)
        .await?;
    Ok((user, token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::EntityTrait;

    #[tokio::test]
    async fn test_seed_wallet_user() {
        init_test_env();
        let db = create_test_db().await.unwrap();
        let (user, token) = seed_wallet_user(&db, 5000, 300).await.unwrap();
        assert_eq!(token.user_id, user.id);

        let users = users::Entity::find().all(&db).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].quota, 5000);
    }
}
