//! # 数据库模块
//!
//! 数据库连接、迁移管理以及数据库时钟

use crate::config::DatabaseConfig;
use crate::error::{DatabaseError, Result};
use crate::{linfo, lwarn, lerror, logging::{LogComponent, LogStage}};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement,
};
use sea_orm_migration::MigratorTrait;
use std::time::Duration;

/// 初始化数据库连接
pub async fn init_database(config: &DatabaseConfig) -> Result<DatabaseConnection> {
    let url = config.get_connection_url()?;
    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Database,
        "connect",
        "正在连接数据库",
        url = %url.chars().take(50).collect::<String>()
    );

    let mut options = ConnectOptions::new(url);
    options
        .connect_timeout(Duration::from_secs(config.connect_timeout))
        .sqlx_logging(false);
    // 内存数据库每个连接都是独立的库, 只能使用单连接
    if config.is_memory_database() {
        options.max_connections(1);
    } else {
        options.max_connections(config.max_connections);
    }

    let db = Database::connect(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    linfo!("system", LogStage::Startup, LogComponent::Database, "connected", "数据库连接成功");
    Ok(db)
}

/// 运行数据库迁移
pub async fn run_migrations(db: &DatabaseConnection) -> Result<()> {
    linfo!("system", LogStage::Startup, LogComponent::Database, "migrate", "开始运行数据库迁移...");

    match ::migration::Migrator::up(db, None).await {
        Ok(()) => {
            linfo!("system", LogStage::Startup, LogComponent::Database, "migrate_done", "数据库迁移完成");
            Ok(())
        }
        Err(e) => {
            lerror!("system", LogStage::Startup, LogComponent::Database, "migrate_failed", "数据库迁移失败", error = %e);
            Err(e.into())
        }
    }
}

/// 检查数据库状态, 返回待应用的迁移数量
pub async fn check_database_status(db: &DatabaseConnection) -> Result<usize> {
    let pending = ::migration::Migrator::get_pending_migrations(db).await?;

    if pending.is_empty() {
        linfo!("system", LogStage::Startup, LogComponent::Database, "status", "所有迁移都已应用");
    } else {
        lwarn!(
            "system",
            LogStage::Startup,
            LogComponent::Database,
            "status",
            "存在待应用的迁移",
            pending = pending.len()
        );
    }

    Ok(pending.len())
}

/// 读取数据库时钟 (unix 秒)
///
/// 订阅的重置与过期边界都以数据库时间为准, 避免多实例间的时钟漂移。
pub async fn db_now<C: ConnectionTrait>(conn: &C) -> Result<i64> {
    let backend = conn.get_database_backend();
    let sql = match backend {
        DbBackend::Sqlite => "SELECT CAST(strftime('%s','now') AS INTEGER) AS now",
        DbBackend::Postgres => "SELECT CAST(EXTRACT(EPOCH FROM NOW()) AS BIGINT) AS now",
        DbBackend::MySql => "SELECT CAST(UNIX_TIMESTAMP() AS SIGNED) AS now",
    };

    let row = conn
        .query_one(Statement::from_string(backend, sql))
        .await?
        .ok_or_else(|| DatabaseError::Clock("查询未返回结果".to_string()))?;

    let now: i64 = row.try_get("", "now")?;
    Ok(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_database_migrates_and_reports_clock() {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        };
        let db = init_database(&config).await.unwrap();
        run_migrations(&db).await.unwrap();
        assert_eq!(check_database_status(&db).await.unwrap(), 0);

        let now = db_now(&db).await.unwrap();
        let local = chrono::Utc::now().timestamp();
        assert!((now - local).abs() < 5, "db clock {now} vs local {local}");
    }
}
