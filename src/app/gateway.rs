//! # 网关核心装配
//!
//! 按 资源 -> 服务 -> 后台任务 的顺序构建整个核心, 并负责有序关闭。

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::app::{AppResources, AppServices, AppTasks};
use crate::config::AppConfig;
use crate::database::{init_database, run_migrations};
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{linfo, lwarn};

/// 已装配完成的网关核心
pub struct GatewayCore {
    resources: Arc<AppResources>,
    services: Arc<AppServices>,
    tasks: Arc<AppTasks>,
}

impl GatewayCore {
    /// 连接数据库、执行迁移并装配全部服务, 不启动后台任务
    pub async fn bootstrap(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let database = init_database(&config.database).await?;
        run_migrations(&database).await?;
        Self::with_database(Arc::new(config), Arc::new(database)).await
    }

    /// 使用已有连接装配 (连接需已完成迁移)
    pub async fn with_database(config: Arc<AppConfig>, database: Arc<DatabaseConnection>) -> Result<Self> {
        let resources = AppResources::build(config.clone(), database).await?;
        let services = AppServices::initialize(&resources).await?;
        let tasks = AppTasks::initialize(&config, &services).await?;
        linfo!("system", LogStage::Startup, LogComponent::Main, "core_ready", "网关核心装配完成");
        Ok(Self {
            resources,
            services,
            tasks,
        })
    }

    /// 启动全部后台任务
    pub async fn start_background_tasks(&self) -> Result<()> {
        self.tasks.scheduler().start_all().await
    }

    #[must_use]
    pub fn resources(&self) -> Arc<AppResources> {
        Arc::clone(&self.resources)
    }

    #[must_use]
    pub fn services(&self) -> Arc<AppServices> {
        Arc::clone(&self.services)
    }

    #[must_use]
    pub fn tasks(&self) -> Arc<AppTasks> {
        Arc::clone(&self.tasks)
    }

    /// 停止后台任务, 写回未落库的额度增量并关闭渠道快照
    pub async fn shutdown(&self) -> Result<()> {
        self.tasks.scheduler().shutdown().await?;

        if let Some(batch) = self.services.batch() {
            match batch.flush().await {
                Ok(flushed) => linfo!(
                    "system",
                    LogStage::Shutdown,
                    LogComponent::BatchUpdater,
                    "final_flush",
                    "关闭前写回额度增量",
                    flushed = flushed
                ),
                Err(err) => lwarn!(
                    "system",
                    LogStage::Shutdown,
                    LogComponent::BatchUpdater,
                    "final_flush_failed",
                    "关闭前写回额度增量失败",
                    error = %err
                ),
            }
        }

        self.services.registry().close().await;
        linfo!("system", LogStage::Shutdown, LogComponent::Main, "core_stopped", "网关核心已关闭");
        Ok(())
    }
}
