use crate::app::service_registry::AppServices;
use crate::app::task_scheduler::{ScheduledTask, TaskScheduler};
use crate::config::AppConfig;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// 后台任务类型枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// 渠道快照刷新
    RegistrySync,
    /// 额度增量批量写回
    BatchFlush,
    /// 订阅额度周期重置
    SubscriptionReset,
    /// 订阅过期处理
    SubscriptionExpire,
    /// 预扣记录清理
    PreConsumeCleanup,
    /// 超时异步任务收尾
    TaskTimeoutSweep,
    /// 失效渠道的轮询锁清理
    LockSweep,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RegistrySync => "registry_sync",
            Self::BatchFlush => "batch_flush",
            Self::SubscriptionReset => "subscription_reset",
            Self::SubscriptionExpire => "subscription_expire",
            Self::PreConsumeCleanup => "pre_consume_cleanup",
            Self::TaskTimeoutSweep => "task_timeout_sweep",
            Self::LockSweep => "lock_sweep",
        };
        f.write_str(name)
    }
}

/// 清理任务的执行间隔
const PRE_CONSUME_CLEANUP_PERIOD: Duration = Duration::from_secs(3600);

/// 后台任务集合：调度器及任务注册统一管理
///
/// 职责：
/// - 创建和管理所有后台任务（Task 层）
/// - Task 依赖 Service，从 `AppServices` 获取
/// - 统一的任务生命周期管理
pub struct AppTasks {
    scheduler: Arc<TaskScheduler>,
}

impl AppTasks {
    /// 初始化调度器并注册所有后台任务
    pub async fn initialize(config: &AppConfig, services: &Arc<AppServices>) -> Result<Arc<Self>> {
        let scheduler = Arc::new(TaskScheduler::new());
        scheduler.register_many(Self::build_tasks(config, services)?).await;

        let registered = scheduler.task_types().await;
        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Scheduler,
            "tasks_registered",
            "后台任务注册完成",
            count = registered.len()
        );
        Ok(Arc::new(Self { scheduler }))
    }

    fn build_tasks(config: &AppConfig, services: &Arc<AppServices>) -> Result<Vec<ScheduledTask>> {
        let mut tasks = Vec::new();

        if config.channel.memory_cache_enabled {
            let registry = services.registry();
            tasks.push(
                ScheduledTask::builder(TaskType::RegistrySync)
                    .every(config.channel_sync_interval())
                    .action(move || {
                        let registry = registry.clone();
                        async move {
                            let count = registry.refresh().await?;
                            ldebug!(
                                "system",
                                LogStage::BackgroundTask,
                                LogComponent::ChannelRegistry,
                                "registry_synced",
                                "渠道快照已刷新",
                                channels = count
                            );
                            Ok(())
                        }
                    })
                    .build()?,
            );
        }

        if let Some(batch) = services.batch() {
            tasks.push(
                ScheduledTask::builder(TaskType::BatchFlush)
                    .every(config.batch_update_interval())
                    .action(move || {
                        let batch = batch.clone();
                        async move { batch.flush().await.map(|_| ()) }
                    })
                    .build()?,
            );
        }

        let limit = config.subscription.batch_limit;
        let subscriptions = services.subscriptions();
        tasks.push(
            ScheduledTask::builder(TaskType::SubscriptionReset)
                .every(Duration::from_secs(config.subscription.reset_interval_secs))
                .run_on_start()
                .action({
                    let subscriptions = subscriptions.clone();
                    move || {
                        let subscriptions = subscriptions.clone();
                        async move { subscriptions.reset_due(limit).await.map(|_| ()) }
                    }
                })
                .build()?,
        );
        tasks.push(
            ScheduledTask::builder(TaskType::SubscriptionExpire)
                .every(Duration::from_secs(config.subscription.expire_interval_secs))
                .run_on_start()
                .action({
                    let subscriptions = subscriptions.clone();
                    move || {
                        let subscriptions = subscriptions.clone();
                        async move { subscriptions.expire_due(limit).await.map(|_| ()) }
                    }
                })
                .build()?,
        );

        let ttl = i64::try_from(config.pre_consume_record_ttl().as_secs()).unwrap_or(i64::MAX);
        tasks.push(
            ScheduledTask::builder(TaskType::PreConsumeCleanup)
                .every(PRE_CONSUME_CLEANUP_PERIOD)
                .action(move || {
                    let subscriptions = subscriptions.clone();
                    async move { subscriptions.cleanup_pre_consume_records(ttl).await.map(|_| ()) }
                })
                .build()?,
        );

        let reconciler = services.reconciler();
        let sweep_limit = config.task.sweep_limit;
        tasks.push(
            ScheduledTask::builder(TaskType::TaskTimeoutSweep)
                .every(Duration::from_secs(config.task.sweep_interval_secs))
                .action(move || {
                    let reconciler = reconciler.clone();
                    async move { reconciler.sweep_timed_out(sweep_limit).await.map(|_| ()) }
                })
                .build()?,
        );

        let rotator = services.rotator();
        tasks.push(
            ScheduledTask::builder(TaskType::LockSweep)
                .every(Duration::from_secs(config.channel.polling_lock_sweep_secs))
                .action(move || {
                    let rotator = rotator.clone();
                    async move { rotator.sweep_locks().await.map(|_| ()) }
                })
                .build()?,
        );

        Ok(tasks)
    }

    #[must_use]
    pub fn scheduler(&self) -> Arc<TaskScheduler> {
        Arc::clone(&self.scheduler)
    }
}
