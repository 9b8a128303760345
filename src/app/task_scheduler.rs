//! # 后台任务调度器
//!
//! 提供统一的任务注册、启动与停止能力，避免在各个模块中分散管理后台任务。
//! 每个任务是一个按固定间隔执行的循环, 停止时通过取消令牌通知所有循环退出。

use crate::app::tasks::TaskType;
use crate::error::{GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lerror, linfo, lwarn};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type TaskAction = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// 调度任务定义
#[derive(Clone)]
pub struct ScheduledTask {
    task_type: TaskType,
    period: Duration,
    action: TaskAction,
    run_on_start: bool,
}

impl ScheduledTask {
    /// 创建任务构建器
    #[must_use]
    pub fn builder(task_type: TaskType) -> ScheduledTaskBuilder {
        ScheduledTaskBuilder {
            task_type,
            period: None,
            action: None,
            run_on_start: false,
        }
    }

    #[must_use]
    pub const fn task_type(&self) -> TaskType {
        self.task_type
    }

    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    /// 立即执行一次
    pub async fn run_once(&self) -> Result<()> {
        (self.action)().await
    }

    fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            if !self.run_on_start {
                // interval 的第一次 tick 立即返回
                ticker.tick().await;
            }

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_once().await {
                            lwarn!(
                                "system",
                                LogStage::BackgroundTask,
                                LogComponent::Scheduler,
                                "task_run_failed",
                                "后台任务执行失败",
                                task = %self.task_type,
                                error = %err
                            );
                        }
                    }
                }
            }

            ldebug!(
                "system",
                LogStage::Shutdown,
                LogComponent::Scheduler,
                "task_loop_exit",
                "后台任务循环已退出",
                task = %self.task_type
            );
        })
    }
}

/// 任务构建器
pub struct ScheduledTaskBuilder {
    task_type: TaskType,
    period: Option<Duration>,
    action: Option<TaskAction>,
    run_on_start: bool,
}

impl ScheduledTaskBuilder {
    /// 执行间隔
    #[must_use]
    pub const fn every(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    /// 启动时先执行一次
    #[must_use]
    pub const fn run_on_start(mut self) -> Self {
        self.run_on_start = true;
        self
    }

    /// 注册执行逻辑
    #[must_use]
    pub fn action<F, Fut>(mut self, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.action = Some(Arc::new(move || Box::pin(action())));
        self
    }

    /// 构建最终任务
    pub fn build(self) -> Result<ScheduledTask> {
        let action = self.action.ok_or_else(|| {
            GatewayError::server_init(format!("后台任务 {} 缺少执行逻辑", self.task_type))
        })?;
        let period = self
            .period
            .filter(|p| !p.is_zero())
            .ok_or_else(|| GatewayError::server_init(format!("后台任务 {} 的执行间隔无效", self.task_type)))?;
        Ok(ScheduledTask {
            task_type: self.task_type,
            period,
            action,
            run_on_start: self.run_on_start,
        })
    }
}

/// 后台任务调度器
#[derive(Default)]
pub struct TaskScheduler {
    tasks: RwLock<Vec<ScheduledTask>>,
    handles: Mutex<Vec<(TaskType, JoinHandle<()>)>>,
    shutdown: CancellationToken,
}

impl TaskScheduler {
    /// 创建新的调度器
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册任务
    pub async fn register(&self, task: ScheduledTask) {
        let mut guard = self.tasks.write().await;
        guard.push(task);
    }

    /// 批量注册任务
    pub async fn register_many(&self, tasks: Vec<ScheduledTask>) {
        let mut guard = self.tasks.write().await;
        guard.extend(tasks);
    }

    /// 已注册的任务类型
    pub async fn task_types(&self) -> Vec<TaskType> {
        self.tasks.read().await.iter().map(ScheduledTask::task_type).collect()
    }

    /// 立即执行一次指定类型的任务
    pub async fn run_now(&self, task_type: TaskType) -> Result<()> {
        let task = {
            self.tasks
                .read()
                .await
                .iter()
                .find(|t| t.task_type == task_type)
                .cloned()
        };
        match task {
            Some(task) => task.run_once().await,
            None => Err(GatewayError::business(format!("后台任务未注册: {task_type}"))),
        }
    }

    /// 启动所有任务
    pub async fn start_all(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::server_init("调度器已停止, 不能再次启动"));
        }
        let tasks = { self.tasks.read().await.clone() };
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return Ok(());
        }
        for task in tasks {
            linfo!(
                "system",
                LogStage::BackgroundTask,
                LogComponent::Scheduler,
                "task_start",
                "启动后台任务",
                task = %task.task_type,
                period_secs = task.period.as_secs()
            );
            let task_type = task.task_type;
            handles.push((task_type, task.spawn(self.shutdown.child_token())));
        }
        Ok(())
    }

    /// 停止所有任务并等待循环退出
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        for (task_type, handle) in handles.into_iter().rev() {
            if let Err(err) = handle.await {
                lerror!(
                    "system",
                    LogStage::Shutdown,
                    LogComponent::Scheduler,
                    "task_stop_failed",
                    "后台任务未能正常退出",
                    task = %task_type,
                    error = %err
                );
            }
        }
        linfo!("system", LogStage::Shutdown, LogComponent::Scheduler, "stopped", "后台任务已全部停止");
        Ok(())
    }
}
