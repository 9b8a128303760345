//! # 异步任务对账
//!
//! 任务提交时已按估算扣费并把计费上下文冻结在任务的私有数据里。
//! 上游任务结束后用冻结的上下文重新结算: 成功时按实际额度补扣或退还差额,
//! 失败或超时时全额退还。只有赢得状态 CAS 的实例才会执行结算。

use std::sync::Arc;

use entity::tasks::{self, TaskPrivateData, TaskStatus};
use entity::{tokens, users};
use sea_orm::{DatabaseConnection, EntityTrait};

use super::model::{TaskStore, TaskUpdate};
use crate::billing::{AuditLogEntry, AuditLogWriter, LogOther};
use crate::error::{BillingError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::quota::QuotaLedger;
use crate::subscription::{AdjustOutcome, RefundOutcome, SubscriptionLedger};
use crate::types::{BillingSource, Usage};
use crate::{ldebug, linfo, lwarn};

/// 超时任务的失败原因
pub const TIMEOUT_REASON: &str = "任务超时";

/// 完成结算的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSettlement {
    /// 按次计费、缺少用量或没有差额, 账本不变
    Skipped,
    Adjusted { actual: i64, delta: i64 },
}

/// 一次状态推进的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// 任务已处于终态
    Ignored,
    /// 其他实例先一步推进了状态
    LostRace,
    Updated,
    Settled(TaskSettlement),
    Refunded { amount: i64 },
}

/// 异步任务对账器
pub struct AsyncTaskReconciler {
    db: Arc<DatabaseConnection>,
    store: Arc<TaskStore>,
    quota: Arc<QuotaLedger>,
    subscriptions: Arc<SubscriptionLedger>,
    audit: AuditLogWriter,
    timeout_secs: i64,
}

impl AsyncTaskReconciler {
    #[must_use]
    pub fn new(
        db: Arc<DatabaseConnection>,
        quota: Arc<QuotaLedger>,
        subscriptions: Arc<SubscriptionLedger>,
        timeout_secs: i64,
    ) -> Self {
        Self {
            store: Arc::new(TaskStore::new(Arc::clone(&db))),
            audit: AuditLogWriter::new(Arc::clone(&db)),
            db,
            quota,
            subscriptions,
            timeout_secs,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// 应用一次上游轮询结果
    pub async fn on_status_update(&self, task_id: &str, update: TaskUpdate) -> Result<ReconcileOutcome> {
        let task = self
            .store
            .find_by_task_id(task_id)
            .await?
            .ok_or_else(|| BillingError::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Ok(ReconcileOutcome::Ignored);
        }

        let expected = task.status;
        let now = chrono::Utc::now().timestamp();
        let mut next = task.clone();
        next.status = update.status;
        if let Some(progress) = update.progress {
            next.progress = progress;
        }
        if update.fail_reason.is_some() {
            next.fail_reason = update.fail_reason.clone();
        }
        if next.start_time == 0 && update.status == TaskStatus::InProgress {
            next.start_time = now;
        }
        if update.status.is_terminal() {
            next.finish_time = now;
        }
        if let Some(url) = update.result_url {
            let mut private = task.get_private_data()?;
            private.result_url = Some(url);
            next.set_private_data(&private)?;
        }

        if !self.store.update_with_status(&next, expected).await? {
            ldebug!(
                task_id,
                LogStage::Settlement,
                LogComponent::TaskReconciler,
                "cas_lost",
                "任务状态已被其他实例更新, 跳过结算",
                expected = %expected
            );
            return Ok(ReconcileOutcome::LostRace);
        }

        match next.status {
            TaskStatus::Success => {
                let usage = update.usage.unwrap_or_default();
                let settlement = self.settle_on_complete(&next, &usage).await?;
                Ok(ReconcileOutcome::Settled(settlement))
            }
            TaskStatus::Failure => {
                let reason = next.fail_reason.clone().unwrap_or_default();
                let amount = self.settle_on_failure(&next, &reason).await?;
                if amount > 0 {
                    Ok(ReconcileOutcome::Refunded { amount })
                } else {
                    Ok(ReconcileOutcome::Updated)
                }
            }
            _ => Ok(ReconcileOutcome::Updated),
        }
    }

    /// 按冻结的计费上下文结算成功的任务
    pub async fn settle_on_complete(&self, task: &tasks::Model, usage: &Usage) -> Result<TaskSettlement> {
        let private = task.get_private_data()?;
        let Some(context) = private.billing_context.clone() else {
            return Ok(TaskSettlement::Skipped);
        };
        if context.per_call_billing {
            ldebug!(
                task.task_id,
                LogStage::Settlement,
                LogComponent::TaskReconciler,
                "per_call_skip",
                "按次计费任务, 保持提交时的额度",
                quota = task.quota
            );
            return Ok(TaskSettlement::Skipped);
        }

        let actual = match usage.flat_cost {
            Some(cost) => cost.max(0),
            None if usage.total() > 0 => context.quota_for_tokens(usage.total()),
            None => return Ok(TaskSettlement::Skipped),
        };
        let delta = actual - task.quota;
        if delta == 0 {
            return Ok(TaskSettlement::Skipped);
        }

        if !self.apply_delta(task, &private, delta).await? {
            return Ok(TaskSettlement::Skipped);
        }
        self.store.set_quota(task.id, actual).await?;

        let content = if delta > 0 {
            format!("异步任务 {} 补扣额度", task.task_id)
        } else {
            format!("异步任务 {} 退还多扣的额度", task.task_id)
        };
        let entry = self
            .log_entry(task, &private, delta.abs(), *usage, content)
            .await?;
        if delta > 0 {
            self.audit.record_consume_log(&entry).await;
        } else {
            self.audit.record_refund_log(&entry).await;
        }

        linfo!(
            task.task_id,
            LogStage::Settlement,
            LogComponent::TaskReconciler,
            "task_settled",
            "任务差额结算完成",
            pre_consumed = task.quota,
            actual = actual,
            delta = delta,
            source = private.billing_source.as_str()
        );
        Ok(TaskSettlement::Adjusted { actual, delta })
    }

    /// 全额退还失败任务的额度, 返回实际退还的数量
    ///
    /// 没有发生退还时不写日志。
    pub async fn settle_on_failure(&self, task: &tasks::Model, reason: &str) -> Result<i64> {
        if task.quota <= 0 {
            return Ok(0);
        }
        let private = task.get_private_data()?;
        let refunded = match (private.billing_source, private.request_id.as_deref()) {
            (BillingSource::Subscription, Some(request_id)) => {
                self.refund_subscription(task, &private, request_id).await?
            }
            _ => {
                if self.apply_delta(task, &private, -task.quota).await? {
                    task.quota
                } else {
                    0
                }
            }
        };
        if refunded == 0 {
            return Ok(0);
        }

        let entry = self
            .log_entry(task, &private, refunded, Usage::default(), reason.to_string())
            .await?;
        self.audit.record_refund_log(&entry).await;

        linfo!(
            task.task_id,
            LogStage::Settlement,
            LogComponent::TaskReconciler,
            "task_refunded",
            "任务失败, 额度已退还",
            amount = refunded,
            reason = reason
        );
        Ok(refunded)
    }

    /// 按请求 ID 退还订阅预扣; 记录已被清理时按订阅 ID 直接退还
    async fn refund_subscription(
        &self,
        task: &tasks::Model,
        private: &TaskPrivateData,
        request_id: &str,
    ) -> Result<i64> {
        match self.subscriptions.refund(request_id).await? {
            RefundOutcome::Refunded { amount, .. } => Ok(amount),
            RefundOutcome::AlreadyRefunded => {
                lwarn!(
                    task.task_id,
                    LogStage::Settlement,
                    LogComponent::TaskReconciler,
                    "already_refunded",
                    "预扣记录已退款, 跳过",
                    request_id = request_id
                );
                Ok(0)
            }
            RefundOutcome::NotFound => {
                let Some(subscription_id) = private.subscription_id else {
                    lwarn!(
                        task.task_id,
                        LogStage::Settlement,
                        LogComponent::TaskReconciler,
                        "refund_target_missing",
                        "预扣记录与订阅 ID 都缺失, 无法退款",
                        request_id = request_id
                    );
                    return Ok(0);
                };
                self.subscriptions.release(subscription_id, task.quota).await
            }
        }
    }

    /// 把超时未完成的任务置为失败并退款, 返回处理的数量
    pub async fn sweep_timed_out(&self, limit: u64) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let cutoff = now - self.timeout_secs;
        let candidates = self.store.get_timed_out_unfinished(cutoff, limit).await?;

        let mut swept = 0;
        for task in candidates {
            let expected = task.status;
            let mut failed = task.clone();
            failed.status = TaskStatus::Failure;
            failed.progress = "100%".to_string();
            failed.fail_reason = Some(TIMEOUT_REASON.to_string());
            failed.finish_time = now;

            if !self.store.update_with_status(&failed, expected).await? {
                continue;
            }
            swept += 1;
            if let Err(err) = self.settle_on_failure(&failed, TIMEOUT_REASON).await {
                lwarn!(
                    task.task_id,
                    LogStage::BackgroundTask,
                    LogComponent::TaskReconciler,
                    "timeout_refund_failed",
                    "超时任务退款失败",
                    error = %err
                );
            }
        }

        if swept > 0 {
            linfo!(
                "system",
                LogStage::BackgroundTask,
                LogComponent::TaskReconciler,
                "sweep_timed_out",
                "超时任务已处理",
                count = swept
            );
        }
        Ok(swept)
    }

    /// 对任务的扣费来源应用差额, 返回账本是否发生变更
    async fn apply_delta(&self, task: &tasks::Model, private: &TaskPrivateData, delta: i64) -> Result<bool> {
        match private.billing_source {
            BillingSource::Wallet => {
                let token = self.load_token(private.token_id).await?;
                self.quota
                    .post_consume_quota(token.as_ref(), task.user_id, delta)
                    .await?;
                Ok(true)
            }
            BillingSource::Subscription => {
                let adjusted = match (private.request_id.as_deref(), private.subscription_id) {
                    (Some(request_id), subscription_id) => {
                        match self.subscriptions.adjust_pre_consumed(request_id, delta).await {
                            Ok(AdjustOutcome::Adjusted) => Ok(true),
                            Ok(AdjustOutcome::AlreadyRefunded) => Ok(false),
                            // 预扣记录已被清理, 直接调整订阅
                            Ok(AdjustOutcome::NotFound) => match subscription_id {
                                Some(id) => self.subscriptions.post_consume_delta(id, delta).await.map(|()| true),
                                None => Ok(false),
                            },
                            Err(err) => Err(err),
                        }
                    }
                    (None, Some(subscription_id)) => self
                        .subscriptions
                        .post_consume_delta(subscription_id, delta)
                        .await
                        .map(|()| true),
                    (None, None) => Ok(false),
                };
                match adjusted {
                    Ok(changed) => Ok(changed),
                    Err(err) if err.as_billing().is_some_and(BillingError::is_insufficient) => {
                        lwarn!(
                            task.task_id,
                            LogStage::Settlement,
                            LogComponent::TaskReconciler,
                            "subscription_true_up_insufficient",
                            "订阅额度不足以补扣差额, 保持提交时的额度",
                            subscription_id = ?private.subscription_id,
                            delta = delta
                        );
                        Ok(false)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    async fn load_token(&self, token_id: Option<i32>) -> Result<Option<tokens::Model>> {
        let Some(id) = token_id else {
            return Ok(None);
        };
        let token = tokens::Entity::find_by_id(id).one(self.db.as_ref()).await?;
        Ok(token)
    }

    async fn log_entry(
        &self,
        task: &tasks::Model,
        private: &TaskPrivateData,
        quota: i64,
        usage: Usage,
        content: String,
    ) -> Result<AuditLogEntry> {
        let username = users::Entity::find_by_id(task.user_id)
            .one(self.db.as_ref())
            .await?
            .map(|u| u.username)
            .unwrap_or_default();
        let token = self.load_token(private.token_id).await?;
        let model_name = private
            .billing_context
            .as_ref()
            .map(|c| c.model_name.clone())
            .unwrap_or_default();

        Ok(AuditLogEntry {
            user_id: task.user_id,
            username,
            token_id: private.token_id,
            token_name: token.map(|t| t.name).unwrap_or_default(),
            channel_id: Some(task.channel_id),
            group: task.group.clone(),
            model_name,
            request_id: private.request_id.clone(),
            quota,
            usage,
            content,
            other: LogOther {
                billing_source: private.billing_source,
                subscription_id: private.subscription_id,
                per_call: false,
                task_id: Some(task.task_id.clone()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TaskFixture, TokenFixture, UserFixture, create_test_db};
    use entity::logs::{self, LogType};
    use entity::tasks::TaskBillingContext;
    use sea_orm::ActiveModelTrait;

    async fn setup() -> (Arc<DatabaseConnection>, AsyncTaskReconciler, users::Model, tokens::Model) {
        let db = Arc::new(create_test_db().await.unwrap());
        let user = UserFixture::new().quota(10_000).to_active_model().insert(db.as_ref()).await.unwrap();
        let token = TokenFixture::new()
            .user_id(user.id)
            .remain_quota(10_000)
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();
        let quota = Arc::new(QuotaLedger::new(Arc::clone(&db), None, None));
        let subscriptions = Arc::new(SubscriptionLedger::new(Arc::clone(&db)));
        let reconciler = AsyncTaskReconciler::new(Arc::clone(&db), quota, subscriptions, 3600);
        (db, reconciler, user, token)
    }

    #[tokio::test]
    async fn test_token_based_true_up_charges_difference() {
        let (db, reconciler, user, token) = setup().await;
        let context = TaskBillingContext {
            model_name: "video-x".to_string(),
            model_ratio: 2.0,
            group_ratio: 1.0,
            ..Default::default()
        };
        TaskFixture::new("task-tokens", user.id)
            .quota(1000)
            .token_id(token.id)
            .billing_context(context)
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();

        let outcome = reconciler
            .on_status_update("task-tokens", TaskUpdate::success(Some(Usage::tokens(400, 400))))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Settled(TaskSettlement::Adjusted {
                actual: 1600,
                delta: 600
            })
        );

        let user = users::Entity::find_by_id(user.id).one(db.as_ref()).await.unwrap().unwrap();
        assert_eq!(user.quota, 9_400);
        let logs = logs::Entity::find().all(db.as_ref()).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].log_type, LogType::Consume);
        assert_eq!(logs[0].quota, 600);
    }

    #[tokio::test]
    async fn test_terminal_task_is_ignored() {
        let (db, reconciler, user, _token) = setup().await;
        TaskFixture::new("task-done", user.id)
            .status(TaskStatus::Success)
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();
        let outcome = reconciler
            .on_status_update("task-done", TaskUpdate::failure("late"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_sweep_refunds_timed_out_tasks() {
        let (db, reconciler, user, token) = setup().await;
        let now = chrono::Utc::now().timestamp();
        TaskFixture::new("task-old", user.id)
            .quota(800)
            .token_id(token.id)
            .submit_time(now - 7200)
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();
        TaskFixture::new("task-new", user.id)
            .quota(800)
            .submit_time(now)
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();

        assert_eq!(reconciler.sweep_timed_out(100).await.unwrap(), 1);
        assert_eq!(reconciler.sweep_timed_out(100).await.unwrap(), 0);

        let old = reconciler.store().find_by_task_id("task-old").await.unwrap().unwrap();
        assert_eq!(old.status, TaskStatus::Failure);
        assert_eq!(old.fail_reason.as_deref(), Some(TIMEOUT_REASON));
        let user = users::Entity::find_by_id(user.id).one(db.as_ref()).await.unwrap().unwrap();
        assert_eq!(user.quota, 10_800);
        let token = tokens::Entity::find_by_id(token.id).one(db.as_ref()).await.unwrap().unwrap();
        assert_eq!(token.remain_quota, 10_800);
    }

    #[tokio::test]
    async fn test_in_progress_sets_start_time() {
        let (db, reconciler, user, _token) = setup().await;
        TaskFixture::new("task-run", user.id)
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();
        let outcome = reconciler
            .on_status_update("task-run", TaskUpdate::status(TaskStatus::InProgress))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Updated);
        let row = reconciler.store().find_by_task_id("task-run").await.unwrap().unwrap();
        assert!(row.start_time > 0);
    }
}
