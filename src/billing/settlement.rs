//! # 计费结算
//!
//! 一次请求的计费分两步: 转发前按估算值预扣, 完成后按实际用量补扣或退还,
//! 失败则全额退还。会话状态只能从 `Estimated` 前进到 `Applied` 或 `Refunded`,
//! 重复结算直接返回首次的结果。

use std::sync::Arc;

use entity::{tokens, users};
use sea_orm::{DatabaseConnection, EntityTrait};

use super::funding::funding_order;
use super::log::{AuditLogEntry, AuditLogWriter, LogOther};
use crate::error::{BillingError, GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::quota::QuotaLedger;
use crate::subscription::{AdjustOutcome, PreConsumeOutcome, RefundOutcome, SubscriptionLedger};
use crate::types::{BillingSource, RequestId, Usage};
use crate::{linfo, lwarn};

/// 预扣所需的请求信息
#[derive(Debug, Clone)]
pub struct BillingRequest {
    pub request_id: RequestId,
    pub user_id: i32,
    pub token: Option<tokens::Model>,
    pub channel_id: i32,
    pub group: String,
    pub model_name: String,
    /// 预扣估算额度, 缺省时使用配置的默认值
    pub estimate: Option<i64>,
    /// 按次计费, 完成时不做差额结算
    pub per_call: bool,
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Estimated,
    Applied,
    Refunded,
}

/// 结算结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementOutcome {
    pub source: BillingSource,
    pub subscription_id: Option<i32>,
    /// 最终计费额度 (退款时为 0)
    pub charged: i64,
    /// 相对预扣值的差额, 正数为补扣, 负数为退还
    pub delta: i64,
    pub log_written: bool,
}

/// 一次请求的计费会话
#[derive(Debug)]
pub struct BillingSession {
    request: BillingRequest,
    username: String,
    source: BillingSource,
    subscription_id: Option<i32>,
    pre_consumed: i64,
    state: SessionState,
    outcome: Option<SettlementOutcome>,
}

impl BillingSession {
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub const fn source(&self) -> BillingSource {
        self.source
    }

    #[must_use]
    pub const fn subscription_id(&self) -> Option<i32> {
        self.subscription_id
    }

    #[must_use]
    pub const fn pre_consumed(&self) -> i64 {
        self.pre_consumed
    }

    #[must_use]
    pub const fn request(&self) -> &BillingRequest {
        &self.request
    }

    fn log_entry(&self, quota: i64, usage: Usage, content: String) -> AuditLogEntry {
        AuditLogEntry {
            user_id: self.request.user_id,
            username: self.username.clone(),
            token_id: self.request.token.as_ref().map(|t| t.id),
            token_name: self
                .request
                .token
                .as_ref()
                .map(|t| t.name.clone())
                .unwrap_or_default(),
            channel_id: Some(self.request.channel_id),
            group: self.request.group.clone(),
            model_name: self.request.model_name.clone(),
            request_id: Some(self.request.request_id.to_string()),
            quota,
            usage,
            content,
            other: LogOther {
                billing_source: self.source,
                subscription_id: self.subscription_id,
                per_call: self.request.per_call,
                task_id: None,
            },
        }
    }
}

/// 计费结算服务
pub struct BillingSettlement {
    db: Arc<DatabaseConnection>,
    quota: Arc<QuotaLedger>,
    subscriptions: Arc<SubscriptionLedger>,
    audit: AuditLogWriter,
    default_estimate: i64,
}

impl BillingSettlement {
    #[must_use]
    pub fn new(
        db: Arc<DatabaseConnection>,
        quota: Arc<QuotaLedger>,
        subscriptions: Arc<SubscriptionLedger>,
    ) -> Self {
        Self {
            audit: AuditLogWriter::new(Arc::clone(&db)),
            db,
            quota,
            subscriptions,
            default_estimate: 0,
        }
    }

    /// 设置请求未携带估算值时的默认预扣额度
    #[must_use]
    pub const fn with_default_estimate(mut self, estimate: i64) -> Self {
        self.default_estimate = estimate;
        self
    }

    #[must_use]
    pub fn quota(&self) -> &Arc<QuotaLedger> {
        &self.quota
    }

    #[must_use]
    pub fn subscriptions(&self) -> &Arc<SubscriptionLedger> {
        &self.subscriptions
    }

    #[must_use]
    pub const fn audit(&self) -> &AuditLogWriter {
        &self.audit
    }

    /// 选择扣费来源并预扣估算额度
    pub async fn pre_consume(&self, request: BillingRequest) -> Result<BillingSession> {
        let estimate = request.estimate.unwrap_or(self.default_estimate);
        if estimate < 0 {
            return Err(BillingError::NegativeAmount(estimate).into());
        }
        let user = users::Entity::find_by_id(request.user_id)
            .one(self.db.as_ref())
            .await?
            .ok_or(BillingError::UserNotFound(request.user_id))?;

        let preference = user.billing_preference();
        let has_subscription = if preference.allows_subscription() {
            self.subscriptions.has_active_subscription(user.id).await?
        } else {
            false
        };
        let order = funding_order(preference, has_subscription);

        let mut last_err: Option<GatewayError> = None;
        for source in order {
            let attempt = match source {
                BillingSource::Wallet => self
                    .pre_consume_wallet(&request, estimate)
                    .await
                    .map(|()| (None, estimate)),
                BillingSource::Subscription => self
                    .pre_consume_subscription(&request, user.id, estimate)
                    .await
                    .map(|outcome| (Some(outcome.subscription_id), outcome.pre_consumed)),
            };

            match attempt {
                Ok((subscription_id, pre_consumed)) => {
                    linfo!(
                        request.request_id,
                        LogStage::Billing,
                        LogComponent::Billing,
                        "pre_consumed",
                        "预扣完成",
                        user_id = user.id,
                        source = source.as_str(),
                        pre_consumed = pre_consumed,
                        preference = preference.as_str()
                    );
                    return Ok(BillingSession {
                        username: user.username.clone(),
                        source,
                        subscription_id,
                        pre_consumed,
                        state: SessionState::Estimated,
                        outcome: None,
                        request,
                    });
                }
                Err(err) if err.as_billing().is_some_and(BillingError::is_insufficient) => {
                    lwarn!(
                        request.request_id,
                        LogStage::Billing,
                        LogComponent::Billing,
                        "funding_source_insufficient",
                        "扣费来源额度不足",
                        user_id = user.id,
                        source = source.as_str(),
                        error = %err
                    );
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| BillingError::NoActiveSubscription.into()))
    }

    async fn pre_consume_wallet(&self, request: &BillingRequest, estimate: i64) -> Result<()> {
        if estimate == 0 {
            return Ok(());
        }
        let remain = self.quota.get_user_quota(request.user_id).await?;
        if remain < estimate {
            return Err(BillingError::WalletQuotaInsufficient {
                remain,
                required: estimate,
            }
            .into());
        }

        if let Some(token) = &request.token {
            self.quota.pre_consume_token_quota(token, estimate).await?;
        }
        if let Err(err) = self.quota.decrease_user_quota(request.user_id, estimate).await {
            if let Some(token) = &request.token {
                self.quota.increase_token_quota(token.id, &token.key, estimate).await?;
            }
            return Err(err);
        }
        Ok(())
    }

    /// 订阅预扣; 重放到已退款的记录时拒绝, 会话金额以账本记录为准
    async fn pre_consume_subscription(
        &self,
        request: &BillingRequest,
        user_id: i32,
        estimate: i64,
    ) -> Result<PreConsumeOutcome> {
        let outcome = self
            .subscriptions
            .pre_consume(request.request_id.as_str(), user_id, estimate)
            .await?;
        if outcome.refunded {
            return Err(BillingError::PreConsumeRefunded(outcome.request_id).into());
        }
        Ok(outcome)
    }

    /// 请求完成后按实际额度结算
    ///
    /// 按次计费的会话保持预扣值不变。订阅补扣时额度不足, 保留预扣值并记录告警。
    pub async fn settle_on_complete(
        &self,
        session: &mut BillingSession,
        usage: &Usage,
        actual_quota: i64,
    ) -> Result<SettlementOutcome> {
        if let Some(outcome) = &session.outcome {
            return Ok(outcome.clone());
        }

        let mut charged = if session.request.per_call {
            session.pre_consumed
        } else {
            actual_quota.max(0)
        };
        let mut delta = charged - session.pre_consumed;

        match session.source {
            BillingSource::Wallet => {
                if delta != 0 {
                    self.quota
                        .post_consume_quota(session.request.token.as_ref(), session.request.user_id, delta)
                        .await?;
                }
            }
            BillingSource::Subscription => {
                // 即使没有差额也要确认预扣记录仍然有效
                let request_id = session.request.request_id.as_str();
                let adjusted = self.subscriptions.adjust_pre_consumed(request_id, delta).await;
                match adjusted {
                    Ok(AdjustOutcome::Adjusted) => {}
                    Ok(AdjustOutcome::NotFound) => {
                        return Err(BillingError::PreConsumeNotFound(request_id.to_string()).into());
                    }
                    Ok(AdjustOutcome::AlreadyRefunded) => {
                        return Err(BillingError::PreConsumeRefunded(request_id.to_string()).into());
                    }
                    Err(err) if err.as_billing().is_some_and(BillingError::is_insufficient) => {
                        lwarn!(
                            session.request.request_id,
                            LogStage::Settlement,
                            LogComponent::Billing,
                            "subscription_true_up_insufficient",
                            "订阅额度不足以补扣差额, 按预扣值计费",
                            subscription_id = ?session.subscription_id,
                            delta = delta
                        );
                        charged = session.pre_consumed;
                        delta = 0;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        self.quota
            .update_user_used_quota_and_request_count(session.request.user_id, charged)
            .await?;
        self.quota
            .update_channel_used_quota(session.request.channel_id, charged)
            .await?;

        let entry = session.log_entry(charged, *usage, String::new());
        let log_written = self.audit.record_consume_log(&entry).await;

        let outcome = SettlementOutcome {
            source: session.source,
            subscription_id: session.subscription_id,
            charged,
            delta,
            log_written,
        };
        linfo!(
            session.request.request_id,
            LogStage::Settlement,
            LogComponent::Billing,
            "settled",
            "结算完成",
            source = session.source.as_str(),
            pre_consumed = session.pre_consumed,
            charged = charged,
            delta = delta
        );
        session.state = SessionState::Applied;
        session.outcome = Some(outcome.clone());
        Ok(outcome)
    }

    /// 请求失败后全额退还预扣额度
    pub async fn settle_on_failure(&self, session: &mut BillingSession, reason: &str) -> Result<SettlementOutcome> {
        if let Some(outcome) = &session.outcome {
            return Ok(outcome.clone());
        }

        let refund = if session.pre_consumed > 0 {
            match session.source {
                BillingSource::Wallet => {
                    self.quota
                        .post_consume_quota(
                            session.request.token.as_ref(),
                            session.request.user_id,
                            -session.pre_consumed,
                        )
                        .await?;
                    session.pre_consumed
                }
                BillingSource::Subscription => self.refund_subscription(session).await?,
            }
        } else {
            0
        };

        let mut log_written = false;
        if refund > 0 {
            let entry = session.log_entry(refund, Usage::default(), reason.to_string());
            log_written = self.audit.record_refund_log(&entry).await;
        }

        let outcome = SettlementOutcome {
            source: session.source,
            subscription_id: session.subscription_id,
            charged: 0,
            delta: -refund,
            log_written,
        };
        linfo!(
            session.request.request_id,
            LogStage::Settlement,
            LogComponent::Billing,
            "refunded",
            "请求失败, 预扣额度已退还",
            source = session.source.as_str(),
            refund = refund,
            reason = reason
        );
        session.state = SessionState::Refunded;
        session.outcome = Some(outcome.clone());
        Ok(outcome)
    }

    /// 退还订阅预扣, 返回实际退还的数量
    ///
    /// 预扣记录已被清理时按订阅 ID 直接退还; 已被退过款时不再退还。
    async fn refund_subscription(&self, session: &BillingSession) -> Result<i64> {
        let request_id = session.request.request_id.as_str();
        match self.subscriptions.refund(request_id).await? {
            RefundOutcome::Refunded { amount, .. } => Ok(amount),
            RefundOutcome::AlreadyRefunded => {
                lwarn!(
                    request_id,
                    LogStage::Settlement,
                    LogComponent::Billing,
                    "already_refunded",
                    "预扣记录已退款, 跳过",
                    subscription_id = ?session.subscription_id
                );
                Ok(0)
            }
            RefundOutcome::NotFound => match session.subscription_id {
                Some(subscription_id) => {
                    self.subscriptions
                        .release(subscription_id, session.pre_consumed)
                        .await
                }
                None => Ok(0),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PlanFixture, SubscriptionFixture, TokenFixture, UserFixture, create_test_db};
    use crate::types::BillingPreference;
    use entity::logs::{self, LogType};
    use entity::user_subscriptions;
    use pretty_assertions::assert_eq;
    use sea_orm::ActiveModelTrait;

    struct Harness {
        db: Arc<DatabaseConnection>,
        settlement: BillingSettlement,
        user: users::Model,
        token: tokens::Model,
    }

    async fn harness(preference: BillingPreference, wallet: i64) -> Harness {
        let db = Arc::new(create_test_db().await.unwrap());
        let user = UserFixture::new()
            .quota(wallet)
            .billing_preference(preference)
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();
        let token = TokenFixture::new()
            .user_id(user.id)
            .remain_quota(10_000)
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();
        let quota = Arc::new(QuotaLedger::new(Arc::clone(&db), None, None));
        let subscriptions = Arc::new(SubscriptionLedger::new(Arc::clone(&db)));
        Harness {
            settlement: BillingSettlement::new(Arc::clone(&db), quota, subscriptions),
            db,
            user,
            token,
        }
    }

    fn request(h: &Harness, id: &str, estimate: i64) -> BillingRequest {
        BillingRequest {
            request_id: RequestId::new(id).unwrap(),
            user_id: h.user.id,
            token: Some(h.token.clone()),
            channel_id: 1,
            group: "default".to_string(),
            model_name: "gpt-4o".to_string(),
            estimate: Some(estimate),
            per_call: false,
        }
    }

    async fn add_subscription(h: &Harness, total: i64) -> user_subscriptions::Model {
        let plan = PlanFixture::new().to_active_model().insert(h.db.as_ref()).await.unwrap();
        SubscriptionFixture::new(h.user.id, plan.id)
            .amount_total(total)
            .to_active_model()
            .insert(h.db.as_ref())
            .await
            .unwrap()
    }

    async fn wallet(h: &Harness) -> i64 {
        h.settlement.quota().get_user_quota(h.user.id).await.unwrap()
    }

    async fn log_types(h: &Harness) -> Vec<LogType> {
        logs::Entity::find()
            .all(h.db.as_ref())
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.log_type)
            .collect()
    }

    #[tokio::test]
    async fn test_wallet_true_up_and_log() {
        let h = harness(BillingPreference::SubscriptionFirst, 5000).await;
        let mut session = h.settlement.pre_consume(request(&h, "req-w", 1000)).await.unwrap();
        assert_eq!(session.source(), BillingSource::Wallet);
        assert_eq!(wallet(&h).await, 4000);

        let outcome = h
            .settlement
            .settle_on_complete(&mut session, &Usage::tokens(100, 50), 1500)
            .await
            .unwrap();
        assert_eq!(outcome.delta, 500);
        assert_eq!(wallet(&h).await, 3500);
        assert_eq!(
            h.settlement.quota().get_token_remain_quota(h.token.id).await.unwrap(),
            Some(8500)
        );

        // 重复结算返回首次结果, 不再变动账本
        let again = h
            .settlement
            .settle_on_complete(&mut session, &Usage::tokens(100, 50), 9999)
            .await
            .unwrap();
        assert_eq!(again, outcome);
        assert_eq!(wallet(&h).await, 3500);
        assert_eq!(log_types(&h).await, vec![LogType::Consume]);
        assert_eq!(session.state(), SessionState::Applied);
    }

    #[tokio::test]
    async fn test_subscription_first_falls_back_to_wallet() {
        let h = harness(BillingPreference::SubscriptionFirst, 5000).await;
        add_subscription(&h, 100).await;

        let session = h.settlement.pre_consume(request(&h, "req-fb", 500)).await.unwrap();
        assert_eq!(session.source(), BillingSource::Wallet);
        assert_eq!(wallet(&h).await, 4500);

        let session = h.settlement.pre_consume(request(&h, "req-sub", 50)).await.unwrap();
        assert_eq!(session.source(), BillingSource::Subscription);
        assert_eq!(wallet(&h).await, 4500);
    }

    #[tokio::test]
    async fn test_only_preferences_do_not_fall_back() {
        let h = harness(BillingPreference::SubscriptionOnly, 5000).await;
        let err = h.settlement.pre_consume(request(&h, "req-so", 10)).await.unwrap_err();
        assert!(matches!(err.as_billing(), Some(BillingError::NoActiveSubscription)));

        let h = harness(BillingPreference::WalletOnly, 5).await;
        add_subscription(&h, 0).await;
        let err = h.settlement.pre_consume(request(&h, "req-wo", 10)).await.unwrap_err();
        assert!(matches!(
            err.as_billing(),
            Some(BillingError::WalletQuotaInsufficient { remain: 5, required: 10 })
        ));
    }

    #[tokio::test]
    async fn test_failure_refunds_subscription_once() {
        let h = harness(BillingPreference::SubscriptionFirst, 0).await;
        let sub = add_subscription(&h, 1000).await;
        let mut session = h.settlement.pre_consume(request(&h, "req-f", 300)).await.unwrap();
        assert_eq!(session.subscription_id(), Some(sub.id));

        let outcome = h.settlement.settle_on_failure(&mut session, "upstream 502").await.unwrap();
        assert_eq!(outcome.delta, -300);
        h.settlement.settle_on_failure(&mut session, "upstream 502").await.unwrap();

        let row = user_subscriptions::Entity::find_by_id(sub.id)
            .one(h.db.as_ref())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.amount_used, 0);
        assert_eq!(log_types(&h).await, vec![LogType::Refund]);
        assert_eq!(session.state(), SessionState::Refunded);
    }

    #[tokio::test]
    async fn test_failure_without_pre_consume_writes_no_log() {
        let h = harness(BillingPreference::WalletFirst, 100).await;
        let mut session = h.settlement.pre_consume(request(&h, "req-z", 0)).await.unwrap();
        let outcome = h.settlement.settle_on_failure(&mut session, "timeout").await.unwrap();
        assert!(!outcome.log_written);
        assert!(log_types(&h).await.is_empty());
    }

    #[tokio::test]
    async fn test_subscription_true_up_insufficient_keeps_estimate() {
        let h = harness(BillingPreference::SubscriptionFirst, 0).await;
        let sub = add_subscription(&h, 1000).await;
        let mut session = h.settlement.pre_consume(request(&h, "req-t", 900)).await.unwrap();

        let outcome = h
            .settlement
            .settle_on_complete(&mut session, &Usage::tokens(1, 1), 1200)
            .await
            .unwrap();
        assert_eq!(outcome.charged, 900);
        assert_eq!(outcome.delta, 0);
        let row = user_subscriptions::Entity::find_by_id(sub.id)
            .one(h.db.as_ref())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.amount_used, 900);
    }

    #[tokio::test]
    async fn test_per_call_keeps_estimate() {
        let h = harness(BillingPreference::WalletFirst, 5000).await;
        let mut req = request(&h, "req-pc", 700);
        req.per_call = true;
        let mut session = h.settlement.pre_consume(req).await.unwrap();
        let outcome = h
            .settlement
            .settle_on_complete(&mut session, &Usage::flat(100), 100)
            .await
            .unwrap();
        assert_eq!(outcome.charged, 700);
        assert_eq!(wallet(&h).await, 4300);
    }

    #[tokio::test]
    async fn test_replay_after_refund_is_rejected() {
        let h = harness(BillingPreference::SubscriptionOnly, 0).await;
        let sub = add_subscription(&h, 1000).await;
        let mut session = h.settlement.pre_consume(request(&h, "req-retry", 300)).await.unwrap();
        h.settlement.settle_on_failure(&mut session, "upstream 500").await.unwrap();

        let err = h
            .settlement
            .pre_consume(request(&h, "req-retry", 300))
            .await
            .unwrap_err();
        assert!(matches!(err.as_billing(), Some(BillingError::PreConsumeRefunded(_))));

        let row = user_subscriptions::Entity::find_by_id(sub.id)
            .one(h.db.as_ref())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.amount_used, 0);
        assert_eq!(log_types(&h).await, vec![LogType::Refund]);
    }

    #[tokio::test]
    async fn test_complete_after_external_refund_fails() {
        let h = harness(BillingPreference::SubscriptionOnly, 0).await;
        let sub = add_subscription(&h, 1000).await;
        let mut session = h.settlement.pre_consume(request(&h, "req-gone", 300)).await.unwrap();
        h.settlement.subscriptions().refund("req-gone").await.unwrap();

        let err = h
            .settlement
            .settle_on_complete(&mut session, &Usage::tokens(10, 10), 300)
            .await
            .unwrap_err();
        assert!(matches!(err.as_billing(), Some(BillingError::PreConsumeRefunded(_))));
        assert_eq!(session.state(), SessionState::Estimated);

        // 会话仍可退款, 但不会再退第二次
        let outcome = h.settlement.settle_on_failure(&mut session, "abort").await.unwrap();
        assert_eq!(outcome.delta, 0);
        assert!(!outcome.log_written);
        let row = user_subscriptions::Entity::find_by_id(sub.id)
            .one(h.db.as_ref())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.amount_used, 0);
        assert!(log_types(&h).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_estimate_uses_default() {
        let h = harness(BillingPreference::WalletOnly, 5000).await;
        let settlement = BillingSettlement::new(
            Arc::clone(&h.db),
            Arc::clone(h.settlement.quota()),
            Arc::clone(h.settlement.subscriptions()),
        )
        .with_default_estimate(800);
        let mut req = request(&h, "req-default", 0);
        req.estimate = None;

        let session = settlement.pre_consume(req).await.unwrap();
        assert_eq!(session.pre_consumed(), 800);
        assert_eq!(wallet(&h).await, 4200);
    }
}
