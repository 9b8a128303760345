//! # 订阅账本
//!
//! 订阅额度的预扣、退款与结算调整。所有变更都在一个数据库事务内完成,
//! 先锁定订阅行再修改; 预扣记录按请求 ID 唯一, 重复调用直接返回首次结果。

use std::sync::Arc;

use entity::subscription_plans::{self, ResetPeriod};
use entity::subscription_pre_consume_records::{self as records, PreConsumeStatus};
use entity::user_subscriptions::{self, SubscriptionStatus};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ActiveValue::Set, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection,
    DbErr, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, SqlErr,
    TransactionTrait,
};

use super::period::catch_up;
use crate::database::db_now;
use crate::error::{BillingError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo, lwarn};

/// 预扣结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreConsumeOutcome {
    pub request_id: String,
    pub subscription_id: i32,
    pub pre_consumed: i64,
    /// 同一请求 ID 的重复调用, 没有发生新的扣减
    pub replayed: bool,
    /// 记录已经退款
    pub refunded: bool,
}

impl PreConsumeOutcome {
    fn from_record(record: &records::Model, replayed: bool) -> Self {
        Self {
            request_id: record.request_id.clone(),
            subscription_id: record.user_subscription_id,
            pre_consumed: record.pre_consumed,
            replayed,
            refunded: record.status == PreConsumeStatus::Refunded,
        }
    }
}

/// 退款结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded { subscription_id: i32, amount: i64 },
    AlreadyRefunded,
    NotFound,
}

/// 预扣金额调整结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustOutcome {
    Adjusted,
    AlreadyRefunded,
    NotFound,
}

/// 订阅账本
pub struct SubscriptionLedger {
    pub(super) db: Arc<DatabaseConnection>,
}

impl SubscriptionLedger {
    #[must_use]
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// 按请求 ID 幂等地预扣订阅额度
    ///
    /// 按结束时间最早优先, 扣在第一个余额足够的订阅上; 扣减前先补做到期的重置。
    pub async fn pre_consume(&self, request_id: &str, user_id: i32, amount: i64) -> Result<PreConsumeOutcome> {
        let request_id = request_id.trim();
        if request_id.is_empty() {
            return Err(BillingError::EmptyRequestId.into());
        }
        if amount < 0 {
            return Err(BillingError::NegativeAmount(amount).into());
        }

        let txn = self.db.begin().await?;
        if let Some(record) = find_record(&txn, request_id).await? {
            txn.commit().await?;
            ldebug!(
                request_id,
                LogStage::Billing,
                LogComponent::Subscription,
                "pre_consume_replayed",
                "重复的预扣请求, 返回首次结果",
                subscription_id = record.user_subscription_id
            );
            return Ok(PreConsumeOutcome::from_record(&record, true));
        }

        let now = db_now(&txn).await?;
        let candidates = user_subscriptions::Entity::find()
            .filter(user_subscriptions::Column::UserId.eq(user_id))
            .filter(user_subscriptions::Column::Status.eq(SubscriptionStatus::Active))
            .filter(user_subscriptions::Column::EndTime.gt(now))
            .order_by_asc(user_subscriptions::Column::EndTime)
            .order_by_asc(user_subscriptions::Column::Id)
            .lock_exclusive()
            .all(&txn)
            .await?;
        if candidates.is_empty() {
            return Err(BillingError::NoActiveSubscription.into());
        }

        let mut chosen = None;
        for sub in candidates {
            let (sub, _) = apply_lazy_reset(&txn, sub, now).await?;
            if !sub.can_afford(amount) {
                continue;
            }
            let result = user_subscriptions::Entity::update_many()
                .col_expr(
                    user_subscriptions::Column::AmountUsed,
                    Expr::col(user_subscriptions::Column::AmountUsed).add(amount),
                )
                .col_expr(user_subscriptions::Column::UpdatedAt, Expr::current_timestamp().into())
                .filter(user_subscriptions::Column::Id.eq(sub.id))
                .filter(
                    Condition::any()
                        .add(user_subscriptions::Column::AmountTotal.eq(0))
                        .add(
                            Expr::expr(Expr::col(user_subscriptions::Column::AmountUsed).add(amount))
                                .lte(Expr::col(user_subscriptions::Column::AmountTotal)),
                        ),
                )
                .exec(&txn)
                .await?;
            if result.rows_affected == 1 {
                chosen = Some(sub);
                break;
            }
        }

        let Some(sub) = chosen else {
            return Err(BillingError::SubscriptionQuotaInsufficient.into());
        };

        let inserted = records::ActiveModel {
            request_id: Set(request_id.to_string()),
            user_id: Set(user_id),
            user_subscription_id: Set(sub.id),
            pre_consumed: Set(amount),
            status: Set(PreConsumeStatus::Consumed),
            ..Default::default()
        }
        .insert(&txn)
        .await;

        match inserted {
            Ok(record) => {
                txn.commit().await?;
                linfo!(
                    request_id,
                    LogStage::Billing,
                    LogComponent::Subscription,
                    "pre_consumed",
                    "订阅额度预扣成功",
                    user_id = user_id,
                    subscription_id = sub.id,
                    amount = amount
                );
                Ok(PreConsumeOutcome::from_record(&record, false))
            }
            Err(err) if is_unique_violation(&err) => {
                // 并发的同一请求先一步写入, 放弃本次扣减
                txn.rollback().await?;
                let record = find_record(self.db.as_ref(), request_id)
                    .await?
                    .ok_or(err)?;
                Ok(PreConsumeOutcome::from_record(&record, true))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// 按请求 ID 幂等地退还预扣额度
    pub async fn refund(&self, request_id: &str) -> Result<RefundOutcome> {
        let request_id = request_id.trim();
        if request_id.is_empty() {
            return Err(BillingError::EmptyRequestId.into());
        }

        let txn = self.db.begin().await?;
        let Some(record) = find_record(&txn, request_id).await? else {
            txn.commit().await?;
            return Ok(RefundOutcome::NotFound);
        };
        if record.status == PreConsumeStatus::Refunded {
            txn.commit().await?;
            return Ok(RefundOutcome::AlreadyRefunded);
        }

        let flipped = records::Entity::update_many()
            .col_expr(records::Column::Status, Expr::value(PreConsumeStatus::Refunded.to_value()))
            .col_expr(records::Column::UpdatedAt, Expr::current_timestamp().into())
            .filter(records::Column::Id.eq(record.id))
            .filter(records::Column::Status.eq(PreConsumeStatus::Consumed))
            .exec(&txn)
            .await?;
        if flipped.rows_affected == 0 {
            txn.commit().await?;
            return Ok(RefundOutcome::AlreadyRefunded);
        }

        if record.pre_consumed > 0 {
            release_amount(&txn, record.user_subscription_id, record.pre_consumed).await?;
        }
        txn.commit().await?;

        linfo!(
            request_id,
            LogStage::Billing,
            LogComponent::Subscription,
            "refunded",
            "订阅预扣额度已退还",
            subscription_id = record.user_subscription_id,
            amount = record.pre_consumed
        );
        Ok(RefundOutcome::Refunded {
            subscription_id: record.user_subscription_id,
            amount: record.pre_consumed,
        })
    }

    /// 对订阅做结算差额调整; 正数扣费, 负数退还 (已用额度不低于 0)
    pub async fn post_consume_delta(&self, subscription_id: i32, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let txn = self.db.begin().await?;
        apply_delta(&txn, subscription_id, delta).await?;
        txn.commit().await?;

        ldebug!(
            "system",
            LogStage::Settlement,
            LogComponent::Subscription,
            "post_consume_delta",
            "订阅额度差额已结算",
            subscription_id = subscription_id,
            delta = delta
        );
        Ok(())
    }

    /// 调整某次预扣的金额, 预扣记录与订阅额度在同一事务内变更
    ///
    /// 之后的退款按调整后的金额退还。记录不存在或已退款时不做任何变更。
    pub async fn adjust_pre_consumed(&self, request_id: &str, delta: i64) -> Result<AdjustOutcome> {
        let txn = self.db.begin().await?;
        let Some(record) = find_record(&txn, request_id.trim()).await? else {
            txn.commit().await?;
            return Ok(AdjustOutcome::NotFound);
        };
        if record.status == PreConsumeStatus::Refunded {
            txn.commit().await?;
            lwarn!(
                request_id,
                LogStage::Settlement,
                LogComponent::Subscription,
                "adjust_after_refund",
                "预扣记录已退款, 忽略差额调整",
                delta = delta
            );
            return Ok(AdjustOutcome::AlreadyRefunded);
        }
        if delta == 0 {
            txn.commit().await?;
            return Ok(AdjustOutcome::Adjusted);
        }

        apply_delta(&txn, record.user_subscription_id, delta).await?;
        records::Entity::update_many()
            .col_expr(
                records::Column::PreConsumed,
                Expr::col(records::Column::PreConsumed).add(delta),
            )
            .col_expr(records::Column::UpdatedAt, Expr::current_timestamp().into())
            .filter(records::Column::Id.eq(record.id))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(AdjustOutcome::Adjusted)
    }

    /// 直接退还订阅额度, 已用额度不低于 0
    ///
    /// 用于预扣记录已被清理、只剩订阅 ID 的情况, 返回实际退还的数量。
    pub async fn release(&self, subscription_id: i32, amount: i64) -> Result<i64> {
        if amount <= 0 {
            return Ok(0);
        }
        let txn = self.db.begin().await?;
        let sub = lock_subscription(&txn, subscription_id).await?;
        let released = amount.min(sub.amount_used.max(0));
        write_amount_used(&txn, subscription_id, sub.amount_used - released).await?;
        txn.commit().await?;

        linfo!(
            "system",
            LogStage::Settlement,
            LogComponent::Subscription,
            "released",
            "订阅额度已直接退还",
            subscription_id = subscription_id,
            amount = released
        );
        Ok(released)
    }

    /// 预扣记录
    pub async fn find_pre_consume_record(&self, request_id: &str) -> Result<Option<records::Model>> {
        find_record(self.db.as_ref(), request_id.trim()).await
    }

    /// 用户当前是否有生效中的订阅
    pub async fn has_active_subscription(&self, user_id: i32) -> Result<bool> {
        let now = db_now(self.db.as_ref()).await?;
        let count = active_query(user_id, now).count(self.db.as_ref()).await?;
        Ok(count > 0)
    }

    /// 用户生效中的订阅, 按结束时间升序
    pub async fn active_subscriptions(&self, user_id: i32) -> Result<Vec<user_subscriptions::Model>> {
        let now = db_now(self.db.as_ref()).await?;
        let subs = active_query(user_id, now)
            .order_by_asc(user_subscriptions::Column::EndTime)
            .order_by_asc(user_subscriptions::Column::Id)
            .all(self.db.as_ref())
            .await?;
        Ok(subs)
    }
}

fn active_query(user_id: i32, now: i64) -> sea_orm::Select<user_subscriptions::Entity> {
    user_subscriptions::Entity::find()
        .filter(user_subscriptions::Column::UserId.eq(user_id))
        .filter(user_subscriptions::Column::Status.eq(SubscriptionStatus::Active))
        .filter(user_subscriptions::Column::EndTime.gt(now))
}

async fn find_record<C: ConnectionTrait>(conn: &C, request_id: &str) -> Result<Option<records::Model>> {
    let record = records::Entity::find()
        .filter(records::Column::RequestId.eq(request_id))
        .one(conn)
        .await?;
    Ok(record)
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

async fn lock_subscription<C: ConnectionTrait>(conn: &C, subscription_id: i32) -> Result<user_subscriptions::Model> {
    let sub = user_subscriptions::Entity::find_by_id(subscription_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or(BillingError::SubscriptionNotFound(subscription_id))?;
    Ok(sub)
}

async fn write_amount_used<C: ConnectionTrait>(conn: &C, subscription_id: i32, used: i64) -> Result<()> {
    user_subscriptions::Entity::update_many()
        .col_expr(user_subscriptions::Column::AmountUsed, Expr::value(used))
        .col_expr(user_subscriptions::Column::UpdatedAt, Expr::current_timestamp().into())
        .filter(user_subscriptions::Column::Id.eq(subscription_id))
        .exec(conn)
        .await?;
    Ok(())
}

/// 退还额度, 已用额度不低于 0
async fn release_amount<C: ConnectionTrait>(conn: &C, subscription_id: i32, amount: i64) -> Result<()> {
    let sub = lock_subscription(conn, subscription_id).await?;
    write_amount_used(conn, subscription_id, (sub.amount_used - amount).max(0)).await
}

async fn apply_delta<C: ConnectionTrait>(conn: &C, subscription_id: i32, delta: i64) -> Result<()> {
    if delta < 0 {
        return release_amount(conn, subscription_id, -delta).await;
    }
    let sub = lock_subscription(conn, subscription_id).await?;
    if !sub.can_afford(delta) {
        return Err(BillingError::SubscriptionQuotaInsufficient.into());
    }
    write_amount_used(conn, subscription_id, sub.amount_used + delta).await
}

/// 到达重置边界时清零已用额度并推进边界, 返回 (订阅, 是否发生重置)
pub(super) async fn apply_lazy_reset<C: ConnectionTrait>(
    conn: &C,
    sub: user_subscriptions::Model,
    now: i64,
) -> Result<(user_subscriptions::Model, bool)> {
    if sub.next_reset_time <= 0 || sub.next_reset_time > now {
        return Ok((sub, false));
    }

    let plan = subscription_plans::Entity::find_by_id(sub.plan_id).one(conn).await?;
    let (period, custom_seconds) = plan.map_or((ResetPeriod::Never, 0), |p| {
        (p.quota_reset_period, p.quota_reset_custom_seconds)
    });
    let Some((last, next)) = catch_up(sub.next_reset_time, period, custom_seconds, sub.end_time, now) else {
        return Ok((sub, false));
    };

    let result = user_subscriptions::Entity::update_many()
        .col_expr(user_subscriptions::Column::AmountUsed, Expr::value(0_i64))
        .col_expr(user_subscriptions::Column::LastResetTime, Expr::value(last))
        .col_expr(user_subscriptions::Column::NextResetTime, Expr::value(next))
        .col_expr(user_subscriptions::Column::UpdatedAt, Expr::current_timestamp().into())
        .filter(user_subscriptions::Column::Id.eq(sub.id))
        .filter(user_subscriptions::Column::NextResetTime.eq(sub.next_reset_time))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        // 其他实例已完成重置
        let fresh = user_subscriptions::Entity::find_by_id(sub.id)
            .one(conn)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(sub.id))?;
        return Ok((fresh, false));
    }

    ldebug!(
        "system",
        LogStage::Billing,
        LogComponent::Subscription,
        "quota_reset",
        "订阅额度已重置",
        subscription_id = sub.id,
        last_reset_time = last,
        next_reset_time = next
    );
    Ok((
        user_subscriptions::Model {
            amount_used: 0,
            last_reset_time: last,
            next_reset_time: next,
            ..sub
        },
        true,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PlanFixture, SubscriptionFixture, UserFixture, create_test_db};
    use pretty_assertions::assert_eq;

    struct Setup {
        db: Arc<DatabaseConnection>,
        ledger: SubscriptionLedger,
        user_id: i32,
        plan_id: i32,
    }

    async fn setup() -> Setup {
        let db = Arc::new(create_test_db().await.unwrap());
        let user = UserFixture::new().to_active_model().insert(db.as_ref()).await.unwrap();
        let plan = PlanFixture::new().to_active_model().insert(db.as_ref()).await.unwrap();
        Setup {
            ledger: SubscriptionLedger::new(Arc::clone(&db)),
            db,
            user_id: user.id,
            plan_id: plan.id,
        }
    }

    async fn used(db: &DatabaseConnection, id: i32) -> i64 {
        user_subscriptions::Entity::find_by_id(id)
            .one(db)
            .await
            .unwrap()
            .unwrap()
            .amount_used
    }

    #[tokio::test]
    async fn test_pre_consume_picks_soonest_affordable() {
        let s = setup().await;
        let now = chrono::Utc::now().timestamp();
        let soon = SubscriptionFixture::new(s.user_id, s.plan_id)
            .amount_total(100)
            .amount_used(90)
            .end_time(now + 3600)
            .to_active_model()
            .insert(s.db.as_ref())
            .await
            .unwrap();
        let later = SubscriptionFixture::new(s.user_id, s.plan_id)
            .amount_total(1000)
            .end_time(now + 7200)
            .to_active_model()
            .insert(s.db.as_ref())
            .await
            .unwrap();

        let small = s.ledger.pre_consume("req-1", s.user_id, 10).await.unwrap();
        assert_eq!(small.subscription_id, soon.id);
        let big = s.ledger.pre_consume("req-2", s.user_id, 50).await.unwrap();
        assert_eq!(big.subscription_id, later.id);
        assert_eq!(used(s.db.as_ref(), soon.id).await, 100);
        assert_eq!(used(s.db.as_ref(), later.id).await, 50);
    }

    #[tokio::test]
    async fn test_pre_consume_is_idempotent() {
        let s = setup().await;
        let sub = SubscriptionFixture::new(s.user_id, s.plan_id)
            .amount_total(1000)
            .to_active_model()
            .insert(s.db.as_ref())
            .await
            .unwrap();

        let first = s.ledger.pre_consume("req-dup", s.user_id, 300).await.unwrap();
        let second = s.ledger.pre_consume("req-dup", s.user_id, 300).await.unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.subscription_id, first.subscription_id);
        assert_eq!(used(s.db.as_ref(), sub.id).await, 300);
    }

    #[tokio::test]
    async fn test_pre_consume_insufficient_and_no_subscription() {
        let s = setup().await;
        let err = s.ledger.pre_consume("req-none", s.user_id, 1).await.unwrap_err();
        assert!(matches!(err.as_billing(), Some(BillingError::NoActiveSubscription)));

        SubscriptionFixture::new(s.user_id, s.plan_id)
            .amount_total(100)
            .to_active_model()
            .insert(s.db.as_ref())
            .await
            .unwrap();
        let err = s.ledger.pre_consume("req-big", s.user_id, 101).await.unwrap_err();
        assert!(matches!(
            err.as_billing(),
            Some(BillingError::SubscriptionQuotaInsufficient)
        ));
        assert!(s.ledger.find_pre_consume_record("req-big").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unlimited_subscription_always_affords() {
        let s = setup().await;
        SubscriptionFixture::new(s.user_id, s.plan_id)
            .amount_total(0)
            .to_active_model()
            .insert(s.db.as_ref())
            .await
            .unwrap();
        let outcome = s.ledger.pre_consume("req-u", s.user_id, 1_000_000).await.unwrap();
        assert_eq!(outcome.pre_consumed, 1_000_000);
    }

    #[tokio::test]
    async fn test_refund_is_idempotent_and_floored() {
        let s = setup().await;
        let sub = SubscriptionFixture::new(s.user_id, s.plan_id)
            .amount_total(1000)
            .to_active_model()
            .insert(s.db.as_ref())
            .await
            .unwrap();
        s.ledger.pre_consume("req-r", s.user_id, 400).await.unwrap();

        // 期间发生了重置, 退款不会把已用额度变成负数
        write_amount_used(s.db.as_ref(), sub.id, 100).await.unwrap();

        assert_eq!(
            s.ledger.refund("req-r").await.unwrap(),
            RefundOutcome::Refunded {
                subscription_id: sub.id,
                amount: 400
            }
        );
        assert_eq!(s.ledger.refund("req-r").await.unwrap(), RefundOutcome::AlreadyRefunded);
        assert_eq!(s.ledger.refund("req-missing").await.unwrap(), RefundOutcome::NotFound);
        assert_eq!(used(s.db.as_ref(), sub.id).await, 0);
    }

    #[tokio::test]
    async fn test_lazy_reset_before_debit() {
        let s = setup().await;
        let now = chrono::Utc::now().timestamp();
        let sub = SubscriptionFixture::new(s.user_id, s.plan_id)
            .amount_total(100)
            .amount_used(100)
            .next_reset_time(now - 10)
            .to_active_model()
            .insert(s.db.as_ref())
            .await
            .unwrap();

        s.ledger.pre_consume("req-reset", s.user_id, 30).await.unwrap();
        let row = user_subscriptions::Entity::find_by_id(sub.id)
            .one(s.db.as_ref())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.amount_used, 30);
        assert!(row.last_reset_time >= now - 10);
    }

    #[tokio::test]
    async fn test_post_consume_delta_respects_total() {
        let s = setup().await;
        let sub = SubscriptionFixture::new(s.user_id, s.plan_id)
            .amount_total(100)
            .amount_used(80)
            .to_active_model()
            .insert(s.db.as_ref())
            .await
            .unwrap();

        let err = s.ledger.post_consume_delta(sub.id, 30).await.unwrap_err();
        assert!(err.as_billing().is_some_and(BillingError::is_insufficient));
        s.ledger.post_consume_delta(sub.id, 20).await.unwrap();
        assert_eq!(used(s.db.as_ref(), sub.id).await, 100);
        s.ledger.post_consume_delta(sub.id, -500).await.unwrap();
        assert_eq!(used(s.db.as_ref(), sub.id).await, 0);
    }

    #[tokio::test]
    async fn test_adjust_pre_consumed_changes_later_refund() {
        let s = setup().await;
        let sub = SubscriptionFixture::new(s.user_id, s.plan_id)
            .amount_total(1000)
            .to_active_model()
            .insert(s.db.as_ref())
            .await
            .unwrap();
        s.ledger.pre_consume("req-adj", s.user_id, 100).await.unwrap();
        assert_eq!(
            s.ledger.adjust_pre_consumed("req-adj", 50).await.unwrap(),
            AdjustOutcome::Adjusted
        );
        assert_eq!(used(s.db.as_ref(), sub.id).await, 150);

        assert_eq!(
            s.ledger.refund("req-adj").await.unwrap(),
            RefundOutcome::Refunded {
                subscription_id: sub.id,
                amount: 150
            }
        );
        assert_eq!(
            s.ledger.adjust_pre_consumed("req-adj", 10).await.unwrap(),
            AdjustOutcome::AlreadyRefunded
        );
        assert_eq!(
            s.ledger.adjust_pre_consumed("req-none", 10).await.unwrap(),
            AdjustOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_release_is_floored_at_used_amount() {
        let s = setup().await;
        let sub = SubscriptionFixture::new(s.user_id, s.plan_id)
            .amount_total(1000)
            .amount_used(300)
            .to_active_model()
            .insert(s.db.as_ref())
            .await
            .unwrap();

        assert_eq!(s.ledger.release(sub.id, 200).await.unwrap(), 200);
        assert_eq!(used(s.db.as_ref(), sub.id).await, 100);
        assert_eq!(s.ledger.release(sub.id, 500).await.unwrap(), 100);
        assert_eq!(used(s.db.as_ref(), sub.id).await, 0);
        assert_eq!(s.ledger.release(sub.id, 50).await.unwrap(), 0);
    }
}
