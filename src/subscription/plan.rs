//! # 套餐购买与订阅失效
//!
//! 购买时按套餐时长生成订阅并应用升级分组; 订阅失效 (到期或被管理员作废)
//! 时把用户分组回退到升级前的值。回退有保护条件: 用户分组已经被改成别的值时不动。

use entity::subscription_plans;
use entity::user_subscriptions::{self, SubscriptionStatus};
use entity::users;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};

use super::ledger::SubscriptionLedger;
use super::period::{next_reset_time, plan_end_time};
use crate::database::db_now;
use crate::error::{BillingError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{linfo, lwarn};

/// 没有记录升级前分组时回退到的分组
pub const DEFAULT_USER_GROUP: &str = "default";

impl SubscriptionLedger {
    /// 为用户按套餐创建订阅
    pub async fn create_from_plan(
        &self,
        user_id: i32,
        plan_id: i32,
        source: &str,
    ) -> Result<user_subscriptions::Model> {
        let txn = self.db.begin().await?;
        let plan = subscription_plans::Entity::find_by_id(plan_id)
            .one(&txn)
            .await?
            .filter(|p| p.enabled)
            .ok_or(BillingError::PlanUnavailable(plan_id))?;

        if plan.max_purchase_per_user > 0 {
            let purchased = user_subscriptions::Entity::find()
                .filter(user_subscriptions::Column::UserId.eq(user_id))
                .filter(user_subscriptions::Column::PlanId.eq(plan_id))
                .count(&txn)
                .await?;
            if purchased >= u64::try_from(plan.max_purchase_per_user).unwrap_or(u64::MAX) {
                return Err(BillingError::PurchaseLimitReached {
                    limit: plan.max_purchase_per_user,
                }
                .into());
            }
        }

        let user = users::Entity::find_by_id(user_id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or(BillingError::UserNotFound(user_id))?;

        let now = db_now(&txn).await?;
        let end_time = plan_end_time(&plan, now).ok_or(BillingError::PlanUnavailable(plan_id))?;
        let next_reset = next_reset_time(
            now,
            plan.quota_reset_period,
            plan.quota_reset_custom_seconds,
            end_time,
        );

        let upgrade_group = plan.upgrade_group().map(ToString::to_string);
        let prev_user_group = match &upgrade_group {
            Some(group) => {
                let prev = inherited_prev_group(&txn, user_id, now)
                    .await?
                    .unwrap_or_else(|| user.group.clone());
                if user.group != *group {
                    users::Entity::update_many()
                        .col_expr(users::Column::Group, Expr::value(group.clone()))
                        .col_expr(users::Column::UpdatedAt, Expr::current_timestamp().into())
                        .filter(users::Column::Id.eq(user_id))
                        .exec(&txn)
                        .await?;
                }
                Some(prev)
            }
            None => None,
        };

        let sub = user_subscriptions::ActiveModel {
            user_id: Set(user_id),
            plan_id: Set(plan_id),
            amount_total: Set(plan.total_amount),
            amount_used: Set(0),
            start_time: Set(now),
            end_time: Set(end_time),
            status: Set(SubscriptionStatus::Active),
            source: Set(source.to_string()),
            last_reset_time: Set(now),
            next_reset_time: Set(next_reset),
            upgrade_group: Set(upgrade_group.clone()),
            prev_user_group: Set(prev_user_group),
            ..Default::default()
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;

        linfo!(
            "system",
            LogStage::Billing,
            LogComponent::Subscription,
            "subscription_created",
            "订阅已创建",
            user_id = user_id,
            plan_id = plan_id,
            subscription_id = sub.id,
            end_time = end_time,
            upgrade_group = ?upgrade_group
        );
        Ok(sub)
    }

    /// 管理员作废订阅, 返回是否发生了状态变更
    pub async fn admin_invalidate(&self, subscription_id: i32) -> Result<bool> {
        let txn = self.db.begin().await?;
        let sub = user_subscriptions::Entity::find_by_id(subscription_id)
            .one(&txn)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(subscription_id))?;

        if !transition_from_active(&txn, sub.id, SubscriptionStatus::Cancelled).await? {
            txn.commit().await?;
            return Ok(false);
        }
        let now = db_now(&txn).await?;
        revert_user_group(&txn, &sub, now).await?;
        txn.commit().await?;

        linfo!(
            "system",
            LogStage::Billing,
            LogComponent::Subscription,
            "subscription_cancelled",
            "订阅已被管理员作废",
            user_id = sub.user_id,
            subscription_id = sub.id
        );
        Ok(true)
    }
}

/// 用户其他生效中的升级订阅记录的升级前分组
async fn inherited_prev_group<C: ConnectionTrait>(conn: &C, user_id: i32, now: i64) -> Result<Option<String>> {
    let others = user_subscriptions::Entity::find()
        .filter(user_subscriptions::Column::UserId.eq(user_id))
        .filter(user_subscriptions::Column::Status.eq(SubscriptionStatus::Active))
        .filter(user_subscriptions::Column::EndTime.gt(now))
        .filter(user_subscriptions::Column::UpgradeGroup.is_not_null())
        .order_by_asc(user_subscriptions::Column::StartTime)
        .all(conn)
        .await?;
    Ok(others
        .into_iter()
        .filter(|s| s.upgrade_group().is_some())
        .find_map(|s| s.prev_user_group))
}

/// 以 CAS 把订阅从生效状态迁出
pub(super) async fn transition_from_active<C: ConnectionTrait>(
    conn: &C,
    subscription_id: i32,
    target: SubscriptionStatus,
) -> Result<bool> {
    let result = user_subscriptions::Entity::update_many()
        .col_expr(user_subscriptions::Column::Status, Expr::value(target.to_value()))
        .col_expr(user_subscriptions::Column::UpdatedAt, Expr::current_timestamp().into())
        .filter(user_subscriptions::Column::Id.eq(subscription_id))
        .filter(user_subscriptions::Column::Status.eq(SubscriptionStatus::Active))
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

/// 订阅失效后回退用户分组
///
/// 仍有其他生效中的升级订阅时切到其中最新的升级分组, 否则回到升级前的分组。
/// 只有当用户分组仍等于本订阅的升级分组时才会修改。
pub(super) async fn revert_user_group<C: ConnectionTrait>(
    conn: &C,
    sub: &user_subscriptions::Model,
    now: i64,
) -> Result<bool> {
    let Some(upgrade_group) = sub.upgrade_group() else {
        return Ok(false);
    };

    let successor = user_subscriptions::Entity::find()
        .filter(user_subscriptions::Column::UserId.eq(sub.user_id))
        .filter(user_subscriptions::Column::Id.ne(sub.id))
        .filter(user_subscriptions::Column::Status.eq(SubscriptionStatus::Active))
        .filter(user_subscriptions::Column::EndTime.gt(now))
        .filter(user_subscriptions::Column::UpgradeGroup.is_not_null())
        .order_by_desc(user_subscriptions::Column::StartTime)
        .order_by_desc(user_subscriptions::Column::Id)
        .all(conn)
        .await?
        .into_iter()
        .find_map(|s| s.upgrade_group().map(ToString::to_string));

    let target = successor.unwrap_or_else(|| {
        sub.prev_user_group
            .clone()
            .filter(|g| !g.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_USER_GROUP.to_string())
    });
    if target == upgrade_group {
        return Ok(false);
    }

    let result = users::Entity::update_many()
        .col_expr(users::Column::Group, Expr::value(target.clone()))
        .col_expr(users::Column::UpdatedAt, Expr::current_timestamp().into())
        .filter(users::Column::Id.eq(sub.user_id))
        .filter(users::Column::Group.eq(upgrade_group))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        lwarn!(
            "system",
            LogStage::Billing,
            LogComponent::Subscription,
            "group_revert_skipped",
            "用户分组已被修改, 跳过回退",
            user_id = sub.user_id,
            subscription_id = sub.id,
            upgrade_group = upgrade_group
        );
        return Ok(false);
    }

    linfo!(
        "system",
        LogStage::Billing,
        LogComponent::Subscription,
        "group_reverted",
        "用户分组已回退",
        user_id = sub.user_id,
        subscription_id = sub.id,
        group = %target
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PlanFixture, UserFixture, create_test_db};
    use entity::subscription_plans::{DurationUnit, ResetPeriod};
    use std::sync::Arc;

    async fn user_group(db: &sea_orm::DatabaseConnection, id: i32) -> String {
        users::Entity::find_by_id(id).one(db).await.unwrap().unwrap().group
    }

    #[tokio::test]
    async fn test_create_from_plan_sets_times_and_group() {
        let db = Arc::new(create_test_db().await.unwrap());
        let user = UserFixture::new().group("default").to_active_model().insert(db.as_ref()).await.unwrap();
        let plan = PlanFixture::new()
            .total_amount(5000)
            .duration(DurationUnit::Day, 30)
            .reset_period(ResetPeriod::Daily)
            .upgrade_group("vip")
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();

        let ledger = SubscriptionLedger::new(Arc::clone(&db));
        let sub = ledger.create_from_plan(user.id, plan.id, "order").await.unwrap();
        assert_eq!(sub.end_time - sub.start_time, 30 * 86_400);
        assert!(sub.next_reset_time > sub.start_time);
        assert!(sub.next_reset_time - sub.start_time <= 86_400);
        assert_eq!(sub.amount_total, 5000);
        assert_eq!(sub.prev_user_group.as_deref(), Some("default"));
        assert_eq!(user_group(db.as_ref(), user.id).await, "vip");

        assert!(ledger.admin_invalidate(sub.id).await.unwrap());
        assert!(!ledger.admin_invalidate(sub.id).await.unwrap());
        assert_eq!(user_group(db.as_ref(), user.id).await, "default");
    }

    #[tokio::test]
    async fn test_purchase_limit_and_disabled_plan() {
        let db = Arc::new(create_test_db().await.unwrap());
        let user = UserFixture::new().to_active_model().insert(db.as_ref()).await.unwrap();
        let limited = PlanFixture::new()
            .max_purchase(1)
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();
        let disabled = PlanFixture::new()
            .enabled(false)
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();

        let ledger = SubscriptionLedger::new(Arc::clone(&db));
        ledger.create_from_plan(user.id, limited.id, "order").await.unwrap();
        let err = ledger.create_from_plan(user.id, limited.id, "order").await.unwrap_err();
        assert!(matches!(
            err.as_billing(),
            Some(BillingError::PurchaseLimitReached { limit: 1 })
        ));

        let err = ledger.create_from_plan(user.id, disabled.id, "order").await.unwrap_err();
        assert!(matches!(err.as_billing(), Some(BillingError::PlanUnavailable(_))));
    }

    #[tokio::test]
    async fn test_revert_skipped_when_group_changed_manually() {
        let db = Arc::new(create_test_db().await.unwrap());
        let user = UserFixture::new().group("default").to_active_model().insert(db.as_ref()).await.unwrap();
        let plan = PlanFixture::new()
            .upgrade_group("vip")
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();
        let ledger = SubscriptionLedger::new(Arc::clone(&db));
        let sub = ledger.create_from_plan(user.id, plan.id, "order").await.unwrap();

        users::Entity::update_many()
            .col_expr(users::Column::Group, Expr::value("svip"))
            .filter(users::Column::Id.eq(user.id))
            .exec(db.as_ref())
            .await
            .unwrap();

        assert!(ledger.admin_invalidate(sub.id).await.unwrap());
        assert_eq!(user_group(db.as_ref(), user.id).await, "svip");
    }

    #[tokio::test]
    async fn test_stacked_upgrades_keep_original_group() {
        let db = Arc::new(create_test_db().await.unwrap());
        let user = UserFixture::new().group("default").to_active_model().insert(db.as_ref()).await.unwrap();
        let vip = PlanFixture::new().upgrade_group("vip").to_active_model().insert(db.as_ref()).await.unwrap();
        let svip = PlanFixture::new().upgrade_group("svip").to_active_model().insert(db.as_ref()).await.unwrap();
        let ledger = SubscriptionLedger::new(Arc::clone(&db));

        let first = ledger.create_from_plan(user.id, vip.id, "order").await.unwrap();
        let second = ledger.create_from_plan(user.id, svip.id, "order").await.unwrap();
        assert_eq!(second.prev_user_group.as_deref(), Some("default"));
        assert_eq!(user_group(db.as_ref(), user.id).await, "svip");

        // 先作废较新的订阅, 分组回到仍生效的 vip
        ledger.admin_invalidate(second.id).await.unwrap();
        assert_eq!(user_group(db.as_ref(), user.id).await, "vip");
        ledger.admin_invalidate(first.id).await.unwrap();
        assert_eq!(user_group(db.as_ref(), user.id).await, "default");
    }
}
