//! # 订阅后台维护
//!
//! 周期任务调用的批量操作: 到期重置、到期失效、清理旧的预扣记录。
//! 每条订阅在自己的事务内处理, 单条失败不影响同批其他订阅。

use entity::subscription_pre_consume_records as records;
use entity::user_subscriptions::{self, SubscriptionStatus};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect, TransactionTrait};

use super::ledger::{SubscriptionLedger, apply_lazy_reset};
use super::plan::{revert_user_group, transition_from_active};
use crate::database::db_now;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo, lwarn};

impl SubscriptionLedger {
    /// 重置已到达重置边界的订阅, 返回实际重置的数量
    pub async fn reset_due(&self, limit: u64) -> Result<usize> {
        let now = db_now(self.db.as_ref()).await?;
        let due = user_subscriptions::Entity::find()
            .filter(user_subscriptions::Column::Status.eq(SubscriptionStatus::Active))
            .filter(user_subscriptions::Column::NextResetTime.gt(0))
            .filter(user_subscriptions::Column::NextResetTime.lte(now))
            .filter(user_subscriptions::Column::EndTime.gt(now))
            .order_by_asc(user_subscriptions::Column::NextResetTime)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;

        let mut reset = 0;
        for sub in due {
            let id = sub.id;
            let txn = self.db.begin().await?;
            match apply_lazy_reset(&txn, sub, now).await {
                Ok((_, changed)) => {
                    txn.commit().await?;
                    if changed {
                        reset += 1;
                    }
                }
                Err(err) => lwarn!(
                    "system",
                    LogStage::BackgroundTask,
                    LogComponent::Subscription,
                    "reset_failed",
                    "订阅额度重置失败",
                    subscription_id = id,
                    error = %err
                ),
            }
        }

        if reset > 0 {
            linfo!(
                "system",
                LogStage::BackgroundTask,
                LogComponent::Subscription,
                "reset_due",
                "到期订阅额度已重置",
                count = reset
            );
        }
        Ok(reset)
    }

    /// 把已过结束时间的订阅置为过期并回退分组, 返回处理的数量
    pub async fn expire_due(&self, limit: u64) -> Result<usize> {
        let now = db_now(self.db.as_ref()).await?;
        let due = user_subscriptions::Entity::find()
            .filter(user_subscriptions::Column::Status.eq(SubscriptionStatus::Active))
            .filter(user_subscriptions::Column::EndTime.lte(now))
            .order_by_asc(user_subscriptions::Column::EndTime)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;

        let mut expired = 0;
        for sub in due {
            let txn = self.db.begin().await?;
            if !transition_from_active(&txn, sub.id, SubscriptionStatus::Expired).await? {
                txn.commit().await?;
                continue;
            }
            if let Err(err) = revert_user_group(&txn, &sub, now).await {
                lwarn!(
                    "system",
                    LogStage::BackgroundTask,
                    LogComponent::Subscription,
                    "expire_revert_failed",
                    "订阅过期后分组回退失败",
                    subscription_id = sub.id,
                    error = %err
                );
                continue;
            }
            txn.commit().await?;
            expired += 1;
        }

        if expired > 0 {
            linfo!(
                "system",
                LogStage::BackgroundTask,
                LogComponent::Subscription,
                "expire_due",
                "到期订阅已失效",
                count = expired
            );
        }
        Ok(expired)
    }

    /// 删除早于 `older_than_secs` 秒前创建的预扣记录
    pub async fn cleanup_pre_consume_records(&self, older_than_secs: i64) -> Result<u64> {
        let now = db_now(self.db.as_ref()).await?;
        let Some(cutoff) = chrono::DateTime::from_timestamp(now - older_than_secs.max(0), 0) else {
            return Ok(0);
        };
        let result = records::Entity::delete_many()
            .filter(records::Column::CreatedAt.lt(cutoff.naive_utc()))
            .exec(self.db.as_ref())
            .await?;

        ldebug!(
            "system",
            LogStage::BackgroundTask,
            LogComponent::Subscription,
            "cleanup_pre_consume_records",
            "旧预扣记录已清理",
            deleted = result.rows_affected
        );
        Ok(result.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PlanFixture, SubscriptionFixture, UserFixture, create_test_db};
    use entity::users;
    use sea_orm::ActiveModelTrait;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_expire_due_reverts_group_once() {
        let db = Arc::new(create_test_db().await.unwrap());
        let user = UserFixture::new().group("vip").to_active_model().insert(db.as_ref()).await.unwrap();
        let plan = PlanFixture::new().to_active_model().insert(db.as_ref()).await.unwrap();
        let now = chrono::Utc::now().timestamp();
        SubscriptionFixture::new(user.id, plan.id)
            .end_time(now - 5)
            .upgrade(Some("vip"), Some("default"))
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();

        let ledger = SubscriptionLedger::new(Arc::clone(&db));
        assert_eq!(ledger.expire_due(100).await.unwrap(), 1);
        assert_eq!(ledger.expire_due(100).await.unwrap(), 0);
        let row = users::Entity::find_by_id(user.id).one(db.as_ref()).await.unwrap().unwrap();
        assert_eq!(row.group, "default");
        assert!(!ledger.has_active_subscription(user.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_due_clears_usage() {
        let db = Arc::new(create_test_db().await.unwrap());
        let user = UserFixture::new().to_active_model().insert(db.as_ref()).await.unwrap();
        let plan = PlanFixture::new().to_active_model().insert(db.as_ref()).await.unwrap();
        let now = chrono::Utc::now().timestamp();
        let due = SubscriptionFixture::new(user.id, plan.id)
            .amount_total(100)
            .amount_used(70)
            .next_reset_time(now - 60)
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();
        let later = SubscriptionFixture::new(user.id, plan.id)
            .amount_total(100)
            .amount_used(70)
            .next_reset_time(now + 3600)
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();

        let ledger = SubscriptionLedger::new(Arc::clone(&db));
        assert_eq!(ledger.reset_due(100).await.unwrap(), 1);
        assert_eq!(ledger.reset_due(100).await.unwrap(), 0);

        let due = user_subscriptions::Entity::find_by_id(due.id).one(db.as_ref()).await.unwrap().unwrap();
        assert_eq!(due.amount_used, 0);
        assert_eq!(due.next_reset_time, 0);
        let later = user_subscriptions::Entity::find_by_id(later.id).one(db.as_ref()).await.unwrap().unwrap();
        assert_eq!(later.amount_used, 70);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_records() {
        let db = Arc::new(create_test_db().await.unwrap());
        let user = UserFixture::new().to_active_model().insert(db.as_ref()).await.unwrap();
        let plan = PlanFixture::new().to_active_model().insert(db.as_ref()).await.unwrap();
        SubscriptionFixture::new(user.id, plan.id)
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();

        let ledger = SubscriptionLedger::new(Arc::clone(&db));
        ledger.pre_consume("req-keep", user.id, 1).await.unwrap();
        assert_eq!(ledger.cleanup_pre_consume_records(3600).await.unwrap(), 0);
        assert!(ledger.find_pre_consume_record("req-keep").await.unwrap().is_some());
    }
}
