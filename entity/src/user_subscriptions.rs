//! # 用户订阅实体定义
//!
//! 用户购买套餐后获得的一段时间内的额度

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "user_subscriptions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub user_id: i32,
    pub plan_id: i32,
    pub amount_total: i64, // 0 表示不限额
    pub amount_used: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub status: SubscriptionStatus,
    pub source: String,
    pub last_reset_time: i64,
    pub next_reset_time: i64, // 0 表示不再重置
    pub upgrade_group: Option<String>,
    pub prev_user_group: Option<String>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

/// 订阅状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "expired")]
    Expired,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::UserId",
        to = "super::users::Column::Id"
    )]
    Users,
    #[sea_orm(
        belongs_to = "super::subscription_plans::Entity",
        from = "Column::PlanId",
        to = "super::subscription_plans::Column::Id"
    )]
    SubscriptionPlans,
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Users.def()
    }
}

impl Related<super::subscription_plans::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SubscriptionPlans.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// 剩余额度; 不限额订阅返回 `None`
    #[must_use]
    pub const fn remaining(&self) -> Option<i64> {
        if self.amount_total > 0 {
            Some(self.amount_total - self.amount_used)
        } else {
            None
        }
    }

    /// 是否能承担给定金额
    #[must_use]
    pub const fn can_afford(&self, amount: i64) -> bool {
        match self.remaining() {
            Some(remain) => remain >= amount,
            None => true,
        }
    }

    /// 订阅携带的升级分组 (空字符串视为无)
    #[must_use]
    pub fn upgrade_group(&self) -> Option<&str> {
        self.upgrade_group
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
    }
}
