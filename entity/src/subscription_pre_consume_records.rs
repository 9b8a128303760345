//! # 订阅预扣记录实体定义
//!
//! 每个请求 ID 至多一条记录, 保证预扣与退款的幂等

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "subscription_pre_consume_records")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub request_id: String,
    pub user_id: i32,
    pub user_subscription_id: i32,
    pub pre_consumed: i64,
    pub status: PreConsumeStatus,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

/// 预扣记录状态, 只允许 consumed -> refunded 单向迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
pub enum PreConsumeStatus {
    #[sea_orm(string_value = "consumed")]
    Consumed,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user_subscriptions::Entity",
        from = "Column::UserSubscriptionId",
        to = "super::user_subscriptions::Column::Id"
    )]
    UserSubscriptions,
}

impl Related<super::user_subscriptions::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserSubscriptions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
