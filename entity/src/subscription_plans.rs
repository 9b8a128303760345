//! # 订阅套餐实体定义

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "subscription_plans")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub title: String,
    pub enabled: bool,
    pub total_amount: i64, // 0 表示不限额
    pub duration_unit: DurationUnit,
    pub duration_value: i32,
    pub custom_seconds: i64,
    pub quota_reset_period: ResetPeriod,
    pub quota_reset_custom_seconds: i64,
    pub upgrade_group: Option<String>,
    pub max_purchase_per_user: i32, // 0 表示不限制
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

/// 套餐时长单位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
pub enum DurationUnit {
    #[sea_orm(string_value = "year")]
    Year,
    #[sea_orm(string_value = "month")]
    Month,
    #[sea_orm(string_value = "week")]
    Week,
    #[sea_orm(string_value = "day")]
    Day,
    #[sea_orm(string_value = "hour")]
    Hour,
    #[sea_orm(string_value = "custom")]
    Custom,
}

/// 额度重置周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
pub enum ResetPeriod {
    #[sea_orm(string_value = "never")]
    Never,
    #[sea_orm(string_value = "daily")]
    Daily,
    #[sea_orm(string_value = "weekly")]
    Weekly,
    #[sea_orm(string_value = "monthly")]
    Monthly,
    #[sea_orm(string_value = "custom")]
    Custom,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::user_subscriptions::Entity")]
    UserSubscriptions,
}

impl Related<super::user_subscriptions::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserSubscriptions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// 套餐携带的升级分组 (空字符串视为无)
    #[must_use]
    pub fn upgrade_group(&self) -> Option<&str> {
        self.upgrade_group
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
    }
}
