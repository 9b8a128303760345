//! # 令牌实体定义
//!
//! 用户签发的 API 令牌, 拥有独立的剩余额度

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 永不过期
pub const NEVER_EXPIRES: i64 = -1;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tokens")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub user_id: i32,
    #[sea_orm(unique)]
    pub key: String,
    pub name: String,
    pub status: TokenStatus,
    pub remain_quota: i64,
    pub used_quota: i64,
    pub unlimited_quota: bool,
    pub expired_time: i64, // unix 秒, -1 表示永不过期
    pub model_limits_enabled: bool,
    pub model_limits: Option<String>, // 逗号分隔
    pub allow_ips: Option<String>,    // 换行或逗号分隔, 支持 CIDR
    pub group: Option<String>,
    pub accessed_time: i64,
    pub created_at: DateTime,
}

/// 令牌状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    #[sea_orm(string_value = "enabled")]
    Enabled,
    #[sea_orm(string_value = "disabled")]
    Disabled,
    #[sea_orm(string_value = "expired")]
    Expired,
    #[sea_orm(string_value = "exhausted")]
    Exhausted,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::UserId",
        to = "super::users::Column::Id"
    )]
    Users,
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Users.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// 在给定时间点是否已过期
    #[must_use]
    pub const fn is_expired_at(&self, now: i64) -> bool {
        self.expired_time != NEVER_EXPIRES && self.expired_time < now
    }

    /// 受限令牌额度是否耗尽
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        !self.unlimited_quota && self.remain_quota <= 0
    }

    /// 模型白名单 (仅在启用时有意义)
    #[must_use]
    pub fn model_limit_list(&self) -> Vec<String> {
        self.model_limits
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect()
    }
}
