//! # 用户实体定义
//!
//! 用户表保存钱包额度、所属分组以及计费偏好

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 用户实体
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub username: String,
    pub group: String,
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i32,
    pub status: UserStatus,
    pub setting: Option<String>, // JSON 字符串, 见 UserSetting
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

/// 用户状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[sea_orm(string_value = "enabled")]
    Enabled,
    #[sea_orm(string_value = "disabled")]
    Disabled,
}

/// 计费偏好: 决定请求优先从订阅还是钱包扣费
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPreference {
    #[default]
    SubscriptionFirst,
    WalletFirst,
    SubscriptionOnly,
    WalletOnly,
}

impl BillingPreference {
    /// 是否允许使用订阅额度
    #[must_use]
    pub const fn allows_subscription(self) -> bool {
        !matches!(self, Self::WalletOnly)
    }

    /// 是否允许使用钱包额度
    #[must_use]
    pub const fn allows_wallet(self) -> bool {
        !matches!(self, Self::SubscriptionOnly)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SubscriptionFirst => "subscription_first",
            Self::WalletFirst => "wallet_first",
            Self::SubscriptionOnly => "subscription_only",
            Self::WalletOnly => "wallet_only",
        }
    }
}

impl std::str::FromStr for BillingPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "subscription_first" => Ok(Self::SubscriptionFirst),
            "wallet_first" => Ok(Self::WalletFirst),
            "subscription_only" => Ok(Self::SubscriptionOnly),
            "wallet_only" => Ok(Self::WalletOnly),
            other => Err(format!("unknown billing preference: {other}")),
        }
    }
}

/// 用户设置 (存储于 `setting` 列)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSetting {
    #[serde(default)]
    pub billing_preference: BillingPreference,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::tokens::Entity")]
    Tokens,
    #[sea_orm(has_many = "super::user_subscriptions::Entity")]
    UserSubscriptions,
}

impl Related<super::tokens::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tokens.def()
    }
}

impl Related<super::user_subscriptions::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserSubscriptions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// 解析用户设置, 缺失时返回默认值
    pub fn get_setting(&self) -> Result<UserSetting, serde_json::Error> {
        match self.setting.as_deref() {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw),
            _ => Ok(UserSetting::default()),
        }
    }

    /// 当前用户的计费偏好; 设置无法解析时回落到默认偏好
    #[must_use]
    pub fn billing_preference(&self) -> BillingPreference {
        self.get_setting()
            .map(|s| s.billing_preference)
            .unwrap_or_default()
    }
}
