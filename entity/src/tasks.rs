//! # 异步任务实体定义
//!
//! 视频/图像/音乐等长耗时上游任务。提交时冻结计费上下文,
//! 终态时据此完成结算。

use std::collections::BTreeMap;

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tasks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub task_id: String,
    pub platform: String,
    pub user_id: i32,
    pub group: String,
    pub channel_id: i32,
    pub quota: i64,
    pub action: String,
    pub status: TaskStatus,
    pub fail_reason: Option<String>,
    pub submit_time: i64,
    pub start_time: i64,
    pub finish_time: i64,
    pub progress: String,
    pub properties: Option<String>,   // JSON 字符串, 见 TaskProperties
    pub private_data: Option<String>, // JSON 字符串, 见 TaskPrivateData
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[sea_orm(string_value = "not_start")]
    NotStart,
    #[sea_orm(string_value = "submitted")]
    Submitted,
    #[sea_orm(string_value = "queued")]
    Queued,
    #[sea_orm(string_value = "in_progress")]
    InProgress,
    #[sea_orm(string_value = "failure")]
    Failure,
    #[sea_orm(string_value = "success")]
    Success,
    #[sea_orm(string_value = "unknown")]
    Unknown,
}

impl TaskStatus {
    /// 终态不再接受任何迁移
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// 未完成的状态集合
    #[must_use]
    pub fn unfinished() -> Vec<Self> {
        vec![
            Self::NotStart,
            Self::Submitted,
            Self::Queued,
            Self::InProgress,
            Self::Unknown,
        ]
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStart => "not_start",
            Self::Submitted => "submitted",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Failure => "failure",
            Self::Success => "success",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 扣费来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingSource {
    #[default]
    Wallet,
    Subscription,
}

impl BillingSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Wallet => "wallet",
            Self::Subscription => "subscription",
        }
    }
}

/// 提交时冻结的计费上下文
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskBillingContext {
    pub model_name: String,
    #[serde(default)]
    pub model_price: f64,
    #[serde(default)]
    pub model_ratio: f64,
    #[serde(default = "default_ratio")]
    pub group_ratio: f64,
    #[serde(default)]
    pub other_ratios: BTreeMap<String, f64>,
    #[serde(default)]
    pub per_call_billing: bool,
}

const fn default_ratio() -> f64 {
    1.0
}

impl TaskBillingContext {
    /// 按 token 数量计算额度: total × model_ratio × group_ratio × 其他倍率
    #[must_use]
    pub fn quota_for_tokens(&self, total_tokens: i64) -> i64 {
        let ratio = self
            .other_ratios
            .values()
            .filter(|r| **r > 0.0)
            .fold(self.model_ratio * self.group_ratio, |acc, r| acc * r);
        (total_tokens as f64 * ratio).round() as i64
    }
}

/// 任务私有数据, 不对外暴露
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPrivateData {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub upstream_task_id: Option<String>,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub billing_source: BillingSource,
    #[serde(default)]
    pub subscription_id: Option<i32>,
    #[serde(default)]
    pub token_id: Option<i32>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub billing_context: Option<TaskBillingContext>,
}

/// 各平台特有的任务属性
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlatformProperties {
    #[default]
    Generic,
    Video {
        duration_seconds: Option<u32>,
        resolution: Option<String>,
    },
    Image {
        size: Option<String>,
        count: Option<u32>,
    },
    Music {
        title: Option<String>,
        tags: Option<String>,
    },
}

/// 任务属性
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProperties {
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub origin_model_name: Option<String>,
    #[serde(default)]
    pub upstream_model_name: Option<String>,
    #[serde(default)]
    pub platform: PlatformProperties,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn get_private_data(&self) -> Result<TaskPrivateData, serde_json::Error> {
        match self.private_data.as_deref() {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw),
            _ => Ok(TaskPrivateData::default()),
        }
    }

    pub fn set_private_data(&mut self, data: &TaskPrivateData) -> Result<(), serde_json::Error> {
        self.private_data = Some(serde_json::to_string(data)?);
        Ok(())
    }

    pub fn get_properties(&self) -> Result<TaskProperties, serde_json::Error> {
        match self.properties.as_deref() {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw),
            _ => Ok(TaskProperties::default()),
        }
    }

    pub fn set_properties(&mut self, properties: &TaskProperties) -> Result<(), serde_json::Error> {
        self.properties = Some(serde_json::to_string(properties)?);
        Ok(())
    }
}
