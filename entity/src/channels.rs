//! # 渠道实体定义
//!
//! 渠道是一个上游供应商账号, 可能携带多把密钥。多密钥状态以 JSON
//! 形式保存在 `channel_info` 列中。

use std::collections::BTreeMap;

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 渠道实体
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(column_name = "type")]
    pub channel_type: i32,
    pub name: String,
    pub key: String, // 换行分隔或 JSON 数组
    pub status: ChannelStatus,
    pub priority: i64,
    pub weight: i32,
    pub group: String,  // 逗号分隔
    pub models: String, // 逗号分隔
    pub tag: Option<String>,
    pub base_url: Option<String>,
    pub model_mapping: Option<String>, // JSON 对象
    pub organization: Option<String>,
    pub auto_ban: bool,
    pub used_quota: i64,
    pub channel_info: Option<String>, // JSON 字符串, 见 ChannelInfo
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

/// 渠道 (以及单把密钥) 的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[sea_orm(string_value = "enabled")]
    Enabled,
    #[sea_orm(string_value = "manually_disabled")]
    ManuallyDisabled,
    #[sea_orm(string_value = "auto_disabled")]
    AutoDisabled,
}

impl ChannelStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::ManuallyDisabled => "manually_disabled",
            Self::AutoDisabled => "auto_disabled",
        }
    }

    #[must_use]
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChannelStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(Self::Enabled),
            "manually_disabled" => Ok(Self::ManuallyDisabled),
            "auto_disabled" => Ok(Self::AutoDisabled),
            other => Err(format!("unknown channel status: {other}")),
        }
    }
}

/// 多密钥选择模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiKeyMode {
    #[default]
    Random,
    Polling,
}

/// 多密钥渠道的运行时状态 (存储于 `channel_info` 列)
///
/// 状态表中不存在的下标视为启用。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    #[serde(default)]
    pub is_multi_key: bool,
    #[serde(default)]
    pub multi_key_size: usize,
    #[serde(default)]
    pub multi_key_status_list: BTreeMap<usize, ChannelStatus>,
    #[serde(default)]
    pub multi_key_disabled_reason: BTreeMap<usize, String>,
    #[serde(default)]
    pub multi_key_disabled_time: BTreeMap<usize, i64>,
    #[serde(default)]
    pub multi_key_polling_index: usize,
    #[serde(default)]
    pub multi_key_mode: MultiKeyMode,
}

impl ChannelInfo {
    /// 指定下标的密钥状态
    #[must_use]
    pub fn key_status(&self, index: usize) -> ChannelStatus {
        self.multi_key_status_list
            .get(&index)
            .copied()
            .unwrap_or(ChannelStatus::Enabled)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::abilities::Entity")]
    Abilities,
}

impl Related<super::abilities::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Abilities.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// 解析多密钥状态, 缺失时返回默认值
    pub fn get_channel_info(&self) -> Result<ChannelInfo, serde_json::Error> {
        match self.channel_info.as_deref() {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw),
            _ => Ok(ChannelInfo::default()),
        }
    }

    /// 分组列表 (去除空白项)
    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        split_list(&self.group)
    }

    /// 模型列表 (去除空白项)
    #[must_use]
    pub fn model_list(&self) -> Vec<String> {
        split_list(&self.models)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
