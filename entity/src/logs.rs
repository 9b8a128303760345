//! # 消费日志实体定义

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub user_id: i32,
    #[sea_orm(column_name = "type")]
    pub log_type: LogType,
    pub content: String,
    pub username: String,
    pub token_name: String,
    pub token_id: Option<i32>,
    pub model_name: String,
    pub quota: i64,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub channel_id: Option<i32>,
    pub group: String,
    pub request_id: Option<String>,
    pub other: Option<String>, // JSON 字符串
    pub created_at: DateTime,
}

/// 日志类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    #[sea_orm(string_value = "consume")]
    Consume,
    #[sea_orm(string_value = "refund")]
    Refund,
    #[sea_orm(string_value = "system")]
    System,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
