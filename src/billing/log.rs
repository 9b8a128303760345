//! # 消费日志
//!
//! 账本变更之后写入的审计记录。写入失败只记录错误, 不影响已完成的扣费。

use std::sync::Arc;

use entity::logs::{self, LogType};
use sea_orm::{ActiveModelTrait, ActiveValue::Set, DatabaseConnection};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::types::{BillingSource, Usage};
use crate::{ldebug, lerror};

/// 写入日志 `other` 字段的附加信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOther {
    pub billing_source: BillingSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<i32>,
    #[serde(default)]
    pub per_call: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// 一条消费或退款日志
#[derive(Debug, Clone, Default)]
pub struct AuditLogEntry {
    pub user_id: i32,
    pub username: String,
    pub token_id: Option<i32>,
    pub token_name: String,
    pub channel_id: Option<i32>,
    pub group: String,
    pub model_name: String,
    pub request_id: Option<String>,
    pub quota: i64,
    pub usage: Usage,
    pub content: String,
    pub other: LogOther,
}

/// 日志写入器
pub struct AuditLogWriter {
    db: Arc<DatabaseConnection>,
}

impl AuditLogWriter {
    #[must_use]
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// 写入消费日志, 返回是否写入成功
    pub async fn record_consume_log(&self, entry: &AuditLogEntry) -> bool {
        self.record(LogType::Consume, entry).await
    }

    /// 写入退款日志, 返回是否写入成功
    pub async fn record_refund_log(&self, entry: &AuditLogEntry) -> bool {
        self.record(LogType::Refund, entry).await
    }

    async fn record(&self, log_type: LogType, entry: &AuditLogEntry) -> bool {
        match self.insert(log_type, entry).await {
            Ok(id) => {
                ldebug!(
                    entry.request_id.as_deref().unwrap_or("system"),
                    LogStage::Settlement,
                    LogComponent::Billing,
                    "audit_log_written",
                    "消费日志已写入",
                    log_id = id,
                    log_type = ?log_type,
                    quota = entry.quota
                );
                true
            }
            Err(err) => {
                lerror!(
                    entry.request_id.as_deref().unwrap_or("system"),
                    LogStage::Settlement,
                    LogComponent::Billing,
                    "audit_log_failed",
                    "消费日志写入失败",
                    user_id = entry.user_id,
                    log_type = ?log_type,
                    quota = entry.quota,
                    error = %err
                );
                false
            }
        }
    }

    async fn insert(&self, log_type: LogType, entry: &AuditLogEntry) -> Result<i32> {
        let other = serde_json::to_string(&entry.other)?;
        let row = logs::ActiveModel {
            user_id: Set(entry.user_id),
            log_type: Set(log_type),
            content: Set(entry.content.clone()),
            username: Set(entry.username.clone()),
            token_name: Set(entry.token_name.clone()),
            token_id: Set(entry.token_id),
            model_name: Set(entry.model_name.clone()),
            quota: Set(entry.quota),
            prompt_tokens: Set(clamp_tokens(entry.usage.prompt_tokens)),
            completion_tokens: Set(clamp_tokens(entry.usage.completion_tokens)),
            channel_id: Set(entry.channel_id),
            group: Set(entry.group.clone()),
            request_id: Set(entry.request_id.clone()),
            other: Set(Some(other)),
            ..Default::default()
        }
        .insert(self.db.as_ref())
        .await?;
        Ok(row.id)
    }
}

fn clamp_tokens(tokens: i64) -> i32 {
    i32::try_from(tokens.max(0)).unwrap_or(i32::MAX)
}
