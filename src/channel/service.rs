//! # 渠道状态服务
//!
//! 持久化渠道状态变更并同步能力表与注册表。自动路径 (上游报错触发)
//! 与手动路径 (管理员操作) 分开: 自动路径不会改动被手动禁用的渠道,
//! 也不会禁用关闭了 `auto_ban` 的渠道。

use std::sync::Arc;

use entity::channels::{self, ChannelStatus};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect, TransactionTrait};

use super::ability::AbilityService;
use super::keys::parse_channel_keys;
use super::registry::ChannelRegistry;
use crate::error::{ChannelError, Result};
use crate::key_pool::MultiKeyRotator;
use crate::logging::{LogComponent, LogStage};
use crate::{linfo, lwarn};

/// 渠道状态服务
pub struct ChannelService {
    db: Arc<DatabaseConnection>,
    registry: Arc<ChannelRegistry>,
    rotator: Arc<MultiKeyRotator>,
}

impl ChannelService {
    #[must_use]
    pub fn new(
        db: Arc<DatabaseConnection>,
        registry: Arc<ChannelRegistry>,
        rotator: Arc<MultiKeyRotator>,
    ) -> Self {
        Self {
            db,
            registry,
            rotator,
        }
    }

    /// 自动路径的状态变更, 返回渠道整体状态是否改变
    ///
    /// 多密钥渠道只变更 `key` 对应的那把密钥, 渠道状态由密钥状态推导。
    pub async fn update_channel_status(
        &self,
        channel_id: i32,
        key: Option<&str>,
        status: ChannelStatus,
        reason: &str,
    ) -> Result<bool> {
        let model = channels::Entity::find_by_id(channel_id)
            .one(self.db.as_ref())
            .await?
            .ok_or(ChannelError::NotFound(channel_id))?;

        if !status.is_enabled() && !model.auto_ban {
            linfo!(
                "system",
                LogStage::Scheduling,
                LogComponent::ChannelRegistry,
                "auto_ban_off",
                "渠道关闭了自动禁用, 忽略状态变更",
                channel_id = channel_id,
                reason = reason
            );
            return Ok(false);
        }

        let info = model.get_channel_info()?;
        let is_multi_key = info.is_multi_key && parse_channel_keys(&model.key).len() > 1;
        if let (true, Some(key)) = (is_multi_key, key) {
            let change = self
                .rotator
                .mark_key_status(channel_id, key, status, reason)
                .await?;
            return Ok(change.channel_status_changed);
        }

        if model.status == ChannelStatus::ManuallyDisabled || model.status == status {
            return Ok(false);
        }

        self.persist_status(channel_id, status).await?;
        lwarn!(
            "system",
            LogStage::Scheduling,
            LogComponent::ChannelRegistry,
            "update_channel_status",
            "渠道状态已自动变更",
            channel_id = channel_id,
            from = %model.status,
            to = %status,
            reason = reason
        );
        Ok(true)
    }

    /// 管理员手动设置渠道状态
    pub async fn set_channel_status_manually(&self, channel_id: i32, status: ChannelStatus) -> Result<()> {
        let status = if status.is_enabled() {
            status
        } else {
            ChannelStatus::ManuallyDisabled
        };
        self.persist_status(channel_id, status).await?;
        linfo!(
            "system",
            LogStage::Scheduling,
            LogComponent::ChannelRegistry,
            "set_channel_status_manually",
            "渠道状态已手动变更",
            channel_id = channel_id,
            to = %status
        );
        Ok(())
    }

    /// 管理员按标签批量设置渠道状态, 返回受影响的渠道 ID
    pub async fn set_tag_status_manually(&self, tag: &str, status: ChannelStatus) -> Result<Vec<i32>> {
        let status = if status.is_enabled() {
            status
        } else {
            ChannelStatus::ManuallyDisabled
        };

        let txn = self.db.begin().await?;
        let ids: Vec<i32> = channels::Entity::find()
            .select_only()
            .column(channels::Column::Id)
            .filter(channels::Column::Tag.eq(tag))
            .into_tuple()
            .all(&txn)
            .await?;
        if ids.is_empty() {
            txn.commit().await?;
            return Ok(ids);
        }
        channels::Entity::update_many()
            .col_expr(channels::Column::Status, Expr::value(status.as_str()))
            .col_expr(channels::Column::UpdatedAt, Expr::current_timestamp().into())
            .filter(channels::Column::Tag.eq(tag))
            .exec(&txn)
            .await?;
        AbilityService::set_tag_enabled(&txn, tag, status.is_enabled()).await?;
        txn.commit().await?;

        for id in &ids {
            self.registry.update_status(*id, status).await;
        }
        linfo!(
            "system",
            LogStage::Scheduling,
            LogComponent::ChannelRegistry,
            "set_tag_status_manually",
            "标签下的渠道状态已手动变更",
            tag = tag,
            to = %status,
            count = ids.len()
        );
        Ok(ids)
    }

    async fn persist_status(&self, channel_id: i32, status: ChannelStatus) -> Result<()> {
        let txn = self.db.begin().await?;
        let result = channels::Entity::update_many()
            .col_expr(channels::Column::Status, Expr::value(status.as_str()))
            .col_expr(channels::Column::UpdatedAt, Expr::current_timestamp().into())
            .filter(channels::Column::Id.eq(channel_id))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(ChannelError::NotFound(channel_id).into());
        }
        AbilityService::set_channel_enabled(&txn, channel_id, status.is_enabled()).await?;
        txn.commit().await?;

        self.registry.update_status(channel_id, status).await;
        Ok(())
    }
}
