//! # 多密钥轮换
//!
//! 从渠道的多把密钥中挑选一把启用的密钥, 并维护每把密钥的启用状态。
//! 所有密钥被禁用时渠道自动禁用, 任意密钥恢复时自动重新启用。

use std::sync::Arc;

use entity::channels::{self, ChannelInfo, ChannelStatus, MultiKeyMode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect, TransactionTrait,
};

use super::lock_arena::PollingLockArena;
use super::types::{KeySelection, KeyStatusChange, KeyStrategy};
use crate::channel::ability::AbilityService;
use crate::channel::keys::{key_index, parse_channel_keys};
use crate::channel::{Channel, ChannelRegistry};
use crate::database::db_now;
use crate::error::{ChannelError, KeyPoolError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo, lwarn};

/// 多密钥轮换器
pub struct MultiKeyRotator {
    db: Arc<DatabaseConnection>,
    registry: Arc<ChannelRegistry>,
    locks: Arc<PollingLockArena>,
}

impl MultiKeyRotator {
    #[must_use]
    pub fn new(
        db: Arc<DatabaseConnection>,
        registry: Arc<ChannelRegistry>,
        locks: Arc<PollingLockArena>,
    ) -> Self {
        Self { db, registry, locks }
    }

    #[must_use]
    pub fn locks(&self) -> Arc<PollingLockArena> {
        Arc::clone(&self.locks)
    }

    /// 为渠道挑选下一把启用的密钥
    pub async fn next_enabled_key(&self, channel: &Arc<Channel>) -> Result<KeySelection> {
        if channel.keys.is_empty() {
            return Err(KeyPoolError::NoKeys {
                channel_id: channel.id,
            }
            .into());
        }

        if !channel.is_multi_key() {
            return Ok(KeySelection {
                key: channel.keys[0].clone(),
                index: 0,
                strategy: KeyStrategy::Single,
            });
        }

        match channel.multi_key_mode() {
            MultiKeyMode::Random => {
                let mut rng = StdRng::from_entropy();
                Ok(pick_random_key(channel, &mut rng))
            }
            MultiKeyMode::Polling => self.next_polling_key(channel).await,
        }
    }

    async fn next_polling_key(&self, channel: &Arc<Channel>) -> Result<KeySelection> {
        let lock = self.locks.lock_for(channel.id);
        let _guard = lock.lock().await;

        if self.registry.memory_enabled() {
            // 以注册表中的最新快照为准, 渠道被删除时退回调用方持有的快照
            let live = match self.registry.get_channel(channel.id).await {
                Ok(live) => live,
                Err(_) => Arc::clone(channel),
            };
            let (index, next) = polling_pick(live.keys.len(), &live.info, live.polling_cursor());
            // 快照可能已被并发修改为没有密钥
            let Some(key) = live.keys.get(index).cloned() else {
                return Err(KeyPoolError::NoKeys { channel_id: live.id }.into());
            };
            live.set_polling_cursor(next);

            ldebug!(
                "system",
                LogStage::KeySelection,
                LogComponent::KeyPool,
                "polling_pick",
                "轮询选择密钥",
                channel_id = live.id,
                index = index,
                next_cursor = next
            );
            return Ok(KeySelection {
                key,
                index,
                strategy: KeyStrategy::Polling,
            });
        }

        // 无内存快照时游标保存在数据库中
        let model = channels::Entity::find_by_id(channel.id)
            .one(self.db.as_ref())
            .await?
            .ok_or(ChannelError::NotFound(channel.id))?;
        let keys = parse_channel_keys(&model.key);
        if keys.is_empty() {
            return Err(KeyPoolError::NoKeys {
                channel_id: channel.id,
            }
            .into());
        }
        let mut info = model.get_channel_info()?;
        let (index, next) = polling_pick(keys.len(), &info, info.multi_key_polling_index);
        info.multi_key_polling_index = next;

        channels::Entity::update_many()
            .col_expr(
                channels::Column::ChannelInfo,
                Expr::value(serde_json::to_string(&info)?),
            )
            .filter(channels::Column::Id.eq(channel.id))
            .exec(self.db.as_ref())
            .await?;

        Ok(KeySelection {
            key: keys[index].clone(),
            index,
            strategy: KeyStrategy::Polling,
        })
    }

    /// 记录单把密钥的状态, 必要时联动渠道状态
    pub async fn mark_key_status(
        &self,
        channel_id: i32,
        key: &str,
        status: ChannelStatus,
        reason: &str,
    ) -> Result<KeyStatusChange> {
        let lock = self.locks.lock_for(channel_id);
        let _guard = lock.lock().await;

        let txn = self.db.begin().await?;
        let model = channels::Entity::find_by_id(channel_id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or(ChannelError::NotFound(channel_id))?;

        let keys = parse_channel_keys(&model.key);
        let index = key_index(&keys, key).ok_or(KeyPoolError::KeyNotFound { channel_id })?;
        let now = db_now(&txn).await?;

        let mut info = model.get_channel_info()?;
        info.multi_key_size = keys.len();
        apply_key_status(&mut info, index, status, reason, now);

        let enabled_keys = (0..keys.len())
            .filter(|idx| info.key_status(*idx).is_enabled())
            .count();
        let channel_status = next_channel_status(model.status, enabled_keys, keys.len());
        let channel_status_changed = channel_status != model.status;
        let info_json = serde_json::to_string(&info)?;

        channels::Entity::update_many()
            .col_expr(channels::Column::ChannelInfo, Expr::value(info_json.clone()))
            .col_expr(channels::Column::Status, Expr::value(channel_status.as_str()))
            .col_expr(channels::Column::UpdatedAt, Expr::current_timestamp().into())
            .filter(channels::Column::Id.eq(channel_id))
            .exec(&txn)
            .await?;
        if channel_status_changed {
            AbilityService::set_channel_enabled(&txn, channel_id, channel_status.is_enabled())
                .await?;
        }
        txn.commit().await?;

        let mut updated = model;
        updated.channel_info = Some(info_json);
        updated.status = channel_status;
        self.registry
            .replace_channel(Channel::from_model(&updated)?)
            .await;

        if channel_status_changed {
            lwarn!(
                "system",
                LogStage::KeySelection,
                LogComponent::KeyPool,
                "channel_status_follow_keys",
                "渠道状态随密钥状态变更",
                channel_id = channel_id,
                status = %channel_status,
                enabled_keys = enabled_keys
            );
        } else {
            linfo!(
                "system",
                LogStage::KeySelection,
                LogComponent::KeyPool,
                "mark_key_status",
                "密钥状态已更新",
                channel_id = channel_id,
                index = index,
                status = %status,
                reason = reason
            );
        }

        Ok(KeyStatusChange {
            index,
            channel_status_changed,
            enabled_keys,
        })
    }

    /// 清理已删除渠道的轮询锁
    pub async fn sweep_locks(&self) -> Result<usize> {
        let live = self.registry.channel_ids().await?;
        Ok(self.locks.sweep(&live))
    }
}

/// 在启用的密钥中均匀随机; 全部禁用时退回下标 0
pub fn pick_random_key<R: Rng + ?Sized>(channel: &Channel, rng: &mut R) -> KeySelection {
    let enabled = channel.enabled_key_indices();
    let index = if enabled.is_empty() {
        0
    } else {
        enabled[rng.gen_range(0..enabled.len())]
    };
    KeySelection {
        key: channel.keys[index].clone(),
        index,
        strategy: KeyStrategy::Random,
    }
}

/// 从游标开始向后查找第一把启用的密钥, 返回 (选中下标, 新游标)
///
/// 全部禁用时返回下标 0 且游标不变。
#[must_use]
pub fn polling_pick(len: usize, info: &ChannelInfo, cursor: usize) -> (usize, usize) {
    if len == 0 {
        return (0, 0);
    }
    let start = cursor % len;
    for offset in 0..len {
        let index = (start + offset) % len;
        if info.key_status(index).is_enabled() {
            return (index, (index + 1) % len);
        }
    }
    (0, start)
}

fn apply_key_status(info: &mut ChannelInfo, index: usize, status: ChannelStatus, reason: &str, now: i64) {
    if status.is_enabled() {
        info.multi_key_status_list.remove(&index);
        info.multi_key_disabled_reason.remove(&index);
        info.multi_key_disabled_time.remove(&index);
    } else {
        info.multi_key_status_list.insert(index, status);
        info.multi_key_disabled_reason.insert(index, reason.to_string());
        info.multi_key_disabled_time.insert(index, now);
    }
}

/// 由启用密钥数量推导渠道状态; 手动禁用不受影响
#[must_use]
pub const fn next_channel_status(current: ChannelStatus, enabled_keys: usize, total_keys: usize) -> ChannelStatus {
    match current {
        ChannelStatus::Enabled if total_keys > 0 && enabled_keys == 0 => ChannelStatus::AutoDisabled,
        ChannelStatus::AutoDisabled if enabled_keys > 0 => ChannelStatus::Enabled,
        other => other,
    }
}
