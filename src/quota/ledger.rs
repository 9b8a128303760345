//! # 额度账本
//!
//! 钱包 (用户) 与令牌额度的原子增减。每次变更都是一条
//! `UPDATE ... SET col = col ± ?`, 不做读改写; 开启批量模式时先在内存聚合。
//! 缓存镜像以 fire-and-forget 方式跟随, 失败只记日志。

use std::sync::Arc;

use entity::{tokens, users};
use sea_orm::{DatabaseConnection, EntityTrait};

use super::batch::{BatchKind, BatchUpdater, apply_delta};
use crate::cache::{CacheKey, CacheKeyBuilder, UnifiedCacheManager};
use crate::error::{BillingError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::lwarn;

/// 额度账本
pub struct QuotaLedger {
    db: Arc<DatabaseConnection>,
    cache: Option<Arc<UnifiedCacheManager>>,
    batch: Option<Arc<BatchUpdater>>,
}

impl QuotaLedger {
    #[must_use]
    pub fn new(
        db: Arc<DatabaseConnection>,
        cache: Option<Arc<UnifiedCacheManager>>,
        batch: Option<Arc<BatchUpdater>>,
    ) -> Self {
        Self { db, cache, batch }
    }

    #[must_use]
    pub fn batch(&self) -> Option<Arc<BatchUpdater>> {
        self.batch.clone()
    }

    /// 增加令牌剩余额度 (同时减少已用额度)
    pub async fn increase_token_quota(&self, token_id: i32, token_key: &str, delta: i64) -> Result<()> {
        ensure_non_negative(delta)?;
        self.mirror(CacheKeyBuilder::token_quota(token_key), delta);
        self.apply(BatchKind::TokenQuota, token_id, delta).await
    }

    /// 减少令牌剩余额度 (同时增加已用额度)
    pub async fn decrease_token_quota(&self, token_id: i32, token_key: &str, delta: i64) -> Result<()> {
        ensure_non_negative(delta)?;
        self.mirror(CacheKeyBuilder::token_quota(token_key), -delta);
        self.apply(BatchKind::TokenQuota, token_id, -delta).await
    }

    /// 增加用户钱包额度
    pub async fn increase_user_quota(&self, user_id: i32, delta: i64) -> Result<()> {
        ensure_non_negative(delta)?;
        self.mirror(CacheKeyBuilder::user_quota(user_id), delta);
        self.apply(BatchKind::UserQuota, user_id, delta).await
    }

    /// 减少用户钱包额度
    pub async fn decrease_user_quota(&self, user_id: i32, delta: i64) -> Result<()> {
        ensure_non_negative(delta)?;
        self.mirror(CacheKeyBuilder::user_quota(user_id), -delta);
        self.apply(BatchKind::UserQuota, user_id, -delta).await
    }

    /// 累加用户已用额度与请求次数
    pub async fn update_user_used_quota_and_request_count(&self, user_id: i32, quota: i64) -> Result<()> {
        self.apply(BatchKind::UsedQuota, user_id, quota).await?;
        self.apply(BatchKind::RequestCount, user_id, 1).await
    }

    /// 累加渠道已用额度
    pub async fn update_channel_used_quota(&self, channel_id: i32, quota: i64) -> Result<()> {
        self.apply(BatchKind::ChannelUsedQuota, channel_id, quota).await
    }

    /// 读取用户钱包额度 (含尚未写回的批量增量)
    pub async fn get_user_quota(&self, user_id: i32) -> Result<i64> {
        let user = users::Entity::find_by_id(user_id)
            .one(self.db.as_ref())
            .await?
            .ok_or(BillingError::UserNotFound(user_id))?;
        Ok(user.quota + self.pending(BatchKind::UserQuota, user_id))
    }

    /// 读取令牌剩余额度 (含尚未写回的批量增量)
    pub async fn get_token_remain_quota(&self, token_id: i32) -> Result<Option<i64>> {
        let token = tokens::Entity::find_by_id(token_id)
            .one(self.db.as_ref())
            .await?;
        Ok(token.map(|t| t.remain_quota + self.pending(BatchKind::TokenQuota, token_id)))
    }

    /// 预扣令牌额度; 受限令牌余额不足时拒绝
    pub async fn pre_consume_token_quota(&self, token: &tokens::Model, amount: i64) -> Result<()> {
        ensure_non_negative(amount)?;
        if amount == 0 {
            return Ok(());
        }

        if !token.unlimited_quota {
            let remain = self
                .get_token_remain_quota(token.id)
                .await?
                .unwrap_or(token.remain_quota);
            if remain < amount {
                return Err(BillingError::TokenQuotaInsufficient {
                    remain,
                    required: amount,
                }
                .into());
            }
        }
        self.decrease_token_quota(token.id, &token.key, amount).await
    }

    /// 结算差额同时作用于钱包与令牌; 正数扣费, 负数退还
    pub async fn post_consume_quota(&self, token: Option<&tokens::Model>, user_id: i32, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }

        if delta > 0 {
            self.decrease_user_quota(user_id, delta).await?;
            if let Some(token) = token {
                self.decrease_token_quota(token.id, &token.key, delta).await?;
            }
        } else {
            self.increase_user_quota(user_id, -delta).await?;
            if let Some(token) = token {
                self.increase_token_quota(token.id, &token.key, -delta).await?;
            }
        }
        Ok(())
    }

    /// 令牌额度增减, 不区分方向
    pub async fn adjust_token_quota(&self, token: &tokens::Model, delta: i64) -> Result<()> {
        match delta {
            0 => Ok(()),
            d if d > 0 => self.increase_token_quota(token.id, &token.key, d).await,
            d => self.decrease_token_quota(token.id, &token.key, -d).await,
        }
    }

    async fn apply(&self, kind: BatchKind, id: i32, delta: i64) -> Result<()> {
        if let Some(batch) = &self.batch {
            batch.add(kind, id, delta);
            return Ok(());
        }
        apply_delta(self.db.as_ref(), kind, id, delta).await
    }

    fn pending(&self, kind: BatchKind, id: i32) -> i64 {
        self.batch
            .as_ref()
            .map_or(0, |batch| batch.pending_delta(kind, id))
    }

    fn mirror(&self, key: CacheKey, delta: i64) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = cache.incr_if_exists(&key.build(), delta).await {
                lwarn!(
                    "system",
                    LogStage::Cache,
                    LogComponent::QuotaLedger,
                    "mirror_failed",
                    "额度缓存镜像更新失败",
                    namespace = key.namespace(),
                    delta = delta,
                    error = %err
                );
            }
        });
    }
}

fn ensure_non_negative(amount: i64) -> Result<()> {
    if amount < 0 {
        return Err(BillingError::NegativeAmount(amount).into());
    }
    Ok(())
}
