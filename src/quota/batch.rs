//! # 批量写回
//!
//! 高频的额度增量先在内存中按 (类型, ID) 聚合, 由后台任务周期性地以
//! 每个键一条 UPDATE 写回数据库。写回失败的增量会重新入队。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use entity::{channels, tokens, users};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter};

use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lerror};

/// 聚合的增量类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    /// 用户钱包额度
    UserQuota,
    /// 令牌剩余额度 (已用额度反向变化)
    TokenQuota,
    /// 用户已用额度
    UsedQuota,
    /// 用户请求次数
    RequestCount,
    /// 渠道已用额度
    ChannelUsedQuota,
}

/// 批量写回器
pub struct BatchUpdater {
    db: Arc<DatabaseConnection>,
    pending: Mutex<HashMap<(BatchKind, i32), i64>>,
}

impl BatchUpdater {
    #[must_use]
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// 累加一条增量
    pub fn add(&self, kind: BatchKind, id: i32, delta: i64) {
        if delta == 0 {
            return;
        }
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending.entry((kind, id)).or_insert(0) += delta;
    }

    /// 待写回的键数量
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// 指定键当前累计的增量
    #[must_use]
    pub fn pending_delta(&self, kind: BatchKind, id: i32) -> i64 {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, id))
            .copied()
            .unwrap_or(0)
    }

    /// 写回全部累计增量, 返回成功写回的键数量
    pub async fn flush(&self) -> Result<usize> {
        let drained = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *pending)
        };
        if drained.is_empty() {
            return Ok(0);
        }

        let total = drained.len();
        let mut applied = 0;
        for ((kind, id), delta) in drained {
            match apply_delta(self.db.as_ref(), kind, id, delta).await {
                Ok(()) => applied += 1,
                Err(err) => {
                    lerror!(
                        "system",
                        LogStage::BackgroundTask,
                        LogComponent::BatchUpdater,
                        "flush_failed",
                        "批量写回失败, 增量重新入队",
                        kind = ?kind,
                        id = id,
                        delta = delta,
                        error = %err
                    );
                    self.add(kind, id, delta);
                }
            }
        }

        ldebug!(
            "system",
            LogStage::BackgroundTask,
            LogComponent::BatchUpdater,
            "flush",
            "批量写回完成",
            total = total,
            applied = applied
        );
        Ok(applied)
    }
}

/// 以单条原子 UPDATE 应用一条增量
pub async fn apply_delta<C: ConnectionTrait>(db: &C, kind: BatchKind, id: i32, delta: i64) -> Result<()> {
    match kind {
        BatchKind::UserQuota => {
            users::Entity::update_many()
                .col_expr(users::Column::Quota, Expr::col(users::Column::Quota).add(delta))
                .filter(users::Column::Id.eq(id))
                .exec(db)
                .await?;
        }
        BatchKind::TokenQuota => {
            tokens::Entity::update_many()
                .col_expr(
                    tokens::Column::RemainQuota,
                    Expr::col(tokens::Column::RemainQuota).add(delta),
                )
                .col_expr(
                    tokens::Column::UsedQuota,
                    Expr::col(tokens::Column::UsedQuota).sub(delta),
                )
                .col_expr(
                    tokens::Column::AccessedTime,
                    Expr::value(chrono::Utc::now().timestamp()),
                )
                .filter(tokens::Column::Id.eq(id))
                .exec(db)
                .await?;
        }
        BatchKind::UsedQuota => {
            users::Entity::update_many()
                .col_expr(
                    users::Column::UsedQuota,
                    Expr::col(users::Column::UsedQuota).add(delta),
                )
                .filter(users::Column::Id.eq(id))
                .exec(db)
                .await?;
        }
        BatchKind::RequestCount => {
            users::Entity::update_many()
                .col_expr(
                    users::Column::RequestCount,
                    Expr::col(users::Column::RequestCount).add(delta),
                )
                .filter(users::Column::Id.eq(id))
                .exec(db)
                .await?;
        }
        BatchKind::ChannelUsedQuota => {
            channels::Entity::update_many()
                .col_expr(
                    channels::Column::UsedQuota,
                    Expr::col(channels::Column::UsedQuota).add(delta),
                )
                .filter(channels::Column::Id.eq(id))
                .exec(db)
                .await?;
        }
    }
    Ok(())
}
