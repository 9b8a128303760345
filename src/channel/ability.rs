//! # 能力表维护
//!
//! 能力行是 (分组, 模型, 渠道) 的展开, 完全可由渠道表推导。

use std::collections::HashSet;
use std::sync::Arc;

use entity::{abilities, channels};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, TransactionTrait,
};
use tokio::sync::Mutex;

use crate::error::{ChannelError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{linfo, lwarn};

/// 能力服务
pub struct AbilityService {
    db: Arc<DatabaseConnection>,
    rebuild_guard: Mutex<()>,
}

impl AbilityService {
    #[must_use]
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            rebuild_guard: Mutex::new(()),
        }
    }

    /// 展开渠道的能力行 (去重)
    #[must_use]
    pub fn abilities_for(channel: &channels::Model) -> Vec<abilities::ActiveModel> {
        let enabled = channel.status.is_enabled();
        let tag = channel.tag.clone().filter(|t| !t.trim().is_empty());
        let models = channel.model_list();
        let mut seen = HashSet::new();
        let mut rows = Vec::new();

        for group in channel.groups() {
            for model in &models {
                if !seen.insert((group.clone(), model.clone())) {
                    continue;
                }
                rows.push(abilities::ActiveModel {
                    group: Set(group.clone()),
                    model: Set(model.clone()),
                    channel_id: Set(channel.id),
                    enabled: Set(enabled),
                    priority: Set(channel.priority),
                    weight: Set(channel.weight.max(0)),
                    tag: Set(tag.clone()),
                });
            }
        }
        rows
    }

    /// 写入渠道的能力行
    pub async fn add_abilities<C: ConnectionTrait>(conn: &C, channel: &channels::Model) -> Result<usize> {
        let rows = Self::abilities_for(channel);
        let count = rows.len();
        if count > 0 {
            abilities::Entity::insert_many(rows)
                .exec_without_returning(conn)
                .await?;
        }
        Ok(count)
    }

    /// 删除渠道的全部能力行
    pub async fn delete_abilities<C: ConnectionTrait>(conn: &C, channel_id: i32) -> Result<u64> {
        let result = abilities::Entity::delete_many()
            .filter(abilities::Column::ChannelId.eq(channel_id))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    /// 同步渠道的启用标记
    pub async fn set_channel_enabled<C: ConnectionTrait>(
        conn: &C,
        channel_id: i32,
        enabled: bool,
    ) -> Result<u64> {
        let result = abilities::Entity::update_many()
            .col_expr(abilities::Column::Enabled, Expr::value(enabled))
            .filter(abilities::Column::ChannelId.eq(channel_id))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    /// 渠道的分组、模型、优先级变更后整体替换能力行
    pub async fn update_abilities(&self, channel: &channels::Model) -> Result<usize> {
        let txn = self.db.begin().await?;
        Self::delete_abilities(&txn, channel.id).await?;
        let count = Self::add_abilities(&txn, channel).await?;
        txn.commit().await?;
        Ok(count)
    }

    /// 按标签同步能力启用标记
    pub async fn set_tag_enabled<C: ConnectionTrait>(conn: &C, tag: &str, enabled: bool) -> Result<u64> {
        let result = abilities::Entity::update_many()
            .col_expr(abilities::Column::Enabled, Expr::value(enabled))
            .filter(abilities::Column::Tag.eq(tag))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    /// 分组下所有启用能力的模型名 (去重, 有序)
    pub async fn group_enabled_models(&self, group: &str) -> Result<Vec<String>> {
        let models: Vec<String> = abilities::Entity::find()
            .select_only()
            .column(abilities::Column::Model)
            .distinct()
            .filter(abilities::Column::Group.eq(group))
            .filter(abilities::Column::Enabled.eq(true))
            .order_by_asc(abilities::Column::Model)
            .into_tuple()
            .all(self.db.as_ref())
            .await?;
        Ok(models)
    }

    /// 由渠道表重建全部能力行, 返回 (成功数, 失败数)
    ///
    /// 同一时刻只允许一次重建。
    pub async fn rebuild_abilities(&self) -> Result<(usize, usize)> {
        let Ok(_guard) = self.rebuild_guard.try_lock() else {
            return Err(ChannelError::RebuildInProgress.into());
        };

        let txn = self.db.begin().await?;
        abilities::Entity::delete_many().exec(&txn).await?;
        let all_channels = channels::Entity::find()
            .order_by_asc(channels::Column::Id)
            .all(&txn)
            .await?;

        let mut success = 0;
        let mut fails = 0;
        for channel in &all_channels {
            match Self::add_abilities(&txn, channel).await {
                Ok(_) => success += 1,
                Err(err) => {
                    fails += 1;
                    lwarn!(
                        "system",
                        LogStage::Db,
                        LogComponent::Ability,
                        "rebuild_channel_failed",
                        "渠道能力重建失败",
                        channel_id = channel.id,
                        error = %err
                    );
                }
            }
        }
        txn.commit().await?;

        linfo!(
            "system",
            LogStage::Db,
            LogComponent::Ability,
            "rebuild_abilities",
            "能力表重建完成",
            success = success,
            fails = fails
        );
        Ok((success, fails))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ChannelFixture, create_test_db};
    use entity::channels::ChannelStatus;
    use sea_orm::{ActiveModelTrait, ActiveValue, PaginatorTrait};

    #[test]
    fn test_abilities_for_expands_and_dedups() {
        let channel = ChannelFixture::new()
            .groups("default,vip,default")
            .models("a, b")
            .tag("team-x")
            .status(ChannelStatus::AutoDisabled)
            .to_model_with_id(9);

        let rows = AbilityService::abilities_for(&channel);
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.enabled == ActiveValue::Set(false)));
        assert!(rows.iter().all(|r| r.channel_id == ActiveValue::Set(9)));
        assert!(
            rows.iter()
                .all(|r| r.tag == ActiveValue::Set(Some("team-x".to_string())))
        );
    }

    #[tokio::test]
    async fn test_rebuild_then_toggle_by_tag() {
        let db = Arc::new(create_test_db().await.unwrap());
        ChannelFixture::new()
            .groups("default,vip")
            .models("gpt-4o,claude-3")
            .tag("team-x")
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();
        ChannelFixture::new()
            .models("gpt-4o-mini")
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();
        let service = AbilityService::new(Arc::clone(&db));

        assert_eq!(service.rebuild_abilities().await.unwrap(), (2, 0));
        assert_eq!(abilities::Entity::find().count(db.as_ref()).await.unwrap(), 5);
        // 重建是全量替换, 重复执行结果不变
        assert_eq!(service.rebuild_abilities().await.unwrap(), (2, 0));
        assert_eq!(abilities::Entity::find().count(db.as_ref()).await.unwrap(), 5);

        assert_eq!(
            service.group_enabled_models("default").await.unwrap(),
            vec!["claude-3", "gpt-4o", "gpt-4o-mini"]
        );

        assert_eq!(AbilityService::set_tag_enabled(db.as_ref(), "team-x", false).await.unwrap(), 4);
        assert_eq!(service.group_enabled_models("default").await.unwrap(), vec!["gpt-4o-mini"]);
        assert!(service.group_enabled_models("vip").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_abilities_replaces_rows() {
        let db = Arc::new(create_test_db().await.unwrap());
        let mut channel = ChannelFixture::new()
            .to_active_model()
            .insert(db.as_ref())
            .await
            .unwrap();
        let service = AbilityService::new(Arc::clone(&db));
        AbilityService::add_abilities(db.as_ref(), &channel).await.unwrap();

        channel.models = "gpt-4o,o1".to_string();
        assert_eq!(service.update_abilities(&channel).await.unwrap(), 2);
        assert_eq!(AbilityService::set_channel_enabled(db.as_ref(), channel.id, false).await.unwrap(), 2);
        assert!(service.group_enabled_models("default").await.unwrap().is_empty());

        assert_eq!(AbilityService::delete_abilities(db.as_ref(), channel.id).await.unwrap(), 2);
    }
}
