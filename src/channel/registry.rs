//! # 渠道注册表
//!
//! 内存中的渠道快照: `id -> Channel` 以及 `分组 -> 模型 -> [渠道ID]` 索引。
//! 索引只包含启用的渠道, 每个列表按优先级降序排列; 禁用的渠道仍可按 ID 查询。
//! 关闭内存缓存时所有查询直接落到数据库。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use entity::abilities;
use entity::channels::{self, ChannelStatus};
use futures::FutureExt;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use tokio::sync::RwLock;

use super::model::Channel;
use crate::config::ChannelConfig;
use crate::error::{ChannelError, GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lerror, linfo, lwarn};

type GroupModelIndex = HashMap<String, HashMap<String, Vec<i32>>>;

#[derive(Default)]
struct RegistrySnapshot {
    channels: HashMap<i32, Arc<Channel>>,
    index: GroupModelIndex,
}

impl RegistrySnapshot {
    fn build(channels: Vec<Channel>, previous: &Self) -> Self {
        let mut map = HashMap::with_capacity(channels.len());
        for channel in channels {
            // 轮询游标跨刷新保留
            if let Some(prev) = previous.channels.get(&channel.id) {
                channel.set_polling_cursor(prev.polling_cursor());
            }
            map.insert(channel.id, Arc::new(channel));
        }

        let mut index: GroupModelIndex = HashMap::new();
        for channel in map.values().filter(|c| c.is_enabled()) {
            for group in &channel.groups {
                let models = index.entry(group.clone()).or_default();
                for model in &channel.models {
                    let ids = models.entry(model.clone()).or_default();
                    if !ids.contains(&channel.id) {
                        ids.push(channel.id);
                    }
                }
            }
        }
        for ids in index.values_mut().flat_map(HashMap::values_mut) {
            sort_by_priority(ids, &map);
        }

        Self {
            channels: map,
            index,
        }
    }

    fn remove_from_index(&mut self, channel_id: i32) {
        for ids in self.index.values_mut().flat_map(HashMap::values_mut) {
            ids.retain(|id| *id != channel_id);
        }
    }

    fn insert_into_index(&mut self, channel: &Channel) {
        for group in &channel.groups {
            let models = self.index.entry(group.clone()).or_default();
            for model in &channel.models {
                let ids = models.entry(model.clone()).or_default();
                if !ids.contains(&channel.id) {
                    ids.push(channel.id);
                    sort_by_priority(ids, &self.channels);
                }
            }
        }
    }
}

fn sort_by_priority(ids: &mut [i32], channels: &HashMap<i32, Arc<Channel>>) {
    ids.sort_by(|a, b| {
        let pa = channels.get(a).map_or(i64::MIN, |c| c.priority);
        let pb = channels.get(b).map_or(i64::MIN, |c| c.priority);
        pb.cmp(&pa).then(a.cmp(b))
    });
}

/// 渠道注册表
pub struct ChannelRegistry {
    db: Arc<DatabaseConnection>,
    memory_enabled: bool,
    snapshot: RwLock<RegistrySnapshot>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new(db: Arc<DatabaseConnection>, config: &ChannelConfig) -> Self {
        Self {
            db,
            memory_enabled: config.memory_cache_enabled,
            snapshot: RwLock::new(RegistrySnapshot::default()),
        }
    }

    #[must_use]
    pub const fn memory_enabled(&self) -> bool {
        self.memory_enabled
    }

    #[must_use]
    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// 启动时构建快照; 构建过程 panic 时重试一次
    pub async fn initialize(&self) -> Result<usize> {
        if !self.memory_enabled {
            return Ok(0);
        }

        match std::panic::AssertUnwindSafe(self.refresh()).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                lerror!(
                    "system",
                    LogStage::Startup,
                    LogComponent::ChannelRegistry,
                    "initialize_panic",
                    "构建渠道快照时发生 panic, 重试一次"
                );
                std::panic::AssertUnwindSafe(self.refresh())
                    .catch_unwind()
                    .await
                    .map_err(|_| GatewayError::server_init("渠道快照构建连续失败"))?
            }
        }
    }

    /// 重新加载全部渠道并原子替换快照
    pub async fn refresh(&self) -> Result<usize> {
        if !self.memory_enabled {
            return Ok(0);
        }

        let rows = channels::Entity::find().all(self.db.as_ref()).await?;
        let mut parsed = Vec::with_capacity(rows.len());
        for row in &rows {
            match Channel::from_model(row) {
                Ok(channel) => parsed.push(channel),
                Err(err) => lwarn!(
                    "system",
                    LogStage::Cache,
                    LogComponent::ChannelRegistry,
                    "parse_channel_failed",
                    "渠道数据解析失败, 已跳过",
                    channel_id = row.id,
                    error = %err
                ),
            }
        }

        let mut guard = self.snapshot.write().await;
        let next = RegistrySnapshot::build(parsed, &guard);
        let total = next.channels.len();
        let enabled = next.channels.values().filter(|c| c.is_enabled()).count();
        *guard = next;
        drop(guard);

        ldebug!(
            "system",
            LogStage::Cache,
            LogComponent::ChannelRegistry,
            "refresh",
            "渠道快照已刷新",
            total = total,
            enabled = enabled
        );
        Ok(total)
    }

    /// 按 ID 获取渠道
    pub async fn get_channel(&self, channel_id: i32) -> Result<Arc<Channel>> {
        if self.memory_enabled {
            return self
                .snapshot
                .read()
                .await
                .channels
                .get(&channel_id)
                .cloned()
                .ok_or_else(|| GatewayError::from(ChannelError::NotFound(channel_id)));
        }

        let model = channels::Entity::find_by_id(channel_id)
            .one(self.db.as_ref())
            .await?
            .ok_or(ChannelError::NotFound(channel_id))?;
        Ok(Arc::new(Channel::from_model(&model)?))
    }

    /// 指定分组与模型下的候选渠道, 按优先级降序
    pub async fn candidates(&self, group: &str, model: &str) -> Result<Vec<Arc<Channel>>> {
        if self.memory_enabled {
            let guard = self.snapshot.read().await;
            let Some(ids) = guard.index.get(group).and_then(|models| models.get(model)) else {
                return Ok(Vec::new());
            };
            return ids
                .iter()
                .map(|id| {
                    guard
                        .channels
                        .get(id)
                        .cloned()
                        .ok_or_else(|| GatewayError::from(ChannelError::DataInconsistency(*id)))
                })
                .collect();
        }

        let rows = abilities::Entity::find()
            .filter(abilities::Column::Group.eq(group))
            .filter(abilities::Column::Model.eq(model))
            .filter(abilities::Column::Enabled.eq(true))
            .all(self.db.as_ref())
            .await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i32> = rows.iter().map(|a| a.channel_id).collect();
        let models = channels::Entity::find()
            .filter(channels::Column::Id.is_in(ids.clone()))
            .all(self.db.as_ref())
            .await?;
        let mut by_id: HashMap<i32, channels::Model> =
            models.into_iter().map(|m| (m.id, m)).collect();

        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            let model = by_id.remove(&id).ok_or(ChannelError::DataInconsistency(id))?;
            result.push(Arc::new(Channel::from_model(&model)?));
        }
        result.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(result)
    }

    /// 更新缓存中的渠道状态; 非启用状态会从所有索引列表中移除
    pub async fn update_status(&self, channel_id: i32, status: ChannelStatus) -> bool {
        if !self.memory_enabled {
            return false;
        }

        let mut guard = self.snapshot.write().await;
        let Some(current) = guard.channels.get(&channel_id).cloned() else {
            return false;
        };
        if current.status == status {
            return true;
        }

        let mut updated = (*current).clone();
        updated.status = status;
        Self::apply(&mut guard, updated);
        true
    }

    /// 用新的渠道快照替换缓存条目, 保留轮询游标
    pub async fn replace_channel(&self, channel: Channel) {
        if !self.memory_enabled {
            return;
        }

        let mut guard = self.snapshot.write().await;
        if let Some(prev) = guard.channels.get(&channel.id) {
            channel.set_polling_cursor(prev.polling_cursor());
        }
        Self::apply(&mut guard, channel);
    }

    fn apply(snapshot: &mut RegistrySnapshot, channel: Channel) {
        let channel = Arc::new(channel);
        snapshot.remove_from_index(channel.id);
        snapshot.channels.insert(channel.id, Arc::clone(&channel));
        if channel.is_enabled() {
            snapshot.insert_into_index(&channel);
        }
    }

    /// 当前快照中所有渠道的 ID; 关闭内存缓存时查询数据库
    pub async fn channel_ids(&self) -> Result<HashSet<i32>> {
        if self.memory_enabled {
            return Ok(self.snapshot.read().await.channels.keys().copied().collect());
        }

        let rows = channels::Entity::find().all(self.db.as_ref()).await?;
        Ok(rows.into_iter().map(|c| c.id).collect())
    }

    /// 释放快照
    pub async fn close(&self) {
        *self.snapshot.write().await = RegistrySnapshot::default();
        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::ChannelRegistry,
            "close",
            "渠道注册表已关闭"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ChannelFixture;

    fn channel(id: i32, priority: i64, status: ChannelStatus) -> Channel {
        let model = ChannelFixture::new()
            .groups("default,vip")
            .models("gpt-4o")
            .priority(priority)
            .status(status)
            .to_model_with_id(id);
        Channel::from_model(&model).unwrap()
    }

    #[test]
    fn test_snapshot_index_sorted_and_enabled_only() {
        let snapshot = RegistrySnapshot::build(
            vec![
                channel(1, 5, ChannelStatus::Enabled),
                channel(2, 10, ChannelStatus::Enabled),
                channel(3, 20, ChannelStatus::AutoDisabled),
            ],
            &RegistrySnapshot::default(),
        );

        assert_eq!(snapshot.index["default"]["gpt-4o"], vec![2, 1]);
        assert_eq!(snapshot.index["vip"]["gpt-4o"], vec![2, 1]);
        assert!(snapshot.channels.contains_key(&3));
    }

    #[test]
    fn test_snapshot_carries_polling_cursor() {
        let first = RegistrySnapshot::build(
            vec![channel(1, 0, ChannelStatus::Enabled)],
            &RegistrySnapshot::default(),
        );
        first.channels[&1].set_polling_cursor(2);

        let second = RegistrySnapshot::build(vec![channel(1, 0, ChannelStatus::Enabled)], &first);
        assert_eq!(second.channels[&1].polling_cursor(), 2);
    }

    #[test]
    fn test_apply_removes_and_reinserts() {
        let mut snapshot = RegistrySnapshot::build(
            vec![
                channel(1, 5, ChannelStatus::Enabled),
                channel(2, 10, ChannelStatus::Enabled),
            ],
            &RegistrySnapshot::default(),
        );

        ChannelRegistry::apply(&mut snapshot, channel(2, 10, ChannelStatus::ManuallyDisabled));
        assert_eq!(snapshot.index["default"]["gpt-4o"], vec![1]);

        ChannelRegistry::apply(&mut snapshot, channel(2, 10, ChannelStatus::Enabled));
        assert_eq!(snapshot.index["default"]["gpt-4o"], vec![2, 1]);
    }
}
