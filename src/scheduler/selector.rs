//! # 渠道选择器
//!
//! 按 (分组, 模型, 重试次数) 选出一个渠道。`auto` 分组按配置顺序依次尝试
//! 各个分组, 返回第一个有可用渠道的分组。

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::algorithms::select_from_candidates;
use super::model_name::normalize_model_name;
use crate::channel::{Channel, ChannelRegistry};
use crate::error::{ChannelError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lwarn};

/// 自动分组名
pub const AUTO_GROUP: &str = "auto";

/// 渠道选择器
pub struct ChannelSelector {
    registry: Arc<ChannelRegistry>,
    auto_groups: Vec<String>,
}

impl ChannelSelector {
    #[must_use]
    pub fn new(registry: Arc<ChannelRegistry>, auto_groups: Vec<String>) -> Self {
        Self {
            registry,
            auto_groups,
        }
    }

    #[must_use]
    pub fn auto_groups(&self) -> &[String] {
        &self.auto_groups
    }

    /// 选择渠道, 返回渠道与实际命中的分组
    pub async fn select_channel(
        &self,
        group: &str,
        model: &str,
        retry: usize,
    ) -> Result<(Arc<Channel>, String)> {
        let mut rng = StdRng::from_entropy();
        self.select_channel_with_rng(group, model, retry, &mut rng).await
    }

    /// 使用给定随机源选择渠道
    pub async fn select_channel_with_rng<R: Rng + Send + ?Sized>(
        &self,
        group: &str,
        model: &str,
        retry: usize,
        rng: &mut R,
    ) -> Result<(Arc<Channel>, String)> {
        if group == AUTO_GROUP {
            for candidate_group in &self.auto_groups {
                if let Some(channel) = self.select_in_group(candidate_group, model, retry, rng).await? {
                    ldebug!(
                        "system",
                        LogStage::Scheduling,
                        LogComponent::ChannelSelector,
                        "auto_group_hit",
                        "自动分组命中",
                        group = candidate_group.as_str(),
                        model = model,
                        channel_id = channel.id
                    );
                    return Ok((channel, candidate_group.clone()));
                }
            }
            lwarn!(
                "system",
                LogStage::Scheduling,
                LogComponent::ChannelSelector,
                "auto_groups_exhausted",
                "所有自动分组均无可用渠道",
                model = model
            );
            return Err(ChannelError::AutoGroupsExhausted {
                model: model.to_string(),
            }
            .into());
        }

        match self.select_in_group(group, model, retry, rng).await? {
            Some(channel) => Ok((channel, group.to_string())),
            None => Err(ChannelError::NoAvailableChannel {
                group: group.to_string(),
                model: model.to_string(),
            }
            .into()),
        }
    }

    async fn select_in_group<R: Rng + Send + ?Sized>(
        &self,
        group: &str,
        model: &str,
        retry: usize,
        rng: &mut R,
    ) -> Result<Option<Arc<Channel>>> {
        let mut candidates = self.registry.candidates(group, model).await?;
        if candidates.is_empty() {
            if let Some(fallback) = normalize_model_name(model) {
                candidates = self.registry.candidates(group, &fallback).await?;
            }
        }
        if candidates.is_empty() {
            return Ok(None);
        }

        select_from_candidates(&candidates, retry, rng)
            .map(Some)
            .ok_or_else(|| ChannelError::SelectionMissed.into())
    }
}
