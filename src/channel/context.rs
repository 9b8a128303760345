//! # 选中渠道的请求上下文
//!
//! 渠道选定后, 下游适配器需要的全部信息: 选中的密钥、映射后的模型名、
//! 基础地址等。

use std::sync::Arc;

use super::model::Channel;
use crate::error::Result;
use crate::key_pool::{KeyStrategy, MultiKeyRotator};

/// 选中渠道的上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedChannelContext {
    pub channel_id: i32,
    pub channel_type: i32,
    pub channel_name: String,
    /// 实际命中的分组 (`auto` 已被解析)
    pub group: String,
    pub base_url: Option<String>,
    pub organization: Option<String>,
    pub key: String,
    pub key_index: usize,
    pub is_multi_key: bool,
    pub key_strategy: KeyStrategy,
    /// 客户端请求的模型名
    pub origin_model: String,
    /// 经模型映射后发往上游的模型名
    pub upstream_model: String,
    pub auto_ban: bool,
    pub tag: Option<String>,
}

/// 为选中的渠道挑选密钥并组装上下文
pub async fn setup_context_for_selected_channel(
    rotator: &MultiKeyRotator,
    channel: &Arc<Channel>,
    group: &str,
    model: &str,
) -> Result<SelectedChannelContext> {
    let selection = rotator.next_enabled_key(channel).await?;

    Ok(SelectedChannelContext {
        channel_id: channel.id,
        channel_type: channel.channel_type,
        channel_name: channel.name.clone(),
        group: group.to_string(),
        base_url: channel.base_url.clone(),
        organization: channel.organization.clone(),
        key: selection.key,
        key_index: selection.index,
        is_multi_key: channel.is_multi_key(),
        key_strategy: selection.strategy,
        origin_model: model.to_string(),
        upstream_model: channel.upstream_model(model).to_string(),
        auto_ban: channel.auto_ban,
        tag: channel.tag.clone(),
    })
}
