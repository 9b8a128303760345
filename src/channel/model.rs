//! # 渠道运行时模型
//!
//! 由 `channels` 表行解析得到的只读快照。多密钥轮询游标是唯一的可变状态,
//! 由轮询锁串行化访问。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use entity::channels::{self, ChannelInfo, ChannelStatus, MultiKeyMode};

use super::keys::parse_channel_keys;
use crate::error::Result;

/// 渠道快照
#[derive(Debug)]
pub struct Channel {
    pub id: i32,
    pub channel_type: i32,
    pub name: String,
    pub status: ChannelStatus,
    pub priority: i64,
    pub weight: u32,
    pub groups: Vec<String>,
    pub models: Vec<String>,
    pub tag: Option<String>,
    pub base_url: Option<String>,
    pub organization: Option<String>,
    pub auto_ban: bool,
    pub model_mapping: BTreeMap<String, String>,
    pub keys: Vec<String>,
    pub info: ChannelInfo,
    polling_cursor: AtomicUsize,
}

impl Channel {
    /// 从数据库行构建快照
    pub fn from_model(model: &channels::Model) -> Result<Self> {
        let info = model.get_channel_info()?;
        let model_mapping = match model.model_mapping.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() && raw != "{}" => serde_json::from_str(raw)?,
            _ => BTreeMap::new(),
        };
        let cursor = info.multi_key_polling_index;

        Ok(Self {
            id: model.id,
            channel_type: model.channel_type,
            name: model.name.clone(),
            status: model.status,
            priority: model.priority,
            weight: u32::try_from(model.weight).unwrap_or(0),
            groups: model.groups(),
            models: model.model_list(),
            tag: model.tag.clone().filter(|t| !t.trim().is_empty()),
            base_url: model.base_url.clone(),
            organization: model.organization.clone(),
            auto_ban: model.auto_ban,
            model_mapping,
            keys: parse_channel_keys(&model.key),
            info,
            polling_cursor: AtomicUsize::new(cursor),
        })
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.status.is_enabled()
    }

    /// 是否按多密钥方式轮换 (声明为多密钥且实际多于一把)
    #[must_use]
    pub fn is_multi_key(&self) -> bool {
        self.info.is_multi_key && self.keys.len() > 1
    }

    #[must_use]
    pub const fn multi_key_mode(&self) -> MultiKeyMode {
        self.info.multi_key_mode
    }

    /// 当前启用的密钥下标
    #[must_use]
    pub fn enabled_key_indices(&self) -> Vec<usize> {
        (0..self.keys.len())
            .filter(|idx| self.info.key_status(*idx).is_enabled())
            .collect()
    }

    /// 是否服务于指定的分组与模型
    #[must_use]
    pub fn serves(&self, group: &str, model: &str) -> bool {
        self.groups.iter().any(|g| g == group) && self.models.iter().any(|m| m == model)
    }

    /// 模型映射后的上游模型名
    #[must_use]
    pub fn upstream_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_mapping
            .get(model)
            .map(String::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or(model)
    }

    #[must_use]
    pub fn polling_cursor(&self) -> usize {
        self.polling_cursor.load(Ordering::Acquire)
    }

    pub fn set_polling_cursor(&self, cursor: usize) {
        self.polling_cursor.store(cursor, Ordering::Release);
    }
}

impl Clone for Channel {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            channel_type: self.channel_type,
            name: self.name.clone(),
            status: self.status,
            priority: self.priority,
            weight: self.weight,
            groups: self.groups.clone(),
            models: self.models.clone(),
            tag: self.tag.clone(),
            base_url: self.base_url.clone(),
            organization: self.organization.clone(),
            auto_ban: self.auto_ban,
            model_mapping: self.model_mapping.clone(),
            keys: self.keys.clone(),
            info: self.info.clone(),
            polling_cursor: AtomicUsize::new(self.polling_cursor()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ChannelFixture;

    #[test]
    fn test_from_model_parses_lists_and_mapping() {
        let model = ChannelFixture::new()
            .groups("default, vip")
            .models("gpt-4o,claude-3")
            .keys("k1\nk2")
            .model_mapping(r#"{"gpt-4o":"gpt-4o-2024-08-06"}"#)
            .to_model_with_id(3);
        let channel = Channel::from_model(&model).unwrap();

        assert_eq!(channel.groups, vec!["default", "vip"]);
        assert_eq!(channel.keys.len(), 2);
        assert!(channel.serves("vip", "claude-3"));
        assert!(!channel.serves("free", "claude-3"));
        assert_eq!(channel.upstream_model("gpt-4o"), "gpt-4o-2024-08-06");
        assert_eq!(channel.upstream_model("claude-3"), "claude-3");
        assert!(!channel.is_multi_key());
    }

    #[test]
    fn test_negative_weight_clamped() {
        let model = ChannelFixture::new().weight(-5).to_model_with_id(1);
        assert_eq!(Channel::from_model(&model).unwrap().weight, 0);
    }

    #[test]
    fn test_clone_copies_cursor() {
        let model = ChannelFixture::new()
            .keys("a\nb\nc")
            .multi_key(MultiKeyMode::Polling)
            .to_model_with_id(1);
        let channel = Channel::from_model(&model).unwrap();
        channel.set_polling_cursor(2);
        let copy = channel.clone();
        assert_eq!(copy.polling_cursor(), 2);
        copy.set_polling_cursor(0);
        assert_eq!(channel.polling_cursor(), 2);
    }
}
