//! # 多密钥轮换类型定义

use std::fmt;
use std::str::FromStr;

use entity::channels::MultiKeyMode;
use serde::{Deserialize, Serialize};

/// 选中的密钥
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySelection {
    /// 密钥内容
    pub key: String,
    /// 在渠道密钥列表中的下标
    pub index: usize,
    /// 选择方式
    pub strategy: KeyStrategy,
}

/// 密钥选择方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// 单密钥渠道
    Single,
    /// 在启用的密钥中均匀随机
    Random,
    /// 按游标顺序轮询
    Polling,
}

impl KeyStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Random => "random",
            Self::Polling => "polling",
        }
    }
}

impl From<MultiKeyMode> for KeyStrategy {
    fn from(mode: MultiKeyMode) -> Self {
        match mode {
            MultiKeyMode::Random => Self::Random,
            MultiKeyMode::Polling => Self::Polling,
        }
    }
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "random" => Ok(Self::Random),
            "polling" | "round_robin" => Ok(Self::Polling),
            _ => Err(format!("Unknown key strategy: {s}")),
        }
    }
}

/// 密钥状态变更结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyStatusChange {
    /// 变更的密钥下标
    pub index: usize,
    /// 渠道整体状态是否随之改变
    pub channel_status_changed: bool,
    /// 变更后仍启用的密钥数量
    pub enabled_keys: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_strategy_parsing() {
        assert_eq!("polling".parse::<KeyStrategy>(), Ok(KeyStrategy::Polling));
        assert_eq!("Random".parse::<KeyStrategy>(), Ok(KeyStrategy::Random));
        assert!("weighted".parse::<KeyStrategy>().is_err());
    }

    #[test]
    fn test_key_strategy_from_mode() {
        assert_eq!(KeyStrategy::from(MultiKeyMode::Polling), KeyStrategy::Polling);
        assert_eq!(KeyStrategy::Random.to_string(), "random");
    }
}
