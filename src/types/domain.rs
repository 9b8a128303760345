use std::fmt;

use serde::{Deserialize, Serialize};

pub use entity::tasks::BillingSource;
pub use entity::users::BillingPreference;

pub type UserId = i32;
pub type ChannelId = i32;
pub type TokenId = i32;
pub type SubscriptionId = i32;

/// 额度, 以最小计费单位计
pub type Quota = i64;

/// unix 秒
pub type UnixSeconds = i64;

/// 请求 ID, 幂等操作的去重键
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// 创建请求 ID; 空白字符串返回 `None`
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// 随机生成
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 归一化的上游用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    /// 上游直接给出的最终额度 (按次计价等)
    #[serde(default)]
    pub flat_cost: Option<Quota>,
}

impl Usage {
    #[must_use]
    pub const fn tokens(prompt_tokens: i64, completion_tokens: i64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            flat_cost: None,
        }
    }

    #[must_use]
    pub const fn flat(cost: Quota) -> Self {
        Self {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            flat_cost: Some(cost),
        }
    }

    /// 总 token 数; 上游未给出 total 时由两部分相加
    #[must_use]
    pub const fn total(&self) -> i64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.prompt_tokens.saturating_add(self.completion_tokens)
        }
    }
}
