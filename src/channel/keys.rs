//! 渠道密钥解析
//!
//! 密钥字段支持两种写法: 每行一把密钥, 或 JSON 数组。数组中的对象
//! 元素 (例如服务账号凭证) 会被重新序列化为一把 JSON 字符串密钥。

use serde_json::Value;

/// 解析渠道密钥列表, 忽略空行
#[must_use]
pub fn parse_channel_keys(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        if let Ok(items) = serde_json::from_str::<Vec<Value>>(trimmed) {
            return items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .filter(|k| !k.is_empty())
                .collect();
        }
    }

    trimmed
        .lines()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// 密钥在列表中的下标
#[must_use]
pub fn key_index(keys: &[String], key: &str) -> Option<usize> {
    let key = key.trim();
    keys.iter().position(|k| k == key)
}
