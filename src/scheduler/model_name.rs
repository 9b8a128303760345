//! # 模型名归一化
//!
//! 精确匹配失败时的回退名称。例如 `xxx-thinking` 回退为 `xxx`,
//! gemini 2.5 的 `-thinking-<预算>` 回退为通配名 `-thinking-*`。

use std::sync::LazyLock;

use regex::Regex;

static GEMINI_THINKING_BUDGET: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(gemini-2\.5[\w.\-]*?)-thinking-\d+$").ok());

const GIZMO_PREFIXES: [&str; 2] = ["gpt-4o-gizmo", "gpt-4-gizmo"];

/// 计算模型名的回退名称; 没有可用回退时返回 `None`
#[must_use]
pub fn normalize_model_name(model: &str) -> Option<String> {
    if let Some(caps) = GEMINI_THINKING_BUDGET
        .as_ref()
        .and_then(|re| re.captures(model))
    {
        return Some(format!("{}-thinking-*", &caps[1]));
    }

    if let Some(base) = model.strip_suffix("-thinking") {
        if !base.is_empty() {
            return Some(base.to_string());
        }
    }

    GIZMO_PREFIXES
        .iter()
        .find(|prefix| model.starts_with(*prefix) && model.len() > prefix.len())
        .map(|prefix| format!("{prefix}-*"))
        .filter(|wildcard| wildcard != model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("claude-3-7-sonnet-thinking", Some("claude-3-7-sonnet"))]
    #[case("gemini-2.5-flash-thinking-1024", Some("gemini-2.5-flash-thinking-*"))]
    #[case("gemini-2.5-pro-thinking", Some("gemini-2.5-pro"))]
    #[case("gpt-4-gizmo-g-abc", Some("gpt-4-gizmo-*"))]
    #[case("gpt-4o-gizmo-g-abc", Some("gpt-4o-gizmo-*"))]
    #[case("gpt-4o", None)]
    #[case("-thinking", None)]
    #[case("gpt-4-gizmo-*", None)]
    fn test_normalize_model_name(#[case] input: &str, #[case] expected: Option<&str>) {
        assert_eq!(normalize_model_name(input).as_deref(), expected);
    }
}
