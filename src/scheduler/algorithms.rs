//! # 渠道选择算法
//!
//! 优先级分层 + 层内加权随机。每个渠道的实际权重为 `weight + 10`,
//! 权重为 0 的渠道仍有被选中的机会。

use std::sync::Arc;

use rand::Rng;

use crate::channel::Channel;

/// 权重平滑值
pub const WEIGHT_SMOOTHING: u64 = 10;

/// 去重后按降序排列的优先级层
#[must_use]
pub fn priority_tiers(candidates: &[Arc<Channel>]) -> Vec<i64> {
    let mut tiers: Vec<i64> = candidates.iter().map(|c| c.priority).collect();
    tiers.sort_unstable_by(|a, b| b.cmp(a));
    tiers.dedup();
    tiers
}

/// 第 `retry` 次重试使用的层下标, 超出时停在最后一层
#[must_use]
pub fn tier_for_retry(tier_count: usize, retry: usize) -> usize {
    retry.min(tier_count.saturating_sub(1))
}

/// 按 `weight + 10` 加权随机, 返回下标
pub fn pick_weighted<R: Rng + ?Sized>(weights: &[u32], rng: &mut R) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }
    let total: u64 = weights
        .iter()
        .map(|w| u64::from(*w) + WEIGHT_SMOOTHING)
        .sum();
    let mut point = rng.gen_range(0..total);
    for (idx, weight) in weights.iter().enumerate() {
        let weight = u64::from(*weight) + WEIGHT_SMOOTHING;
        if point < weight {
            return Some(idx);
        }
        point -= weight;
    }
    None
}

/// 从候选渠道中按重试次数选出一个
#[must_use]
pub fn select_from_candidates<R: Rng + ?Sized>(
    candidates: &[Arc<Channel>],
    retry: usize,
    rng: &mut R,
) -> Option<Arc<Channel>> {
    let tiers = priority_tiers(candidates);
    let tier = *tiers.get(tier_for_retry(tiers.len(), retry))?;

    let in_tier: Vec<&Arc<Channel>> = candidates.iter().filter(|c| c.priority == tier).collect();
    let weights: Vec<u32> = in_tier.iter().map(|c| c.weight).collect();
    pick_weighted(&weights, rng).map(|idx| Arc::clone(in_tier[idx]))
}
