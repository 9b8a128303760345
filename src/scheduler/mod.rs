//! # 渠道调度模块
//!
//! 优先级分层与加权随机的渠道选择, 以及模型名回退

pub mod algorithms;
pub mod model_name;
pub mod selector;

pub use algorithms::{pick_weighted, priority_tiers, select_from_candidates, tier_for_retry};
pub use model_name::normalize_model_name;
pub use selector::{AUTO_GROUP, ChannelSelector};
