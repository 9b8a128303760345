//! # 订阅模块
//!
//! 订阅额度的预扣与退款、套餐购买、周期重置与到期处理

mod ledger;
mod maintenance;
pub mod period;
mod plan;

pub use ledger::{AdjustOutcome, PreConsumeOutcome, RefundOutcome, SubscriptionLedger};
pub use plan::DEFAULT_USER_GROUP;
