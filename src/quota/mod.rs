//! # 额度模块
//!
//! 钱包与令牌额度账本、批量写回以及令牌校验

pub mod batch;
pub mod ledger;
pub mod token;

pub use batch::{BatchKind, BatchUpdater};
pub use ledger::QuotaLedger;
pub use token::TokenService;
