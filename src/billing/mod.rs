//! # 计费模块
//!
//! 扣费来源选择、预扣与结算、消费日志

mod funding;
mod log;
mod settlement;

pub use funding::funding_order;
pub use log::{AuditLogEntry, AuditLogWriter, LogOther};
pub use settlement::{
    BillingRequest, BillingSession, BillingSettlement, SessionState, SettlementOutcome,
};
