//! # Gateway Core
//!
//! LLM API 网关的核心库: 渠道选择、多密钥轮换、额度账本、订阅与计费结算,
//! 以及异步任务的计费对账。

pub mod app;
pub mod billing;
pub mod cache;
pub mod channel;
pub mod config;
pub mod database;
pub mod error;
pub mod key_pool;
pub mod logging;
pub mod quota;
pub mod scheduler;
pub mod subscription;
pub mod task;
pub mod testing;
pub mod types;

// Re-export commonly used types
pub use app::GatewayCore;
pub use config::AppConfig;
pub use error::{GatewayError, Result};
