//! # 多密钥轮换模块
//!
//! 从多密钥渠道中挑选密钥 (随机或轮询), 并维护单把密钥的启用状态

pub mod lock_arena;
pub mod rotator;
pub mod types;

pub use lock_arena::PollingLockArena;
pub use rotator::{MultiKeyRotator, next_channel_status, pick_random_key, polling_pick};
pub use types::{KeySelection, KeyStatusChange, KeyStrategy};
