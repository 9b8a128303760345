//! # 渠道模块
//!
//! 渠道快照、注册表、能力表维护以及渠道状态变更

pub mod ability;
pub mod context;
pub mod keys;
pub mod model;
pub mod registry;
pub mod service;

pub use ability::AbilityService;
pub use context::{SelectedChannelContext, setup_context_for_selected_channel};
pub use keys::parse_channel_keys;
pub use model::Channel;
pub use registry::ChannelRegistry;
pub use service::ChannelService;
