//! # Entity 模块
//!
//! 包含网关核心的所有 Sea-ORM 实体定义

pub mod abilities;
pub mod channels;
pub mod logs;
pub mod subscription_plans;
pub mod subscription_pre_consume_records;
pub mod tasks;
pub mod tokens;
pub mod user_subscriptions;
pub mod users;

pub use abilities::Entity as Abilities;
pub use channels::Entity as Channels;
pub use logs::Entity as Logs;
pub use subscription_plans::Entity as SubscriptionPlans;
pub use subscription_pre_consume_records::Entity as SubscriptionPreConsumeRecords;
pub use tasks::Entity as Tasks;
pub use tokens::Entity as Tokens;
pub use user_subscriptions::Entity as UserSubscriptions;
pub use users::Entity as Users;

#[cfg(test)]
mod tests;
