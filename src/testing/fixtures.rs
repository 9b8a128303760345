//! # 测试数据 Fixtures
//!
//! 提供测试用的数据结构和预设数据

use entity::channels::{self, ChannelInfo, ChannelStatus, MultiKeyMode};
use entity::subscription_plans::{self, DurationUnit, ResetPeriod};
use entity::tasks::{self, TaskBillingContext, TaskPrivateData, TaskProperties, TaskStatus};
use entity::tokens::{self, NEVER_EXPIRES, TokenStatus};
use entity::user_subscriptions::{self, SubscriptionStatus};
use entity::users::{self, BillingPreference, UserSetting, UserStatus};
use sea_orm::Set;

use crate::channel::parse_channel_keys;

fn unique_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn now_naive() -> chrono::NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

/// 用户测试数据构建器
pub struct UserFixture {
    pub username: String,
    pub group: String,
    pub quota: i64,
    pub status: UserStatus,
    pub setting: Option<UserSetting>,
}

impl Default for UserFixture {
    fn default() -> Self {
        Self {
            username: format!("user_{}", &unique_suffix()[..12]),
            group: "default".to_string(),
            quota: 0,
            status: UserStatus::Enabled,
            setting: None,
        }
    }
}

impl UserFixture {
    /// 创建新的用户 fixture
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn username(mut self, username: &str) -> Self {
        self.username = username.to_string();
        self
    }

    #[must_use]
    pub fn group(mut self, group: &str) -> Self {
        self.group = group.to_string();
        self
    }

    /// 设置钱包额度
    #[must_use]
    pub const fn quota(mut self, quota: i64) -> Self {
        self.quota = quota;
        self
    }

    #[must_use]
    pub fn billing_preference(mut self, preference: BillingPreference) -> Self {
        self.setting = Some(UserSetting {
            billing_preference: preference,
        });
        self
    }

    fn setting_json(&self) -> Option<String> {
        self.setting
            .as_ref()
            .and_then(|s| serde_json::to_string(s).ok())
    }

    /// 转换为 Sea-ORM ActiveModel
    #[must_use]
    pub fn to_active_model(self) -> users::ActiveModel {
        let setting = self.setting_json();
        users::ActiveModel {
            username: Set(self.username),
            group: Set(self.group),
            quota: Set(self.quota),
            used_quota: Set(0),
            request_count: Set(0),
            status: Set(self.status),
            setting: Set(setting),
            ..Default::default()
        }
    }

    /// 转换为 Model（用于测试断言）
    #[must_use]
    pub fn to_model_with_id(self, id: i32) -> users::Model {
        let setting = self.setting_json();
        users::Model {
            id,
            username: self.username,
            group: self.group,
            quota: self.quota,
            used_quota: 0,
            request_count: 0,
            status: self.status,
            setting,
            created_at: now_naive(),
            updated_at: now_naive(),
        }
    }
}

/// 令牌测试数据构建器
pub struct TokenFixture {
    pub user_id: i32,
    pub key: String,
    pub name: String,
    pub status: TokenStatus,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub expired_time: i64,
    pub model_limits: Option<String>,
    pub allow_ips: Option<String>,
}

impl Default for TokenFixture {
    fn default() -> Self {
        Self {
            user_id: 1,
            key: unique_suffix(),
            name: "test-token".to_string(),
            status: TokenStatus::Enabled,
            remain_quota: 1_000_000,
            unlimited_quota: false,
            expired_time: NEVER_EXPIRES,
            model_limits: None,
            allow_ips: None,
        }
    }
}

impl TokenFixture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn user_id(mut self, user_id: i32) -> Self {
        self.user_id = user_id;
        self
    }

    #[must_use]
    pub fn key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    #[must_use]
    pub const fn status(mut self, status: TokenStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub const fn remain_quota(mut self, quota: i64) -> Self {
        self.remain_quota = quota;
        self
    }

    #[must_use]
    pub const fn unlimited(mut self) -> Self {
        self.unlimited_quota = true;
        self
    }

    #[must_use]
    pub const fn expired_time(mut self, expired_time: i64) -> Self {
        self.expired_time = expired_time;
        self
    }

    /// 开启模型白名单
    #[must_use]
    pub fn model_limits(mut self, models: &str) -> Self {
        self.model_limits = Some(models.to_string());
        self
    }

    #[must_use]
    pub fn allow_ips(mut self, rules: &str) -> Self {
        self.allow_ips = Some(rules.to_string());
        self
    }

    /// 转换为 Sea-ORM ActiveModel
    #[must_use]
    pub fn to_active_model(self) -> tokens::ActiveModel {
        tokens::ActiveModel {
            user_id: Set(self.user_id),
            key: Set(self.key),
            name: Set(self.name),
            status: Set(self.status),
            remain_quota: Set(self.remain_quota),
            used_quota: Set(0),
            unlimited_quota: Set(self.unlimited_quota),
            expired_time: Set(self.expired_time),
            model_limits_enabled: Set(self.model_limits.is_some()),
            model_limits: Set(self.model_limits),
            allow_ips: Set(self.allow_ips),
            group: Set(None),
            accessed_time: Set(0),
            ..Default::default()
        }
    }

    /// 转换为 Model（用于测试断言）
    #[must_use]
    pub fn to_model_with_id(self, id: i32, user_id: i32) -> tokens::Model {
        tokens::Model {
            id,
            user_id,
            key: self.key,
            name: self.name,
            status: self.status,
            remain_quota: self.remain_quota,
            used_quota: 0,
            unlimited_quota: self.unlimited_quota,
            expired_time: self.expired_time,
            model_limits_enabled: self.model_limits.is_some(),
            model_limits: self.model_limits,
            allow_ips: self.allow_ips,
            group: None,
            accessed_time: 0,
            created_at: now_naive(),
        }
    }
}

/// 渠道测试数据构建器
pub struct ChannelFixture {
    pub channel_type: i32,
    pub name: String,
    pub keys: String,
    pub status: ChannelStatus,
    pub priority: i64,
    pub weight: i32,
    pub groups: String,
    pub models: String,
    pub tag: Option<String>,
    pub model_mapping: Option<String>,
    pub auto_ban: bool,
    pub info: ChannelInfo,
}

impl Default for ChannelFixture {
    fn default() -> Self {
        Self {
            channel_type: 1,
            name: "test-channel".to_string(),
            keys: "sk-test-0".to_string(),
            status: ChannelStatus::Enabled,
            priority: 0,
            weight: 0,
            groups: "default".to_string(),
            models: "gpt-4o".to_string(),
            tag: None,
            model_mapping: None,
            auto_ban: true,
            info: ChannelInfo::default(),
        }
    }
}

impl ChannelFixture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// 逗号分隔的分组
    #[must_use]
    pub fn groups(mut self, groups: &str) -> Self {
        self.groups = groups.to_string();
        self
    }

    /// 逗号分隔的模型
    #[must_use]
    pub fn models(mut self, models: &str) -> Self {
        self.models = models.to_string();
        self
    }

    /// 换行分隔或 JSON 数组形式的密钥
    #[must_use]
    pub fn keys(mut self, keys: &str) -> Self {
        self.keys = keys.to_string();
        self
    }

    #[must_use]
    pub fn model_mapping(mut self, mapping: &str) -> Self {
        self.model_mapping = Some(mapping.to_string());
        self
    }

    #[must_use]
    pub const fn weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub const fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn status(mut self, status: ChannelStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }

    #[must_use]
    pub const fn auto_ban(mut self, auto_ban: bool) -> Self {
        self.auto_ban = auto_ban;
        self
    }

    /// 设置为多密钥渠道
    #[must_use]
    pub fn multi_key(mut self, mode: MultiKeyMode) -> Self {
        self.info.is_multi_key = true;
        self.info.multi_key_mode = mode;
        self
    }

    fn info_json(&self) -> Option<String> {
        let mut info = self.info.clone();
        if info.is_multi_key {
            info.multi_key_size = parse_channel_keys(&self.keys).len();
        }
        serde_json::to_string(&info).ok()
    }

    /// 转换为 Sea-ORM ActiveModel
    #[must_use]
    pub fn to_active_model(self) -> channels::ActiveModel {
        let info = self.info_json();
        channels::ActiveModel {
            channel_type: Set(self.channel_type),
            name: Set(self.name),
            key: Set(self.keys),
            status: Set(self.status),
            priority: Set(self.priority),
            weight: Set(self.weight),
            group: Set(self.groups),
            models: Set(self.models),
            tag: Set(self.tag),
            base_url: Set(None),
            model_mapping: Set(self.model_mapping),
            organization: Set(None),
            auto_ban: Set(self.auto_ban),
            used_quota: Set(0),
            channel_info: Set(info),
            ..Default::default()
        }
    }

    /// 转换为 Model（用于测试断言）
    #[must_use]
    pub fn to_model_with_id(self, id: i32) -> channels::Model {
        let info = self.info_json();
        channels::Model {
            id,
            channel_type: self.channel_type,
            name: self.name,
            key: self.keys,
            status: self.status,
            priority: self.priority,
            weight: self.weight,
            group: self.groups,
            models: self.models,
            tag: self.tag,
            base_url: None,
            model_mapping: self.model_mapping,
            organization: None,
            auto_ban: self.auto_ban,
            used_quota: 0,
            channel_info: info,
            created_at: now_naive(),
            updated_at: now_naive(),
        }
    }
}

/// 订阅套餐测试数据构建器
pub struct PlanFixture {
    pub title: String,
    pub enabled: bool,
    pub total_amount: i64,
    pub duration_unit: DurationUnit,
    pub duration_value: i32,
    pub custom_seconds: i64,
    pub reset_period: ResetPeriod,
    pub reset_custom_seconds: i64,
    pub upgrade_group: Option<String>,
    pub max_purchase: i32,
}

impl Default for PlanFixture {
    fn default() -> Self {
        Self {
            title: "monthly".to_string(),
            enabled: true,
            total_amount: 100_000,
            duration_unit: DurationUnit::Month,
            duration_value: 1,
            custom_seconds: 0,
            reset_period: ResetPeriod::Never,
            reset_custom_seconds: 0,
            upgrade_group: None,
            max_purchase: 0,
        }
    }
}

impl PlanFixture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub const fn total_amount(mut self, amount: i64) -> Self {
        self.total_amount = amount;
        self
    }

    #[must_use]
    pub const fn duration(mut self, unit: DurationUnit, value: i32) -> Self {
        self.duration_unit = unit;
        self.duration_value = value;
        self
    }

    #[must_use]
    pub const fn reset_period(mut self, period: ResetPeriod) -> Self {
        self.reset_period = period;
        self
    }

    #[must_use]
    pub fn upgrade_group(mut self, group: &str) -> Self {
        self.upgrade_group = Some(group.to_string());
        self
    }

    #[must_use]
    pub const fn max_purchase(mut self, limit: i32) -> Self {
        self.max_purchase = limit;
        self
    }

    /// 转换为 Sea-ORM ActiveModel
    #[must_use]
    pub fn to_active_model(self) -> subscription_plans::ActiveModel {
        subscription_plans::ActiveModel {
            title: Set(self.title),
            enabled: Set(self.enabled),
            total_amount: Set(self.total_amount),
            duration_unit: Set(self.duration_unit),
            duration_value: Set(self.duration_value),
            custom_seconds: Set(self.custom_seconds),
            quota_reset_period: Set(self.reset_period),
            quota_reset_custom_seconds: Set(self.reset_custom_seconds),
            upgrade_group: Set(self.upgrade_group),
            max_purchase_per_user: Set(self.max_purchase),
            ..Default::default()
        }
    }
}

/// 用户订阅测试数据构建器
pub struct SubscriptionFixture {
    pub user_id: i32,
    pub plan_id: i32,
    pub amount_total: i64,
    pub amount_used: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub status: SubscriptionStatus,
    pub next_reset_time: i64,
    pub upgrade_group: Option<String>,
    pub prev_user_group: Option<String>,
}

impl SubscriptionFixture {
    /// 默认从一分钟前开始, 30 天后结束
    #[must_use]
    pub fn new(user_id: i32, plan_id: i32) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            user_id,
            plan_id,
            amount_total: 100_000,
            amount_used: 0,
            start_time: now - 60,
            end_time: now + 30 * 86_400,
            status: SubscriptionStatus::Active,
            next_reset_time: 0,
            upgrade_group: None,
            prev_user_group: None,
        }
    }

    #[must_use]
    pub const fn amount_total(mut self, amount: i64) -> Self {
        self.amount_total = amount;
        self
    }

    #[must_use]
    pub const fn amount_used(mut self, amount: i64) -> Self {
        self.amount_used = amount;
        self
    }

    #[must_use]
    pub const fn end_time(mut self, end_time: i64) -> Self {
        self.end_time = end_time;
        self
    }

    #[must_use]
    pub const fn next_reset_time(mut self, next_reset_time: i64) -> Self {
        self.next_reset_time = next_reset_time;
        self
    }

    #[must_use]
    pub const fn status(mut self, status: SubscriptionStatus) -> Self {
        self.status = status;
        self
    }

    /// 设置升级分组与升级前分组
    #[must_use]
    pub fn upgrade(mut self, group: Option<&str>, prev: Option<&str>) -> Self {
        self.upgrade_group = group.map(ToString::to_string);
        self.prev_user_group = prev.map(ToString::to_string);
        self
    }

    /// 转换为 Sea-ORM ActiveModel
    #[must_use]
    pub fn to_active_model(self) -> user_subscriptions::ActiveModel {
        user_subscriptions::ActiveModel {
            user_id: Set(self.user_id),
            plan_id: Set(self.plan_id),
            amount_total: Set(self.amount_total),
            amount_used: Set(self.amount_used),
            start_time: Set(self.start_time),
            end_time: Set(self.end_time),
            status: Set(self.status),
            source: Set("test".to_string()),
            last_reset_time: Set(self.start_time),
            next_reset_time: Set(self.next_reset_time),
            upgrade_group: Set(self.upgrade_group),
            prev_user_group: Set(self.prev_user_group),
            ..Default::default()
        }
    }
}

/// 异步任务测试数据构建器
pub struct TaskFixture {
    pub task_id: String,
    pub user_id: i32,
    pub channel_id: i32,
    pub quota: i64,
    pub status: TaskStatus,
    pub submit_time: i64,
    pub private_data: TaskPrivateData,
}

impl TaskFixture {
    /// 默认为钱包扣费、按 token 计费的已提交任务
    #[must_use]
    pub fn new(task_id: &str, user_id: i32) -> Self {
        Self {
            task_id: task_id.to_string(),
            user_id,
            channel_id: 1,
            quota: 0,
            status: TaskStatus::Submitted,
            submit_time: chrono::Utc::now().timestamp(),
            private_data: TaskPrivateData {
                billing_context: Some(TaskBillingContext {
                    model_name: "test-model".to_string(),
                    model_ratio: 1.0,
                    group_ratio: 1.0,
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }

    #[must_use]
    pub const fn quota(mut self, quota: i64) -> Self {
        self.quota = quota;
        self
    }

    #[must_use]
    pub const fn status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub const fn submit_time(mut self, submit_time: i64) -> Self {
        self.submit_time = submit_time;
        self
    }

    #[must_use]
    pub const fn token_id(mut self, token_id: i32) -> Self {
        self.private_data.token_id = Some(token_id);
        self
    }

    #[must_use]
    pub fn billing_context(mut self, context: TaskBillingContext) -> Self {
        self.private_data.billing_context = Some(context);
        self
    }

    /// 按次计费
    #[must_use]
    pub fn per_call(mut self) -> Self {
        if let Some(context) = self.private_data.billing_context.as_mut() {
            context.per_call_billing = true;
        }
        self
    }

    /// 由订阅扣费
    #[must_use]
    pub fn subscription(mut self, subscription_id: i32, request_id: Option<&str>) -> Self {
        self.private_data.billing_source = entity::tasks::BillingSource::Subscription;
        self.private_data.subscription_id = Some(subscription_id);
        self.private_data.request_id = request_id.map(ToString::to_string);
        self
    }

    /// 转换为 Sea-ORM ActiveModel
    #[must_use]
    pub fn to_active_model(self) -> tasks::ActiveModel {
        tasks::ActiveModel {
            task_id: Set(self.task_id),
            platform: Set("video".to_string()),
            user_id: Set(self.user_id),
            group: Set("default".to_string()),
            channel_id: Set(self.channel_id),
            quota: Set(self.quota),
            action: Set("generate".to_string()),
            status: Set(self.status),
            fail_reason: Set(None),
            submit_time: Set(self.submit_time),
            start_time: Set(0),
            finish_time: Set(0),
            progress: Set("0%".to_string()),
            properties: Set(serde_json::to_string(&TaskProperties::default()).ok()),
            private_data: Set(serde_json::to_string(&self.private_data).ok()),
            ..Default::default()
        }
    }
}
