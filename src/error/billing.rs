use thiserror::Error;

/// 额度与计费相关错误
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("额度变更值不能为负数: {0}")]
    NegativeAmount(i64),

    #[error("请求ID不能为空")]
    EmptyRequestId,

    #[error("用户额度不足: 剩余 {remain}, 需要 {required}")]
    WalletQuotaInsufficient { remain: i64, required: i64 },

    #[error("令牌额度不足: 剩余 {remain}, 需要 {required}")]
    TokenQuotaInsufficient { remain: i64, required: i64 },

    #[error("订阅额度不足")]
    SubscriptionQuotaInsufficient,

    #[error("没有可用的订阅")]
    NoActiveSubscription,

    #[error("用户 #{user_id} 的计费偏好不允许使用{source_name}")]
    PreferenceForbids { user_id: i32, source_name: &'static str },

    #[error("用户不存在: #{0}")]
    UserNotFound(i32),

    #[error("订阅不存在: #{0}")]
    SubscriptionNotFound(i32),

    #[error("订阅套餐不存在或已下架: #{0}")]
    PlanUnavailable(i32),

    #[error("已达到套餐购买上限: {limit}")]
    PurchaseLimitReached { limit: i32 },

    #[error("任务不存在: {0}")]
    TaskNotFound(String),

    #[error("预扣记录不存在: {0}")]
    PreConsumeNotFound(String),

    #[error("预扣记录已退款: {0}")]
    PreConsumeRefunded(String),
}

impl BillingError {
    /// 是否属于额度不足 (可以尝试其他扣费来源)
    #[must_use]
    pub const fn is_insufficient(&self) -> bool {
        matches!(
            self,
            Self::WalletQuotaInsufficient { .. }
                | Self::TokenQuotaInsufficient { .. }
                | Self::SubscriptionQuotaInsufficient
                | Self::NoActiveSubscription
        )
    }
}

/// 令牌校验错误
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("无效的令牌")]
    NotFound,

    #[error("该令牌已被禁用")]
    Disabled,

    #[error("该令牌已过期")]
    Expired,

    #[error("该令牌额度已用尽")]
    Exhausted,

    #[error("该令牌无权使用模型: {model}")]
    ModelNotAllowed { model: String },

    #[error("该令牌不允许来自 {ip} 的访问")]
    IpNotAllowed { ip: String },
}
