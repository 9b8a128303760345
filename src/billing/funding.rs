//! 扣费来源的选择顺序

use crate::types::{BillingPreference, BillingSource};

/// 按计费偏好与订阅情况给出依次尝试的扣费来源
///
/// 只有前一个来源额度不足时才会尝试下一个; `*_only` 偏好不回退。
#[must_use]
pub fn funding_order(preference: BillingPreference, has_subscription: bool) -> Vec<BillingSource> {
    match preference {
        BillingPreference::SubscriptionFirst if has_subscription => {
            vec![BillingSource::Subscription, BillingSource::Wallet]
        }
        BillingPreference::WalletFirst if has_subscription => {
            vec![BillingSource::Wallet, BillingSource::Subscription]
        }
        BillingPreference::SubscriptionFirst
        | BillingPreference::WalletFirst
        | BillingPreference::WalletOnly => vec![BillingSource::Wallet],
        BillingPreference::SubscriptionOnly => vec![BillingSource::Subscription],
    }
}
