//! # 实体定义测试
//!
//! 测试实体上的 JSON 辅助方法与状态枚举

#[cfg(test)]
mod tests {
    use crate::{channels, tasks, tokens, user_subscriptions, users};
    use sea_orm::{ActiveEnum, Set};

    fn channel_with_info(info: Option<&str>) -> channels::Model {
        channels::Model {
            id: 1,
            channel_type: 1,
            name: "openai".to_string(),
            key: "sk-a\nsk-b".to_string(),
            status: channels::ChannelStatus::Enabled,
            priority: 0,
            weight: 0,
            group: "default, vip,".to_string(),
            models: "gpt-4o,gpt-4o-mini".to_string(),
            tag: None,
            base_url: None,
            model_mapping: None,
            organization: None,
            auto_ban: true,
            used_quota: 0,
            channel_info: info.map(ToString::to_string),
            created_at: chrono::Utc::now().naive_utc(),
            updated_at: chrono::Utc::now().naive_utc(),
        }
    }

    #[tokio::test]
    async fn test_channel_lists_and_info() {
        let channel = channel_with_info(Some(
            r#"{"is_multi_key":true,"multi_key_size":2,"multi_key_status_list":{"1":"auto_disabled"},"multi_key_mode":"polling"}"#,
        ));

        assert_eq!(channel.groups(), vec!["default", "vip"]);
        assert_eq!(channel.model_list(), vec!["gpt-4o", "gpt-4o-mini"]);

        let info = channel.get_channel_info().unwrap();
        assert!(info.is_multi_key);
        assert_eq!(info.multi_key_mode, channels::MultiKeyMode::Polling);
        assert_eq!(info.key_status(0), channels::ChannelStatus::Enabled);
        assert_eq!(info.key_status(1), channels::ChannelStatus::AutoDisabled);
    }

    #[tokio::test]
    async fn test_channel_info_defaults_when_missing() {
        let channel = channel_with_info(None);
        let info = channel.get_channel_info().unwrap();
        assert!(!info.is_multi_key);
        assert_eq!(info.multi_key_mode, channels::MultiKeyMode::Random);
    }

    #[tokio::test]
    async fn test_status_enum_values() {
        assert_eq!(channels::ChannelStatus::AutoDisabled.to_value(), "auto_disabled");
        assert_eq!(
            tasks::TaskStatus::try_from_value(&"in_progress".to_string()).unwrap(),
            tasks::TaskStatus::InProgress
        );
        assert!(tasks::TaskStatus::try_from_value(&"bogus".to_string()).is_err());
        assert!(tasks::TaskStatus::Success.is_terminal());
        assert!(!tasks::TaskStatus::Queued.is_terminal());
    }

    #[tokio::test]
    async fn test_user_billing_preference() {
        let mut user = users::Model {
            id: 1,
            username: "alice".to_string(),
            group: "default".to_string(),
            quota: 0,
            used_quota: 0,
            request_count: 0,
            status: users::UserStatus::Enabled,
            setting: None,
            created_at: chrono::Utc::now().naive_utc(),
            updated_at: chrono::Utc::now().naive_utc(),
        };
        assert_eq!(user.billing_preference(), users::BillingPreference::SubscriptionFirst);

        user.setting = Some(r#"{"billing_preference":"wallet_only"}"#.to_string());
        assert_eq!(user.billing_preference(), users::BillingPreference::WalletOnly);

        user.setting = Some("not json".to_string());
        assert_eq!(user.billing_preference(), users::BillingPreference::SubscriptionFirst);
    }

    #[tokio::test]
    async fn test_token_helpers() {
        let token = tokens::ActiveModel {
            key: Set("sk-token".to_string()),
            remain_quota: Set(0),
            unlimited_quota: Set(false),
            ..Default::default()
        };
        assert_eq!(token.key.as_ref(), "sk-token");

        let model = tokens::Model {
            id: 1,
            user_id: 1,
            key: "sk-token".to_string(),
            name: "default".to_string(),
            status: tokens::TokenStatus::Enabled,
            remain_quota: 0,
            used_quota: 0,
            unlimited_quota: false,
            expired_time: 100,
            model_limits_enabled: true,
            model_limits: Some("gpt-4o, claude-3".to_string()),
            allow_ips: None,
            group: None,
            accessed_time: 0,
            created_at: chrono::Utc::now().naive_utc(),
        };
        assert!(model.is_exhausted());
        assert!(model.is_expired_at(101));
        assert!(!model.is_expired_at(100));
        assert_eq!(model.model_limit_list(), vec!["gpt-4o", "claude-3"]);
    }

    #[tokio::test]
    async fn test_subscription_remaining() {
        let sub = user_subscriptions::Model {
            id: 1,
            user_id: 1,
            plan_id: 1,
            amount_total: 100,
            amount_used: 40,
            start_time: 0,
            end_time: 10,
            status: user_subscriptions::SubscriptionStatus::Active,
            source: "admin".to_string(),
            last_reset_time: 0,
            next_reset_time: 0,
            upgrade_group: Some("  ".to_string()),
            prev_user_group: None,
            created_at: chrono::Utc::now().naive_utc(),
            updated_at: chrono::Utc::now().naive_utc(),
        };
        assert_eq!(sub.remaining(), Some(60));
        assert!(sub.can_afford(60));
        assert!(!sub.can_afford(61));
        assert_eq!(sub.upgrade_group(), None);

        let unlimited = user_subscriptions::Model { amount_total: 0, ..sub };
        assert!(unlimited.can_afford(i64::MAX));
    }

    #[tokio::test]
    async fn test_task_private_data_round_trip() {
        let mut task = tasks::Model {
            id: 1,
            task_id: "task_1".to_string(),
            platform: "video".to_string(),
            user_id: 1,
            group: "default".to_string(),
            channel_id: 1,
            quota: 5000,
            action: "generate".to_string(),
            status: tasks::TaskStatus::Submitted,
            fail_reason: None,
            submit_time: 0,
            start_time: 0,
            finish_time: 0,
            progress: "0%".to_string(),
            properties: None,
            private_data: None,
            created_at: chrono::Utc::now().naive_utc(),
            updated_at: chrono::Utc::now().naive_utc(),
        };

        let data = tasks::TaskPrivateData {
            billing_source: tasks::BillingSource::Subscription,
            subscription_id: Some(7),
            billing_context: Some(tasks::TaskBillingContext {
                model_name: "video-1".to_string(),
                model_ratio: 2.0,
                group_ratio: 1.5,
                ..Default::default()
            }),
            ..Default::default()
        };
        task.set_private_data(&data).unwrap();
        let parsed = task.get_private_data().unwrap();
        assert_eq!(parsed, data);
        assert_eq!(parsed.billing_context.unwrap().quota_for_tokens(1000), 3000);
    }
}
