use crate::app::resources::AppResources;
use crate::billing::BillingSettlement;
use crate::channel::{AbilityService, ChannelRegistry, ChannelService};
use crate::error::{Context, Result};
use crate::key_pool::{MultiKeyRotator, PollingLockArena};
use crate::quota::{BatchUpdater, QuotaLedger, TokenService};
use crate::scheduler::ChannelSelector;
use crate::subscription::SubscriptionLedger;
use crate::task::AsyncTaskReconciler;
use std::sync::Arc;

/// 业务服务集合：渠道、额度、订阅、计费与异步任务
///
/// 职责：
/// - 管理核心业务逻辑服务（Service 层）
/// - 不包含任务调度逻辑（Task 层由 `AppTasks` 管理）
pub struct AppServices {
    registry: Arc<ChannelRegistry>,
    selector: Arc<ChannelSelector>,
    rotator: Arc<MultiKeyRotator>,
    channel_service: Arc<ChannelService>,
    ability_service: Arc<AbilityService>,
    batch: Option<Arc<BatchUpdater>>,
    quota: Arc<QuotaLedger>,
    tokens: Arc<TokenService>,
    subscriptions: Arc<SubscriptionLedger>,
    billing: Arc<BillingSettlement>,
    reconciler: Arc<AsyncTaskReconciler>,
}

impl AppServices {
    /// 根据基础资源初始化业务服务, 并加载首份渠道快照
    pub async fn initialize(resources: &Arc<AppResources>) -> Result<Arc<Self>> {
        let config = resources.config();
        let database = resources.database();
        let cache = resources.cache();

        let registry = Arc::new(ChannelRegistry::new(database.clone(), &config.channel));
        registry.initialize().await.context("渠道快照加载失败")?;

        let selector = Arc::new(ChannelSelector::new(
            registry.clone(),
            config.channel.auto_groups.clone(),
        ));
        let rotator = Arc::new(MultiKeyRotator::new(
            database.clone(),
            registry.clone(),
            Arc::new(PollingLockArena::new()),
        ));
        let channel_service = Arc::new(ChannelService::new(
            database.clone(),
            registry.clone(),
            rotator.clone(),
        ));
        let ability_service = Arc::new(AbilityService::new(database.clone()));

        let batch = config
            .quota
            .batch_update_enabled
            .then(|| Arc::new(BatchUpdater::new(database.clone())));
        let quota = Arc::new(QuotaLedger::new(database.clone(), cache.clone(), batch.clone()));
        let tokens = Arc::new(TokenService::new(database.clone(), cache));

        let subscriptions = Arc::new(SubscriptionLedger::new(database.clone()));
        let billing = Arc::new(
            BillingSettlement::new(database.clone(), quota.clone(), subscriptions.clone())
                .with_default_estimate(config.quota.pre_consume_estimate),
        );
        let reconciler = Arc::new(AsyncTaskReconciler::new(
            database,
            quota.clone(),
            subscriptions.clone(),
            config.task.timeout_secs,
        ));

        Ok(Arc::new(Self {
            registry,
            selector,
            rotator,
            channel_service,
            ability_service,
            batch,
            quota,
            tokens,
            subscriptions,
            billing,
            reconciler,
        }))
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ChannelRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn selector(&self) -> Arc<ChannelSelector> {
        Arc::clone(&self.selector)
    }

    #[must_use]
    pub fn rotator(&self) -> Arc<MultiKeyRotator> {
        Arc::clone(&self.rotator)
    }

    #[must_use]
    pub fn channel_service(&self) -> Arc<ChannelService> {
        Arc::clone(&self.channel_service)
    }

    #[must_use]
    pub fn ability_service(&self) -> Arc<AbilityService> {
        Arc::clone(&self.ability_service)
    }

    /// 未启用批量写回时为 `None`
    #[must_use]
    pub fn batch(&self) -> Option<Arc<BatchUpdater>> {
        self.batch.clone()
    }

    #[must_use]
    pub fn quota(&self) -> Arc<QuotaLedger> {
        Arc::clone(&self.quota)
    }

    #[must_use]
    pub fn tokens(&self) -> Arc<TokenService> {
        Arc::clone(&self.tokens)
    }

    #[must_use]
    pub fn subscriptions(&self) -> Arc<SubscriptionLedger> {
        Arc::clone(&self.subscriptions)
    }

    #[must_use]
    pub fn billing(&self) -> Arc<BillingSettlement> {
        Arc::clone(&self.billing)
    }

    #[must_use]
    pub fn reconciler(&self) -> Arc<AsyncTaskReconciler> {
        Arc::clone(&self.reconciler)
    }
}
