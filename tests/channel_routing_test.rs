//! # 渠道路由集成测试
//!
//! 覆盖 注册表 -> 选择器 -> 多密钥轮换 -> 状态变更 的完整链路

use std::collections::HashSet;
use std::sync::Arc;

use entity::abilities;
use entity::channels::{self, ChannelStatus, MultiKeyMode};
use gateway_core::channel::{
    AbilityService, ChannelRegistry, ChannelService, setup_context_for_selected_channel,
};
use gateway_core::config::ChannelConfig;
use gateway_core::error::ChannelError;
use gateway_core::key_pool::{KeyStrategy, MultiKeyRotator, PollingLockArena};
use gateway_core::scheduler::{AUTO_GROUP, ChannelSelector};
use gateway_core::testing::{ChannelFixture, create_test_db, init_test_env};
use pretty_assertions::assert_eq;
use rand::SeedableRng;
use rand::rngs::StdRng;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};

struct Routing {
    db: Arc<DatabaseConnection>,
    registry: Arc<ChannelRegistry>,
    rotator: Arc<MultiKeyRotator>,
    service: ChannelService,
}

async fn routing(memory_cache_enabled: bool, seed: Vec<ChannelFixture>) -> (Routing, Vec<channels::Model>) {
    init_test_env();
    let db = Arc::new(create_test_db().await.unwrap());
    let mut inserted = Vec::new();
    for fixture in seed {
        inserted.push(fixture.to_active_model().insert(db.as_ref()).await.unwrap());
    }

    let config = ChannelConfig {
        memory_cache_enabled,
        auto_groups: vec!["default".to_string(), "vip".to_string()],
        ..ChannelConfig::default()
    };
    let registry = Arc::new(ChannelRegistry::new(Arc::clone(&db), &config));
    registry.initialize().await.unwrap();
    let rotator = Arc::new(MultiKeyRotator::new(
        Arc::clone(&db),
        Arc::clone(&registry),
        Arc::new(PollingLockArena::new()),
    ));
    let service = ChannelService::new(Arc::clone(&db), Arc::clone(&registry), Arc::clone(&rotator));
    (
        Routing {
            db,
            registry,
            rotator,
            service,
        },
        inserted,
    )
}

fn selector(r: &Routing) -> ChannelSelector {
    ChannelSelector::new(
        Arc::clone(&r.registry),
        vec!["default".to_string(), "vip".to_string()],
    )
}

#[tokio::test]
async fn test_priority_tiers_with_retries() {
    let (r, rows) = routing(
        true,
        vec![
            ChannelFixture::new().name("a").priority(10).weight(1),
            ChannelFixture::new().name("b").priority(10).weight(1),
            ChannelFixture::new().name("c").priority(5).weight(1),
        ],
    )
    .await;
    let low = rows[2].id;
    let selector = selector(&r);

    let mut first_try = HashSet::new();
    for seed in 0..64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let (channel, group) = selector
            .select_channel_with_rng("default", "gpt-4o", 0, &mut rng)
            .await
            .unwrap();
        assert_eq!(group, "default");
        first_try.insert(channel.id);
    }
    assert_eq!(first_try, HashSet::from([rows[0].id, rows[1].id]));

    for retry in [1, 2, 7] {
        let mut rng = StdRng::seed_from_u64(retry as u64);
        let (channel, _) = selector
            .select_channel_with_rng("default", "gpt-4o", retry, &mut rng)
            .await
            .unwrap();
        assert_eq!(channel.id, low);
    }
}

#[tokio::test]
async fn test_auto_group_tries_configured_order() {
    let (r, rows) = routing(
        true,
        vec![ChannelFixture::new().name("vip-only").groups("vip").models("claude-3")],
    )
    .await;
    let selector = selector(&r);

    let (channel, group) = selector.select_channel(AUTO_GROUP, "claude-3", 0).await.unwrap();
    assert_eq!(channel.id, rows[0].id);
    assert_eq!(group, "vip");

    let err = selector.select_channel(AUTO_GROUP, "gpt-4o", 0).await.unwrap_err();
    assert!(matches!(
        err.as_channel(),
        Some(ChannelError::AutoGroupsExhausted { .. })
    ));
    let err = selector.select_channel("default", "claude-3", 0).await.unwrap_err();
    assert!(matches!(
        err.as_channel(),
        Some(ChannelError::NoAvailableChannel { .. })
    ));
}

#[tokio::test]
async fn test_polling_covers_keys_in_order() {
    for memory_cache_enabled in [true, false] {
        let (r, rows) = routing(
            memory_cache_enabled,
            vec![
                ChannelFixture::new()
                    .name("multi")
                    .keys("k0\nk1\nk2")
                    .multi_key(MultiKeyMode::Polling),
            ],
        )
        .await;
        let channel = r.registry.get_channel(rows[0].id).await.unwrap();

        let mut picked = Vec::new();
        for _ in 0..4 {
            let selection = r.rotator.next_enabled_key(&channel).await.unwrap();
            assert_eq!(selection.strategy, KeyStrategy::Polling);
            picked.push(selection.key);
        }
        assert_eq!(picked, vec!["k0", "k1", "k2", "k0"], "memory = {memory_cache_enabled}");
    }
}

#[tokio::test]
async fn test_disabling_last_key_disables_channel() {
    let (r, rows) = routing(
        true,
        vec![
            ChannelFixture::new()
                .name("multi")
                .keys("k0\nk1\nk2")
                .multi_key(MultiKeyMode::Polling),
        ],
    )
    .await;
    let id = rows[0].id;

    assert!(!r.service.update_channel_status(id, Some("k0"), ChannelStatus::AutoDisabled, "401").await.unwrap());
    assert!(!r.service.update_channel_status(id, Some("k1"), ChannelStatus::AutoDisabled, "401").await.unwrap());

    // 剩余的密钥仍可轮询到
    let channel = r.registry.get_channel(id).await.unwrap();
    let selection = r.rotator.next_enabled_key(&channel).await.unwrap();
    assert_eq!(selection.key, "k2");

    assert!(r.service.update_channel_status(id, Some("k2"), ChannelStatus::AutoDisabled, "401").await.unwrap());
    let row = channels::Entity::find_by_id(id).one(r.db.as_ref()).await.unwrap().unwrap();
    assert_eq!(row.status, ChannelStatus::AutoDisabled);
    assert!(r.registry.candidates("default", "gpt-4o").await.unwrap().is_empty());

    // 任一密钥恢复后渠道随之恢复
    assert!(r.service.update_channel_status(id, Some("k1"), ChannelStatus::Enabled, "").await.unwrap());
    let row = channels::Entity::find_by_id(id).one(r.db.as_ref()).await.unwrap().unwrap();
    assert_eq!(row.status, ChannelStatus::Enabled);
    assert_eq!(r.registry.candidates("default", "gpt-4o").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_auto_ban_off_and_manual_disable_are_respected() {
    let (r, rows) = routing(
        true,
        vec![
            ChannelFixture::new().name("no-ban").auto_ban(false),
            ChannelFixture::new().name("manual"),
        ],
    )
    .await;

    assert!(!r.service.update_channel_status(rows[0].id, None, ChannelStatus::AutoDisabled, "500").await.unwrap());

    r.service
        .set_channel_status_manually(rows[1].id, ChannelStatus::AutoDisabled)
        .await
        .unwrap();
    let row = channels::Entity::find_by_id(rows[1].id).one(r.db.as_ref()).await.unwrap().unwrap();
    assert_eq!(row.status, ChannelStatus::ManuallyDisabled);
    // 自动路径不会改写手动禁用
    assert!(!r.service.update_channel_status(rows[1].id, None, ChannelStatus::Enabled, "ok").await.unwrap());
}

#[tokio::test]
async fn test_selected_channel_context_maps_model() {
    let (r, rows) = routing(
        true,
        vec![
            ChannelFixture::new()
                .name("mapped")
                .keys("k0\nk1")
                .multi_key(MultiKeyMode::Random)
                .model_mapping(r#"{"gpt-4o":"gpt-4o-2024-08-06"}"#),
        ],
    )
    .await;
    let (channel, group) = selector(&r).select_channel(AUTO_GROUP, "gpt-4o", 0).await.unwrap();
    let context = setup_context_for_selected_channel(&r.rotator, &channel, &group, "gpt-4o")
        .await
        .unwrap();

    assert_eq!(context.channel_id, rows[0].id);
    assert_eq!(context.group, "default");
    assert_eq!(context.origin_model, "gpt-4o");
    assert_eq!(context.upstream_model, "gpt-4o-2024-08-06");
    assert!(context.is_multi_key);
    assert_eq!(context.key_strategy, KeyStrategy::Random);
    assert!(["k0", "k1"].contains(&context.key.as_str()));
}

#[tokio::test]
async fn test_tag_disable_removes_channels_from_routing() {
    let (r, rows) = routing(
        true,
        vec![
            ChannelFixture::new().name("tagged-a").tag("team-x").priority(10),
            ChannelFixture::new().name("tagged-b").tag("team-x").priority(10),
            ChannelFixture::new().name("plain"),
        ],
    )
    .await;
    AbilityService::new(Arc::clone(&r.db)).rebuild_abilities().await.unwrap();

    let affected = r
        .service
        .set_tag_status_manually("team-x", ChannelStatus::AutoDisabled)
        .await
        .unwrap();
    assert_eq!(affected.len(), 2);

    let ids: Vec<i32> = r
        .registry
        .candidates("default", "gpt-4o")
        .await
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(ids, vec![rows[2].id]);
    let row = channels::Entity::find_by_id(rows[0].id).one(r.db.as_ref()).await.unwrap().unwrap();
    assert_eq!(row.status, ChannelStatus::ManuallyDisabled);
    let enabled = abilities::Entity::find()
        .filter(abilities::Column::Enabled.eq(true))
        .all(r.db.as_ref())
        .await
        .unwrap();
    assert_eq!(enabled.len(), 1);

    r.service
        .set_tag_status_manually("team-x", ChannelStatus::Enabled)
        .await
        .unwrap();
    assert_eq!(r.registry.candidates("default", "gpt-4o").await.unwrap().len(), 3);
    assert!(
        r.service
            .set_tag_status_manually("no-such-tag", ChannelStatus::Enabled)
            .await
            .unwrap()
            .is_empty()
    );
}
