//! # 置顶环集成测试
//!
//! 通过 `SchedulerService` 验证指针的封禁前移、管理员置顶与失效自愈

use std::sync::{Arc, Mutex};

use chrono::{TimeDelta, Utc};
use pretty_assertions::assert_eq;
use upstream_scheduler::{
    ConfigSource, InMemoryConfigSource, ProxyError, SchedulerError, SchedulerService,
    config::{CatalogConfig, SchedulerConfig},
    scheduler::{FailureSeverity, PinReason, PinnedChannelInfo},
    types::{ChannelId, ChannelType, CredentialKind, Selection},
};

/// 三个渠道：1 与 3 同优先级但 3 为推广渠道，2 优先级最低
fn source() -> InMemoryConfigSource {
    let raw = r#"
        [[channels]]
        id = 1
        name = "a"
        type = "openai_compatible"
        priority = 0

        [[channels]]
        id = 2
        name = "b"
        type = "openai_compatible"
        priority = 5

        [[channels]]
        id = 3
        name = "c"
        type = "openai_compatible"
        priority = 0
        promotion = true
    "#;
    let catalog: CatalogConfig = toml::from_str(raw).unwrap();
    InMemoryConfigSource::new(catalog.to_snapshot().unwrap())
}

fn selection(channel_id: ChannelId) -> Selection {
    Selection {
        channel_id,
        channel_type: ChannelType::OpenaiCompatible,
        endpoint_id: channel_id * 10,
        base_url: format!("https://upstream-{channel_id}.example.com"),
        credential_kind: CredentialKind::ApiKey,
        credential_id: channel_id * 100,
    }
}

fn recording_service() -> (SchedulerService, Arc<Mutex<Vec<PinnedChannelInfo>>>) {
    let moves = Arc::new(Mutex::new(Vec::new()));
    let sink = moves.clone();
    let service = SchedulerService::new(SchedulerConfig::default())
        .with_pointer_hook(Arc::new(move |info| sink.lock().unwrap().push(info.clone())));
    (service, moves)
}

#[tokio::test]
async fn ring_orders_by_priority_then_promotion() {
    let source = source();
    let (service, moves) = recording_service();
    let now = Utc::now();

    let ring = service
        .refresh_pinned_ring(&source.list_channels().await.unwrap(), now)
        .unwrap();
    assert_eq!(ring, vec![3, 1, 2]);
    assert_eq!(service.pinned_channel(now), Some(3));

    let moves = moves.lock().unwrap();
    assert_eq!(moves.len(), 1);
    assert_eq!(moves[0].reason, PinReason::Invalid);
}

#[tokio::test]
async fn ban_on_pointer_advances_to_next_unbanned() {
    let source = source();
    let (service, moves) = recording_service();
    let now = Utc::now();
    service
        .refresh_pinned_ring(&source.list_channels().await.unwrap(), now)
        .unwrap();

    // 下一个成员 1 已被封禁，指针跳到 2
    service.record_failure(&selection(1), FailureSeverity::Critical, now);
    assert_eq!(service.pinned_channel(now), Some(3));
    let outcome = service.record_failure(&selection(3), FailureSeverity::Critical, now);
    assert!(outcome.ban_triggered);

    let info = service.pinned_channel_info().unwrap();
    assert_eq!(info.channel_id, 2);
    assert_eq!(info.reason, PinReason::Ban);
    assert_eq!(moves.lock().unwrap().last().map(|m| m.channel_id), Some(2));

    // 封禁到期后指针不会自动回退
    let later = now + TimeDelta::hours(1);
    assert!(!service.is_banned(3, later));
    assert_eq!(service.pinned_channel(later), Some(2));
}

#[tokio::test]
async fn pointer_stays_when_every_member_is_banned() {
    let source = source();
    let service = SchedulerService::new(SchedulerConfig::default());
    let now = Utc::now();
    service
        .refresh_pinned_ring(&source.list_channels().await.unwrap(), now)
        .unwrap();

    for id in [1, 2, 3] {
        service.record_failure(&selection(id), FailureSeverity::Critical, now);
    }
    let info = service.pinned_channel_info().unwrap();
    assert_eq!(info.channel_id, 3);
    assert_eq!(service.pinned_channel(now), Some(3));
}

#[tokio::test]
async fn admin_pin_moves_pointer_and_clears_ban() {
    let source = source();
    let service = SchedulerService::new(SchedulerConfig::default());
    let now = Utc::now();

    service.record_failure(&selection(2), FailureSeverity::Critical, now);
    assert!(service.is_banned(2, now));

    assert!(service.admin_pin(&source, 2, now).await.unwrap());
    assert!(!service.is_banned(2, now));
    let info = service.pinned_channel_info().unwrap();
    assert_eq!((info.channel_id, info.reason), (2, PinReason::Manual));

    let err = service.admin_pin(&source, 42, now).await.unwrap_err();
    assert!(matches!(err, ProxyError::UpstreamNotFound { .. }));
}

#[tokio::test]
async fn removed_pointer_self_heals_to_ring_head() {
    let source = source();
    let service = SchedulerService::new(SchedulerConfig::default());
    let now = Utc::now();
    service
        .refresh_pinned_ring(&source.list_channels().await.unwrap(), now)
        .unwrap();
    assert!(service.pin_channel(2, now));

    source.remove_channel(2).unwrap();
    service
        .refresh_pinned_ring(&source.list_channels().await.unwrap(), now)
        .unwrap();

    let info = service.pinned_channel_info().unwrap();
    assert_eq!((info.channel_id, info.reason), (3, PinReason::Invalid));
}

#[tokio::test]
async fn empty_ring_keeps_previous_state() {
    let source = source();
    let service = SchedulerService::new(SchedulerConfig::default());
    let now = Utc::now();
    service
        .refresh_pinned_ring(&source.list_channels().await.unwrap(), now)
        .unwrap();

    let err = service.refresh_pinned_ring(&[], now).unwrap_err();
    assert_eq!(err, SchedulerError::EmptyRing);
    assert_eq!(service.pinned_channel(now), Some(3));
}
