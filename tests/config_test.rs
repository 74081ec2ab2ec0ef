//! # 配置加载测试

use std::io::Write;

use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;
use upstream_scheduler::{
    ProxyError,
    config::{self, AppConfig},
    types::{ChannelType, CredentialSecret},
};

fn write(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn sample_config_loads_and_converts() {
    let config = config::load_config_from("config/config.dev.toml").unwrap();
    assert_eq!(config.probe.attempt_timeout_secs, 20);
    assert_eq!(config.dispatch.attempt_limit(), None);

    let snapshot = config.catalog.to_snapshot().unwrap();
    assert_eq!(snapshot.channels.len(), 3);
    assert_eq!(snapshot.endpoints.len(), 3);
    let codex = snapshot
        .channels
        .iter()
        .find(|c| c.channel_type == ChannelType::CodexOauth)
        .unwrap();
    assert!(codex.promotion);
    assert!(snapshot.credentials.iter().any(|c| matches!(
        &c.secret,
        CredentialSecret::OAuth { account_id: Some(id), .. } if id == "acct-dev"
    )));
}

#[test]
fn partial_sections_fall_back_to_defaults() {
    let file = write(
        r#"
        [probe]
        attempt_timeout_secs = 10

        [dispatch]
        max_attempts = 3
        "#,
    );
    let config = config::load_config_from(file.path()).unwrap();
    let defaults = AppConfig::default();
    assert_eq!(config.probe.attempt_timeout_secs, 10);
    assert_eq!(config.probe.batch_cap_secs, defaults.probe.batch_cap_secs);
    assert_eq!(config.dispatch.attempt_limit(), Some(3));
    assert_eq!(config.dispatch.total_timeout_secs, 300);
}

#[test]
fn invalid_values_are_rejected() {
    let file = write(
        r#"
        [probe]
        batch_floor_secs = 30
        batch_cap_secs = 10
        "#,
    );
    let err = config::load_config_from(file.path()).unwrap_err();
    assert!(matches!(err, ProxyError::Config { .. }));
}

#[test]
fn duplicate_channel_ids_are_rejected() {
    let file = write(
        r#"
        [[catalog.channels]]
        id = 1
        name = "a"
        type = "openai_compatible"

        [[catalog.channels]]
        id = 1
        name = "b"
        type = "anthropic"
        "#,
    );
    assert!(config::load_config_from(file.path()).is_err());
}

#[test]
fn credential_without_secret_is_rejected() {
    let file = write(
        r#"
        [[catalog.channels]]
        id = 1
        name = "a"
        type = "codex_oauth"

        [catalog.channels.endpoint]
        id = 10
        base_url = "https://chatgpt.example.com/backend-api/codex"

        [[catalog.channels.credentials]]
        id = 100
        api_key = "not-an-oauth-token"
        "#,
    );
    assert!(config::load_config_from(file.path()).is_err());
}

#[test]
fn probe_batch_timeout_is_clamped() {
    let config = AppConfig::default();
    assert_eq!(config.probe.batch_timeout(0).as_secs(), 20);
    assert_eq!(config.probe.batch_timeout(2).as_secs(), 40);
    assert_eq!(config.probe.batch_timeout(10).as_secs(), 90);
}
