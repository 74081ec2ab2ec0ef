//! # 错误处理测试

use crate::error::{Context, ProbeError, ProxyError, SchedulerError, TransportError};
use std::error::Error;

#[test]
fn test_config_error_creation() {
    let err = ProxyError::config("测试配置错误");
    assert!(matches!(err, ProxyError::Config { .. }));
    assert_eq!(err.to_string(), "配置错误: 测试配置错误");
}

#[test]
fn test_config_error_with_source() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "文件不存在");
    let err = ProxyError::config_with_source("配置文件加载失败", io_err);

    assert!(err.to_string().contains("配置错误: 配置文件加载失败"));
    assert!(err.source().is_some());
}

#[test]
fn test_context_trait_wraps_source() {
    let result: Result<(), std::io::Error> = Err(std::io::Error::new(
        std::io::ErrorKind::PermissionDenied,
        "权限不足",
    ));

    let err = result.context("读取配置文件失败").unwrap_err();
    assert!(matches!(err, ProxyError::Context { .. }));
    assert!(err.to_string().starts_with("读取配置文件失败"));
    assert!(err.source().is_some());
}

#[test]
fn test_auto_conversion_from_toml_error() {
    let toml_err = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
    let proxy_err: ProxyError = toml_err.into();

    assert!(matches!(proxy_err, ProxyError::Config { .. }));
    assert!(proxy_err.to_string().contains("配置错误: TOML解析失败"));
}

#[test]
fn test_scheduler_errors_map_to_distinct_kinds() {
    let missing: ProxyError = SchedulerError::EndpointNotFound { channel_id: 7 }.into();
    assert!(matches!(missing, ProxyError::UpstreamNotFound { .. }));

    let empty: ProxyError = SchedulerError::NoEligibleSelection { channel_id: 7 }.into();
    assert!(matches!(empty, ProxyError::UpstreamNotAvailable { .. }));
    assert!(empty.source().is_some());

    let ring: ProxyError = SchedulerError::EmptyRing.into();
    assert!(matches!(ring, ProxyError::Config { .. }));
}

#[test]
fn test_transport_errors_split_config_and_network() {
    let bad_url: ProxyError = TransportError::InvalidBaseUrl {
        base_url: "https://".to_string(),
        reason: "empty host".to_string(),
    }
    .into();
    assert!(matches!(bad_url, ProxyError::Config { .. }));

    let body: ProxyError = TransportError::Body("connection reset".to_string()).into();
    assert!(matches!(body, ProxyError::Transport(_)));
    assert!(body.to_string().contains("connection reset"));

    let store: ProxyError = TransportError::Store("lock poisoned".to_string()).into();
    assert!(matches!(store, ProxyError::Internal { .. }));
}

#[test]
fn test_deadline_is_reported_separately() {
    let err = ProxyError::deadline_exceeded("probe batch", 2);
    assert!(err.is_deadline_exceeded());
    assert!(!ProxyError::bad_gateway("boom", Some(502)).is_deadline_exceeded());

    let wrapped: crate::error::Result<()> = Err(err);
    let wrapped = wrapped.context("dispatch").unwrap_err();
    assert!(wrapped.is_deadline_exceeded());
}

#[test]
fn test_probe_failure_keeps_summary_text() {
    let err = ProbeError::Failed {
        summary: "stream probe failed: ok 0/1".to_string(),
        latency_ms: 50,
        results: Vec::new(),
    };
    assert_eq!(err.to_string(), "stream probe failed: ok 0/1");

    let proxy: ProxyError = err.into();
    assert!(matches!(proxy, ProxyError::HealthCheck(ProbeError::Failed { latency_ms: 50, .. })));
}
