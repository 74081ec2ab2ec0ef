//! # 配置管理模块
//!
//! 处理应用配置加载、环境变量覆盖与验证

mod app_config;
mod catalog;

pub use app_config::{
    AppConfig, DefaultProbeModels, DispatchConfig, LoggingConfig, ProbeConfig, SchedulerConfig,
    SeverityWeights, UpstreamConfig,
};
pub use catalog::{
    CatalogConfig, CatalogSnapshot, ChannelEntry, CredentialEntry, EndpointEntry, ModelEntry,
};

use std::env;
use std::path::Path;

use crate::error::{ConfigError, Context, ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::linfo;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "UPSTREAM_SCHEDULER_";

/// 按 `RUST_ENV` 加载 `config/config.{env}.toml`
pub fn load_config() -> Result<AppConfig> {
    let env = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
    let config_file = format!("config/config.{env}.toml");
    load_config_from(&config_file)
}

/// 从指定路径加载配置
pub fn load_config_from(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ProxyError::config(format!(
            "配置文件不存在: {}",
            path.display()
        )));
    }

    let config_content = std::fs::read_to_string(path)
        .with_context(|| format!("读取配置文件失败: {}", path.display()))?;

    let mut config: AppConfig = toml::from_str(&config_content)?;
    apply_env_overrides(&mut config, |key| env::var(key).ok())?;

    // 验证配置的有效性
    config.validate()?;

    linfo!(
        "system",
        LogStage::Configuration,
        LogComponent::Config,
        "config_loaded",
        "配置加载完成",
        path = %path.display(),
        channels = config.catalog.channels.len()
    );
    Ok(config)
}

/// 应用环境变量覆盖
///
/// 读取函数以参数注入，便于测试时不修改进程环境。
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> std::result::Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).map(|v| v.trim().to_string());

    if let Some(level) = get("LOG_LEVEL").filter(|v| !v.is_empty()) {
        config.logging.level = level;
    }
    if let Some(raw) = get("DISPATCH_MAX_ATTEMPTS") {
        config.dispatch.max_attempts = raw
            .parse()
            .map_err(|_| ConfigError::invalid("DISPATCH_MAX_ATTEMPTS", format!("not a number: {raw}")))?;
    }
    if let Some(raw) = get("DISPATCH_TIMEOUT_SECS") {
        config.dispatch.total_timeout_secs = raw
            .parse()
            .map_err(|_| ConfigError::invalid("DISPATCH_TIMEOUT_SECS", format!("not a number: {raw}")))?;
    }
    Ok(())
}
