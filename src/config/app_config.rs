//! # 应用配置结构定义

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::catalog::CatalogConfig;
use crate::error::ConfigError;
use crate::types::ChannelType;

/// 应用主配置结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
    /// 运行时状态与封禁策略
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// 健康探测
    #[serde(default)]
    pub probe: ProbeConfig,
    /// 实时流量分发
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// 上游 HTTP 客户端
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// 渠道目录
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 默认日志级别，`RUST_LOG` 存在时被覆盖
    pub level: String,
    /// 输出 JSON 格式
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// 失败严重度权重
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityWeights {
    /// 凭证级问题（401/402/403/429）
    pub minor: u32,
    /// 其他可重试的上游错误
    pub major: u32,
}

impl Default for SeverityWeights {
    fn default() -> Self {
        Self { minor: 1, major: 2 }
    }
}

/// 运行时状态与封禁配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 失败分达到该值时封禁渠道
    pub failure_threshold: u32,
    /// 严重度权重
    #[serde(default)]
    pub severity_weights: SeverityWeights,
    /// 首次封禁时长（秒），随连续封禁次数指数增长
    pub ban_base_secs: u64,
    /// 封禁时长上限（秒）
    pub ban_cap_secs: u64,
    /// 连续封禁计数上限
    pub ban_streak_cap: u32,
    /// 凭证可重试失败后的冷却时长（秒），429 翻倍
    pub credential_cooldown_secs: u64,
    /// 封禁到期后探测认领的有效期（秒）
    pub probe_claim_ttl_secs: u64,
    /// 探测失败后重新封禁的时长（秒）
    pub probe_failure_ban_secs: u64,
    /// 会话路由绑定的有效期（秒）
    pub binding_ttl_secs: u64,
    /// 用户渠道亲和的有效期（秒）
    pub affinity_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 4,
            severity_weights: SeverityWeights::default(),
            ban_base_secs: 15,
            ban_cap_secs: 600,
            ban_streak_cap: 20,
            credential_cooldown_secs: 30,
            probe_claim_ttl_secs: 30,
            probe_failure_ban_secs: 30,
            binding_ttl_secs: 3600,
            affinity_ttl_secs: 1800,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub const fn ban_base(&self) -> Duration {
        Duration::from_secs(self.ban_base_secs)
    }

    #[must_use]
    pub const fn ban_cap(&self) -> Duration {
        Duration::from_secs(self.ban_cap_secs)
    }

    #[must_use]
    pub const fn credential_cooldown(&self) -> Duration {
        Duration::from_secs(self.credential_cooldown_secs)
    }

    #[must_use]
    pub const fn probe_claim_ttl(&self) -> Duration {
        Duration::from_secs(self.probe_claim_ttl_secs)
    }

    #[must_use]
    pub const fn probe_failure_ban(&self) -> Duration {
        Duration::from_secs(self.probe_failure_ban_secs)
    }

    #[must_use]
    pub const fn binding_ttl(&self) -> Duration {
        Duration::from_secs(self.binding_ttl_secs)
    }

    #[must_use]
    pub const fn affinity_ttl(&self) -> Duration {
        Duration::from_secs(self.affinity_ttl_secs)
    }
}

/// 各渠道类型的默认探测模型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultProbeModels {
    pub openai_compatible: String,
    pub anthropic: String,
    pub codex_oauth: String,
}

impl Default for DefaultProbeModels {
    fn default() -> Self {
        Self {
            openai_compatible: "gpt-5.2".to_string(),
            anthropic: "claude-sonnet-4-5".to_string(),
            codex_oauth: "gpt-5.2".to_string(),
        }
    }
}

impl DefaultProbeModels {
    #[must_use]
    pub fn for_type(&self, channel_type: ChannelType) -> &str {
        match channel_type {
            ChannelType::OpenaiCompatible => &self.openai_compatible,
            ChannelType::Anthropic => &self.anthropic,
            ChannelType::CodexOauth => &self.codex_oauth,
        }
    }
}

/// 健康探测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// 单次尝试的超时（秒）
    pub attempt_timeout_secs: u64,
    /// 批次超时下限（秒）
    pub batch_floor_secs: u64,
    /// 批次超时上限（秒）
    pub batch_cap_secs: u64,
    /// 请求体中的 `max_output_tokens`
    pub max_output_tokens: u32,
    /// 探测提示词
    pub input: String,
    /// 采样文本最大字符数
    pub max_sample_chars: usize,
    /// 最多解析的事件数
    pub max_events: usize,
    /// 最多读取的响应前缀字节数
    pub max_prefix_bytes: usize,
    /// 默认探测模型
    #[serde(default)]
    pub default_models: DefaultProbeModels,
    /// 探测结果是否回写运行时状态
    pub report_outcomes: bool,
    /// 请求 User-Agent
    pub user_agent: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: 20,
            batch_floor_secs: 20,
            batch_cap_secs: 90,
            max_output_tokens: 16,
            input: default_probe_input(),
            max_sample_chars: 200,
            max_events: 12,
            max_prefix_bytes: 256 * 1024,
            default_models: DefaultProbeModels::default(),
            report_outcomes: true,
            user_agent: "upstream-scheduler-probe/1.0".to_string(),
        }
    }
}

impl ProbeConfig {
    #[must_use]
    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// 批次超时：`clamp(n * attempt, floor, cap)`，n 为 0 时取下限
    #[must_use]
    pub fn batch_timeout(&self, models: usize) -> Duration {
        let floor = Duration::from_secs(self.batch_floor_secs);
        let cap = Duration::from_secs(self.batch_cap_secs.max(self.batch_floor_secs));
        let count = u32::try_from(models).unwrap_or(u32::MAX);
        self.attempt_timeout()
            .saturating_mul(count)
            .clamp(floor, cap)
    }
}

fn default_probe_input() -> String {
    "Conversation:\nUser: hi\nAssistant: hi!\nUser: reply with exactly pong (lowercase), nothing else.\nAssistant:"
        .to_string()
}

/// 实时流量分发配置，与探测常量相互独立
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// 整体截止时间（秒）
    pub total_timeout_secs: u64,
    /// 单次尝试截止时间（秒）
    pub attempt_timeout_secs: u64,
    /// 最多尝试的选择数，0 表示不限
    pub max_attempts: usize,
    /// 遇到不可重试状态时立即返回
    pub stop_on_terminal: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            total_timeout_secs: 300,
            attempt_timeout_secs: 120,
            max_attempts: 0,
            stop_on_terminal: true,
        }
    }
}

impl DispatchConfig {
    #[must_use]
    pub const fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }

    #[must_use]
    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// 未设置上限时返回 None
    #[must_use]
    pub const fn attempt_limit(&self) -> Option<usize> {
        if self.max_attempts == 0 {
            None
        } else {
            Some(self.max_attempts)
        }
    }
}

/// 上游 HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// 建连超时（秒）
    pub connect_timeout_secs: u64,
    /// 默认 User-Agent
    pub user_agent: String,
    /// Anthropic `anthropic-version` 头
    pub anthropic_version: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            user_agent: concat!("upstream-scheduler/", env!("CARGO_PKG_VERSION")).to_string(),
            anthropic_version: "2023-06-01".to_string(),
        }
    }
}

impl UpstreamConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// 各类超时与时长配置允许的最大值（秒），7 天
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 3600;

fn ensure_duration(field: &str, secs: u64) -> Result<(), ConfigError> {
    if secs > MAX_DURATION_SECS {
        return Err(ConfigError::invalid(
            field,
            format!("must not exceed {MAX_DURATION_SECS} seconds"),
        ));
    }
    Ok(())
}

impl AppConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scheduler = &self.scheduler;
        if scheduler.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "scheduler.failure_threshold",
                "must be greater than 0",
            ));
        }
        if scheduler.ban_base_secs == 0 || scheduler.ban_cap_secs < scheduler.ban_base_secs {
            return Err(ConfigError::invalid(
                "scheduler.ban_cap_secs",
                "ban base must be > 0 and not exceed the cap",
            ));
        }
        if scheduler.ban_streak_cap == 0 {
            return Err(ConfigError::invalid("scheduler.ban_streak_cap", "must be greater than 0"));
        }

        let probe = &self.probe;
        if probe.attempt_timeout_secs == 0 || probe.batch_floor_secs == 0 {
            return Err(ConfigError::invalid("probe.attempt_timeout_secs", "must be greater than 0"));
        }
        if probe.batch_cap_secs < probe.batch_floor_secs {
            return Err(ConfigError::invalid(
                "probe.batch_cap_secs",
                "must not be smaller than probe.batch_floor_secs",
            ));
        }
        if probe.max_sample_chars == 0 || probe.max_events == 0 || probe.max_prefix_bytes == 0 {
            return Err(ConfigError::invalid("probe", "sampler caps must be greater than 0"));
        }

        let dispatch = &self.dispatch;
        if dispatch.total_timeout_secs == 0 || dispatch.attempt_timeout_secs == 0 {
            return Err(ConfigError::invalid("dispatch", "timeouts must be greater than 0"));
        }

        for (field, secs) in [
            ("scheduler.ban_cap_secs", scheduler.ban_cap_secs),
            ("scheduler.credential_cooldown_secs", scheduler.credential_cooldown_secs),
            ("scheduler.probe_claim_ttl_secs", scheduler.probe_claim_ttl_secs),
            ("scheduler.probe_failure_ban_secs", scheduler.probe_failure_ban_secs),
            ("scheduler.binding_ttl_secs", scheduler.binding_ttl_secs),
            ("scheduler.affinity_ttl_secs", scheduler.affinity_ttl_secs),
            ("probe.attempt_timeout_secs", probe.attempt_timeout_secs),
            ("probe.batch_cap_secs", probe.batch_cap_secs),
            ("dispatch.total_timeout_secs", dispatch.total_timeout_secs),
            ("dispatch.attempt_timeout_secs", dispatch.attempt_timeout_secs),
            ("upstream.connect_timeout_secs", self.upstream.connect_timeout_secs),
        ] {
            ensure_duration(field, secs)?;
        }

        self.catalog.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 20)]
    #[case(1, 20)]
    #[case(3, 60)]
    #[case(4, 80)]
    #[case(5, 90)]
    #[case(40, 90)]
    fn probe_batch_timeout_is_clamped(#[case] models: usize, #[case] expected_secs: u64) {
        let probe = ProbeConfig::default();
        assert_eq!(probe.batch_timeout(models), Duration::from_secs(expected_secs));
    }

    #[test]
    fn dispatch_budget_is_independent_of_probe() {
        let config = AppConfig::default();
        assert_eq!(config.dispatch.attempt_limit(), None);
        assert_ne!(config.dispatch.total_timeout(), config.probe.batch_timeout(1));
    }

    #[rstest]
    #[case::dispatch_total(|c: &mut AppConfig| c.dispatch.total_timeout_secs = u64::MAX)]
    #[case::dispatch_attempt(|c: &mut AppConfig| c.dispatch.attempt_timeout_secs = MAX_DURATION_SECS + 1)]
    #[case::probe_cap(|c: &mut AppConfig| c.probe.batch_cap_secs = u64::MAX)]
    #[case::ban_cap(|c: &mut AppConfig| c.scheduler.ban_cap_secs = u64::MAX)]
    #[case::binding_ttl(|c: &mut AppConfig| c.scheduler.binding_ttl_secs = u64::MAX)]
    fn rejects_out_of_range_durations(#[case] mutate: fn(&mut AppConfig)) {
        let mut config = AppConfig::default();
        mutate(&mut config);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn accepts_maximum_duration() {
        let mut config = AppConfig::default();
        config.dispatch.total_timeout_secs = MAX_DURATION_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_threshold() {
        let mut config = AppConfig::default();
        config.scheduler.failure_threshold = 0;
        assert!(config.validate().is_err());
    }
}
