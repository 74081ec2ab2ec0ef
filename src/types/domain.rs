use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

pub type ChannelId = i64;
pub type EndpointId = i64;
pub type CredentialId = i64;
pub type ChannelModelId = i64;
pub type UserId = i64;

pub type RequestCount = u64;
pub type TokenCount = u64;

/// 渠道类型，封闭集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    /// 通用 OpenAI 兼容接口
    #[serde(rename = "openai_compatible")]
    OpenaiCompatible,
    /// Anthropic 兼容接口
    #[serde(rename = "anthropic")]
    Anthropic,
    /// Codex OAuth 账号
    #[serde(rename = "codex_oauth")]
    CodexOauth,
}

impl ChannelType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenaiCompatible => "openai_compatible",
            Self::Anthropic => "anthropic",
            Self::CodexOauth => "codex_oauth",
        }
    }

    /// 该渠道类型接受的凭证种类
    #[must_use]
    pub const fn credential_kind(self) -> CredentialKind {
        match self {
            Self::OpenaiCompatible | Self::Anthropic => CredentialKind::ApiKey,
            Self::CodexOauth => CredentialKind::CodexOauth,
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai_compatible" | "openai" => Ok(Self::OpenaiCompatible),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "codex_oauth" | "codex" => Ok(Self::CodexOauth),
            other => Err(SchedulerError::UnsupportedChannelType {
                channel_type: other.to_string(),
            }),
        }
    }
}

/// 凭证种类：API Key 或 OAuth 账号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    ApiKey,
    CodexOauth,
}

impl CredentialKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::CodexOauth => "codex_oauth",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 启用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    #[default]
    Enabled,
    Disabled,
}

impl EntityStatus {
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// 最近一次探测结果，由配置源持久化
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTestRecord {
    pub ok: bool,
    pub latency_ms: u64,
    pub tested_at: DateTime<Utc>,
}

/// 渠道
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub channel_type: ChannelType,
    /// 数值越小越优先
    pub priority: i32,
    /// 同优先级内优先
    #[serde(default)]
    pub promotion: bool,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_test: Option<ChannelTestRecord>,
}

impl Channel {
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.status.is_enabled()
    }

    /// 未配置分组的渠道属于 `default` 分组
    #[must_use]
    pub fn in_group(&self, group: &str) -> bool {
        if self.groups.is_empty() {
            return group == "default";
        }
        self.groups.iter().any(|g| g == group)
    }
}

/// 端点的请求改写策略
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestPolicy {
    /// 覆盖请求头
    #[serde(default)]
    pub header_override: BTreeMap<String, String>,
    /// 覆盖请求体顶层参数
    #[serde(default)]
    pub param_override: serde_json::Map<String, serde_json::Value>,
    /// 上游状态码重映射
    #[serde(default)]
    pub status_code_mapping: BTreeMap<u16, u16>,
}

impl RequestPolicy {
    /// 按映射表改写状态码
    #[must_use]
    pub fn map_status(&self, status: u16) -> u16 {
        self.status_code_mapping.get(&status).copied().unwrap_or(status)
    }

    /// 将参数覆盖合并进 JSON 请求体
    pub fn apply_params(&self, body: &mut serde_json::Value) {
        if let Some(object) = body.as_object_mut() {
            for (key, value) in &self.param_override {
                object.insert(key.clone(), value.clone());
            }
        }
    }
}

/// 端点，与渠道一一对应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub channel_id: ChannelId,
    pub base_url: String,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub policy: RequestPolicy,
}

/// 凭证的机密部分，不参与序列化输出
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSecret {
    ApiKey(String),
    OAuth {
        access_token: String,
        account_id: Option<String>,
    },
}

impl CredentialSecret {
    #[must_use]
    pub const fn kind(&self) -> CredentialKind {
        match self {
            Self::ApiKey(_) => CredentialKind::ApiKey,
            Self::OAuth { .. } => CredentialKind::CodexOauth,
        }
    }
}

impl fmt::Debug for CredentialSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("ApiKey(***)"),
            Self::OAuth { account_id, .. } => f
                .debug_struct("OAuth")
                .field("access_token", &"***")
                .field("account_id", account_id)
                .finish(),
        }
    }
}

/// 单个凭证的限额，未设置表示不限
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialLimits {
    pub max_rpm: Option<u64>,
    pub max_tpm: Option<u64>,
    pub max_sessions: Option<u32>,
}

/// 绑定在端点上的凭证
#[derive(Debug, Clone, Serialize)]
pub struct Credential {
    pub id: CredentialId,
    pub endpoint_id: EndpointId,
    pub name: String,
    pub status: EntityStatus,
    #[serde(skip)]
    pub secret: CredentialSecret,
    pub limits: CredentialLimits,
    /// 外部设置的冷却截止时间（如授权被吊销）
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Credential {
    #[must_use]
    pub const fn kind(&self) -> CredentialKind {
        self.secret.kind()
    }

    #[must_use]
    pub const fn key(&self) -> CredentialKey {
        CredentialKey::new(self.kind(), self.id)
    }

    /// `now >= cooldown_until` 时重新可用
    #[must_use]
    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

/// 渠道的模型绑定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelModel {
    pub id: ChannelModelId,
    pub channel_id: ChannelId,
    pub public_id: String,
    #[serde(default)]
    pub upstream_model: String,
    #[serde(default)]
    pub status: EntityStatus,
}

impl ChannelModel {
    /// 上游模型名为空时回退为公开 ID
    #[must_use]
    pub fn upstream_name(&self) -> &str {
        let upstream = self.upstream_model.trim();
        if upstream.is_empty() {
            self.public_id.trim()
        } else {
            upstream
        }
    }
}

/// 运行时状态的凭证键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CredentialKey {
    pub kind: CredentialKind,
    pub id: CredentialId,
}

impl CredentialKey {
    #[must_use]
    pub const fn new(kind: CredentialKind, id: CredentialId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// 一次调度的选择，临时且不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub channel_id: ChannelId,
    pub channel_type: ChannelType,
    pub endpoint_id: EndpointId,
    pub base_url: String,
    pub credential_kind: CredentialKind,
    pub credential_id: CredentialId,
}

impl Selection {
    #[must_use]
    pub const fn credential_key(&self) -> CredentialKey {
        CredentialKey::new(self.credential_kind, self.credential_id)
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "channel={} endpoint={} credential={}",
            self.channel_id,
            self.endpoint_id,
            self.credential_key()
        )
    }
}

/// 单个模型的探测结果，只存在于一次探测的响应中
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestResult {
    pub public_model: String,
    pub upstream_model: String,
    pub ok: bool,
    pub ttft_ms: u64,
    pub sample: String,
    pub error: String,
}
