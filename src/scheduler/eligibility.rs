//! # 可用选择解析
//!
//! 给定渠道与其唯一端点，枚举可用的 (端点, 凭证) 组合。
//! 纯函数：只依赖配置快照与调用方传入的当前时间。
//!
//! 渠道类型的差异集中在 [`ChannelCapability`] 中，按类型在加载时选定一次。

use chrono::{DateTime, Utc};
use serde_json::json;
use std::fmt::Debug;

use crate::config::ProbeConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::transport::UpstreamRequest;
use crate::types::{Channel, ChannelType, Credential, CredentialSecret, Endpoint, Selection};

/// 渠道类型能力
pub trait ChannelCapability: Send + Sync + Debug {
    fn channel_type(&self) -> ChannelType;

    /// 过滤出当前可用的凭证，保持输入顺序
    fn list_credentials<'a>(
        &self,
        credentials: &'a [Credential],
        now: DateTime<Utc>,
    ) -> Vec<&'a Credential> {
        let kind = self.channel_type().credential_kind();
        credentials
            .iter()
            .filter(|cred| cred.status.is_enabled())
            .filter(|cred| cred.kind() == kind && has_secret(&cred.secret))
            .filter(|cred| !cred.is_cooling_down(now))
            .collect()
    }

    /// 构造流式探测请求
    fn build_probe_request(&self, model: &str, config: &ProbeConfig) -> UpstreamRequest;
}

fn has_secret(secret: &CredentialSecret) -> bool {
    match secret {
        CredentialSecret::ApiKey(key) => !key.trim().is_empty(),
        CredentialSecret::OAuth { access_token, .. } => !access_token.trim().is_empty(),
    }
}

fn responses_probe(path: &str, model: &str, config: &ProbeConfig) -> UpstreamRequest {
    let body = json!({
        "model": model,
        "input": config.input,
        "max_output_tokens": config.max_output_tokens,
        "stream": true,
    });
    UpstreamRequest::json_post(path, &body)
        .with_header("Accept", "text/event-stream")
        .with_header("User-Agent", &config.user_agent)
}

/// OpenAI 兼容渠道
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiCompatibleCapability;

impl ChannelCapability for OpenAiCompatibleCapability {
    fn channel_type(&self) -> ChannelType {
        ChannelType::OpenaiCompatible
    }

    fn build_probe_request(&self, model: &str, config: &ProbeConfig) -> UpstreamRequest {
        responses_probe("/v1/responses", model, config)
    }
}

/// Anthropic 兼容渠道，使用原生 Messages 接口
#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicCapability;

impl ChannelCapability for AnthropicCapability {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Anthropic
    }

    fn build_probe_request(&self, model: &str, config: &ProbeConfig) -> UpstreamRequest {
        let body = json!({
            "model": model,
            "max_tokens": config.max_output_tokens,
            "messages": [{ "role": "user", "content": config.input }],
            "stream": true,
        });
        UpstreamRequest::json_post("/v1/messages", &body)
            .with_header("Accept", "text/event-stream")
            .with_header("User-Agent", &config.user_agent)
    }
}

/// Codex OAuth 渠道，基础地址已带 API 前缀
#[derive(Debug, Clone, Copy, Default)]
pub struct CodexOauthCapability;

impl ChannelCapability for CodexOauthCapability {
    fn channel_type(&self) -> ChannelType {
        ChannelType::CodexOauth
    }

    fn build_probe_request(&self, model: &str, config: &ProbeConfig) -> UpstreamRequest {
        responses_probe("/responses", model, config)
    }
}

static OPENAI_COMPATIBLE: OpenAiCompatibleCapability = OpenAiCompatibleCapability;
static ANTHROPIC: AnthropicCapability = AnthropicCapability;
static CODEX_OAUTH: CodexOauthCapability = CodexOauthCapability;

/// 渠道类型对应的能力实现
#[must_use]
pub fn capability_for(channel_type: ChannelType) -> &'static dyn ChannelCapability {
    match channel_type {
        ChannelType::OpenaiCompatible => &OPENAI_COMPATIBLE,
        ChannelType::Anthropic => &ANTHROPIC,
        ChannelType::CodexOauth => &CODEX_OAUTH,
    }
}

fn selection_for(channel: &Channel, endpoint: &Endpoint, credential: &Credential) -> Selection {
    Selection {
        channel_id: channel.id,
        channel_type: channel.channel_type,
        endpoint_id: endpoint.id,
        base_url: endpoint.base_url.clone(),
        credential_kind: credential.kind(),
        credential_id: credential.id,
    }
}

/// 枚举可用选择，同时返回对应凭证
///
/// 端点缺失或不属于该渠道时返回 `EndpointNotFound`；
/// 端点禁用或没有可用凭证时返回 `NoEligibleSelection`。
pub fn list_eligible<'a>(
    channel: &Channel,
    endpoint: Option<&Endpoint>,
    credentials: &'a [Credential],
    now: DateTime<Utc>,
) -> SchedulerResult<Vec<(Selection, &'a Credential)>> {
    let endpoint = endpoint
        .filter(|ep| ep.channel_id == channel.id)
        .ok_or(SchedulerError::EndpointNotFound {
            channel_id: channel.id,
        })?;
    if !endpoint.status.is_enabled() {
        return Err(SchedulerError::NoEligibleSelection {
            channel_id: channel.id,
        });
    }

    let selections: Vec<_> = capability_for(channel.channel_type)
        .list_credentials(credentials, now)
        .into_iter()
        .filter(|cred| cred.endpoint_id == endpoint.id)
        .map(|cred| (selection_for(channel, endpoint, cred), cred))
        .collect();

    if selections.is_empty() {
        return Err(SchedulerError::NoEligibleSelection {
            channel_id: channel.id,
        });
    }
    Ok(selections)
}

/// 渠道的可用选择列表
pub fn list_selections(
    channel: &Channel,
    endpoint: Option<&Endpoint>,
    credentials: &[Credential],
    now: DateTime<Utc>,
) -> SchedulerResult<Vec<Selection>> {
    list_eligible(channel, endpoint, credentials, now)
        .map(|pairs| pairs.into_iter().map(|(selection, _)| selection).collect())
}
