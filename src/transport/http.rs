//! # reqwest 上游传输
//!
//! 负责地址拼接、按凭证种类附加鉴权头、应用端点的请求头/参数覆盖与状态码映射。

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use std::sync::Arc;
use url::Url;

use super::{UpstreamRequest, UpstreamResponse, UpstreamTransport};
use crate::config::UpstreamConfig;
use crate::error::{TransportError, TransportResult};
use crate::ldebug;
use crate::logging::{LogComponent, LogStage};
use crate::store::ConfigSource;
use crate::types::{ChannelType, CredentialSecret, RequestPolicy, Selection};

/// 拼接上游地址
///
/// 缺少 scheme 时补 `https://`；基础路径以 `/v1` 结尾且目标以 `/v1/` 开头时去重。
pub fn build_upstream_url(base_url: &str, path: &str) -> TransportResult<Url> {
    let invalid = |reason: &str| TransportError::InvalidBaseUrl {
        base_url: base_url.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(invalid("base_url 不能为空"));
    }
    let raw = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let mut url = Url::parse(&raw).map_err(|e| invalid(&e.to_string()))?;
    if url.cannot_be_a_base() || url.host().is_none() {
        return Err(invalid("base_url 缺少 host"));
    }

    let base_path = url.path().trim_end_matches('/').to_string();
    let target = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    let target = match target.strip_prefix("/v1") {
        Some(rest) if base_path.ends_with("/v1") && (rest.is_empty() || rest.starts_with('/')) => {
            rest.to_string()
        }
        _ => target,
    };
    url.set_path(&format!("{base_path}{target}"));
    Ok(url)
}

/// 基于 reqwest 的上游传输
pub struct HttpTransport {
    client: reqwest::Client,
    source: Arc<dyn ConfigSource>,
    config: UpstreamConfig,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// 创建传输；重定向不跟随，只设置建连超时，整体超时由调用方的截止时间控制
    pub fn new(source: Arc<dyn ConfigSource>, config: UpstreamConfig) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            source,
            config,
        })
    }

    fn auth_headers(&self, selection: &Selection, secret: &CredentialSecret) -> Vec<(String, String)> {
        match secret {
            CredentialSecret::ApiKey(key) if selection.channel_type == ChannelType::Anthropic => vec![
                ("x-api-key".to_string(), key.clone()),
                (
                    "anthropic-version".to_string(),
                    self.config.anthropic_version.clone(),
                ),
            ],
            CredentialSecret::ApiKey(key) => {
                vec![("Authorization".to_string(), format!("Bearer {key}"))]
            }
            CredentialSecret::OAuth {
                access_token,
                account_id,
            } => {
                let mut headers = vec![("Authorization".to_string(), format!("Bearer {access_token}"))];
                if let Some(account) = account_id {
                    headers.push(("Chatgpt-Account-Id".to_string(), account.clone()));
                }
                headers
            }
        }
    }

    async fn policy_for(&self, selection: &Selection) -> TransportResult<RequestPolicy> {
        let endpoint = self
            .source
            .get_endpoint_by_channel(selection.channel_id)
            .await
            .map_err(|e| TransportError::Store(e.to_string()))?;
        Ok(endpoint
            .filter(|ep| ep.id == selection.endpoint_id)
            .map(|ep| ep.policy)
            .unwrap_or_default())
    }
}

fn apply_param_override(body: &bytes::Bytes, policy: &RequestPolicy) -> bytes::Bytes {
    if policy.param_override.is_empty() {
        return body.clone();
    }
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(mut value) => {
            policy.apply_params(&mut value);
            bytes::Bytes::from(value.to_string())
        }
        Err(_) => body.clone(),
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn send(
        &self,
        selection: &Selection,
        request: &UpstreamRequest,
    ) -> TransportResult<UpstreamResponse> {
        let key = selection.credential_key();
        let credential = self
            .source
            .get_credential(key)
            .await
            .map_err(|e| TransportError::Store(e.to_string()))?
            .ok_or_else(|| TransportError::CredentialNotFound {
                credential: key.to_string(),
            })?;
        let policy = self.policy_for(selection).await?;
        let url = build_upstream_url(&selection.base_url, &request.path)?;

        let mut headers = request.headers.clone();
        headers.extend(self.auth_headers(selection, &credential.secret));
        for (name, value) in &policy.header_override {
            headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
            headers.push((name.clone(), value.clone()));
        }

        let mut builder = self
            .client
            .request(request.method.clone(), url.clone())
            .body(apply_param_override(&request.body, &policy));
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        ldebug!(
            "system",
            LogStage::Upstream,
            LogComponent::Transport,
            "upstream_request",
            "发送上游请求",
            url = %url,
            selection = %selection
        );
        let response = builder.send().await?;

        let raw_status = response.status().as_u16();
        let status = policy.map_status(raw_status);
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let retry_after_secs = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());

        Ok(UpstreamResponse {
            status,
            content_type,
            retry_after_secs,
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map_err(TransportError::from))
                .boxed(),
        })
    }
}
