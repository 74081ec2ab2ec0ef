//! # 渠道目录配置
//!
//! 以 TOML 描述渠道及其端点、凭证、模型绑定，加载后转换为领域类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::ConfigError;
use crate::types::{
    Channel, ChannelId, ChannelModel, ChannelModelId, ChannelType, Credential, CredentialId,
    CredentialLimits, CredentialSecret, Endpoint, EndpointId, EntityStatus, RequestPolicy,
};

/// 渠道目录
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

/// 单个渠道条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub id: ChannelId,
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub promotion: bool,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub groups: Vec<String>,
    pub endpoint: Option<EndpointEntry>,
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

/// 端点条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointEntry {
    pub id: EndpointId,
    pub base_url: String,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub policy: RequestPolicy,
}

/// 凭证条目，`api_key` 与 `access_token` 二选一
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub id: CredentialId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub max_rpm: Option<u64>,
    #[serde(default)]
    pub max_tpm: Option<u64>,
    #[serde(default)]
    pub max_sessions: Option<u32>,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// 模型绑定条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: ChannelModelId,
    pub public_id: String,
    #[serde(default)]
    pub upstream_model: String,
    #[serde(default)]
    pub status: EntityStatus,
}

/// 转换后的目录快照
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub channels: Vec<Channel>,
    pub endpoints: Vec<Endpoint>,
    pub credentials: Vec<Credential>,
    pub models: Vec<ChannelModel>,
}

impl CredentialEntry {
    fn secret(&self, channel: &ChannelEntry) -> Result<CredentialSecret, ConfigError> {
        let field = format!("catalog.channels[{}].credentials[{}]", channel.id, self.id);
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        match channel.channel_type {
            ChannelType::OpenaiCompatible | ChannelType::Anthropic => non_empty(&self.api_key)
                .map(CredentialSecret::ApiKey)
                .ok_or_else(|| ConfigError::invalid(field, "api_key is required")),
            ChannelType::CodexOauth => non_empty(&self.access_token)
                .map(|access_token| CredentialSecret::OAuth {
                    access_token,
                    account_id: non_empty(&self.account_id),
                })
                .ok_or_else(|| ConfigError::invalid(field, "access_token is required")),
        }
    }
}

impl CatalogConfig {
    /// 校验 ID 唯一性与凭证格式
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.to_snapshot().map(|_| ())
    }

    /// 转换为领域类型
    pub fn to_snapshot(&self) -> Result<CatalogSnapshot, ConfigError> {
        let mut snapshot = CatalogSnapshot::default();
        let mut channel_ids = HashSet::new();
        let mut endpoint_ids = HashSet::new();
        let mut credential_keys = HashSet::new();
        let mut model_ids = HashSet::new();

        for entry in &self.channels {
            if !channel_ids.insert(entry.id) {
                return Err(ConfigError::invalid(
                    "catalog.channels",
                    format!("duplicate channel id {}", entry.id),
                ));
            }

            snapshot.channels.push(Channel {
                id: entry.id,
                name: entry.name.clone(),
                channel_type: entry.channel_type,
                priority: entry.priority,
                promotion: entry.promotion,
                status: entry.status,
                groups: entry.groups.clone(),
                last_test: None,
            });

            let Some(endpoint) = &entry.endpoint else {
                continue;
            };
            if !endpoint_ids.insert(endpoint.id) {
                return Err(ConfigError::invalid(
                    "catalog.channels.endpoint",
                    format!("duplicate endpoint id {}", endpoint.id),
                ));
            }
            if endpoint.base_url.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("catalog.channels[{}].endpoint.base_url", entry.id),
                    "must not be empty",
                ));
            }
            snapshot.endpoints.push(Endpoint {
                id: endpoint.id,
                channel_id: entry.id,
                base_url: endpoint.base_url.trim().to_string(),
                status: endpoint.status,
                policy: endpoint.policy.clone(),
            });

            for cred in &entry.credentials {
                let secret = cred.secret(entry)?;
                if !credential_keys.insert((secret.kind(), cred.id)) {
                    return Err(ConfigError::invalid(
                        "catalog.channels.credentials",
                        format!("duplicate credential {}:{}", secret.kind(), cred.id),
                    ));
                }
                snapshot.credentials.push(Credential {
                    id: cred.id,
                    endpoint_id: endpoint.id,
                    name: cred.name.clone(),
                    status: cred.status,
                    secret,
                    limits: CredentialLimits {
                        max_rpm: cred.max_rpm,
                        max_tpm: cred.max_tpm,
                        max_sessions: cred.max_sessions,
                    },
                    cooldown_until: cred.cooldown_until,
                    last_used_at: None,
                });
            }

            for model in &entry.models {
                if !model_ids.insert(model.id) {
                    return Err(ConfigError::invalid(
                        "catalog.channels.models",
                        format!("duplicate model binding id {}", model.id),
                    ));
                }
                snapshot.models.push(ChannelModel {
                    id: model.id,
                    channel_id: entry.id,
                    public_id: model.public_id.clone(),
                    upstream_model: model.upstream_model.clone(),
                    status: model.status,
                });
            }
        }

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
        [[channels]]
        id = 1
        name = "primary"
        type = "openai_compatible"
        priority = 0

        [channels.endpoint]
        id = 10
        base_url = "https://api.example.com/v1"

        [[channels.credentials]]
        id = 100
        api_key = "sk-a"
        max_rpm = 60

        [[channels.models]]
        id = 1000
        public_id = "gpt-4o"

        [[channels]]
        id = 2
        name = "codex"
        type = "codex_oauth"
        priority = 1

        [channels.endpoint]
        id = 20
        base_url = "https://chatgpt.com/backend-api/codex"

        [[channels.credentials]]
        id = 100
        access_token = "tok"
        account_id = "acct"
    "#;

    #[test]
    fn converts_catalog_to_domain_types() {
        let catalog: CatalogConfig = toml::from_str(SAMPLE).unwrap();
        let snapshot = catalog.to_snapshot().unwrap();

        assert_eq!(snapshot.channels.len(), 2);
        assert_eq!(snapshot.endpoints.len(), 2);
        // 不同种类的凭证可以复用 ID
        assert_eq!(snapshot.credentials.len(), 2);
        assert_eq!(snapshot.credentials[0].limits.max_rpm, Some(60));
        assert_eq!(snapshot.models[0].upstream_name(), "gpt-4o");
    }

    #[test]
    fn rejects_missing_secret() {
        let raw = SAMPLE.replace("api_key = \"sk-a\"", "");
        let catalog: CatalogConfig = toml::from_str(&raw).unwrap();
        assert!(matches!(
            catalog.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_channel_ids() {
        let raw = SAMPLE.replace("id = 2\n", "id = 1\n");
        let catalog: CatalogConfig = toml::from_str(&raw).unwrap();
        assert!(catalog.validate().is_err());
    }
}
