//! # 测试数据 Fixtures

use crate::config::CatalogSnapshot;
use crate::types::{
    Channel, ChannelId, ChannelModel, ChannelModelId, ChannelType, Credential, CredentialId,
    CredentialKind, CredentialLimits, CredentialSecret, Endpoint, EndpointId, EntityStatus,
    RequestPolicy, Selection,
};

/// 渠道对应的端点 ID
#[must_use]
pub const fn endpoint_id(channel_id: ChannelId) -> EndpointId {
    channel_id * 10
}

/// 渠道对应的基础地址
#[must_use]
pub fn base_url(channel_id: ChannelId) -> String {
    format!("https://upstream-{channel_id}.example.com/v1")
}

/// 启用的 OpenAI 兼容渠道
#[must_use]
pub fn channel(id: ChannelId, priority: i32) -> Channel {
    Channel {
        id,
        name: format!("channel-{id}"),
        channel_type: ChannelType::OpenaiCompatible,
        priority,
        promotion: false,
        status: EntityStatus::Enabled,
        groups: Vec::new(),
        last_test: None,
    }
}

/// 与 [`two_channel_catalog`] 一致的 API Key 选择
#[must_use]
pub fn selection(channel_id: ChannelId, credential_id: CredentialId) -> Selection {
    Selection {
        channel_id,
        channel_type: ChannelType::OpenaiCompatible,
        endpoint_id: endpoint_id(channel_id),
        base_url: base_url(channel_id),
        credential_kind: CredentialKind::ApiKey,
        credential_id,
    }
}

/// 目录构建器
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    snapshot: CatalogSnapshot,
}

impl CatalogBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加渠道及其端点，端点 ID 为渠道 ID 乘 10
    #[must_use]
    pub fn channel(mut self, channel: Channel, base_url: impl Into<String>) -> Self {
        self.snapshot.endpoints.push(Endpoint {
            id: endpoint_id(channel.id),
            channel_id: channel.id,
            base_url: base_url.into(),
            status: EntityStatus::Enabled,
            policy: RequestPolicy::default(),
        });
        self.snapshot.channels.push(channel);
        self
    }

    fn credential(mut self, channel_id: ChannelId, id: CredentialId, secret: CredentialSecret) -> Self {
        self.snapshot.credentials.push(Credential {
            id,
            endpoint_id: endpoint_id(channel_id),
            name: format!("credential-{id}"),
            status: EntityStatus::Enabled,
            secret,
            limits: CredentialLimits::default(),
            cooldown_until: None,
            last_used_at: None,
        });
        self
    }

    #[must_use]
    pub fn api_key(self, channel_id: ChannelId, id: CredentialId) -> Self {
        self.credential(channel_id, id, CredentialSecret::ApiKey(format!("sk-test-{id}")))
    }

    #[must_use]
    pub fn oauth(self, channel_id: ChannelId, id: CredentialId, account_id: &str) -> Self {
        self.credential(
            channel_id,
            id,
            CredentialSecret::OAuth {
                access_token: format!("oauth-token-{id}"),
                account_id: Some(account_id.to_string()),
            },
        )
    }

    #[must_use]
    pub fn model(
        mut self,
        channel_id: ChannelId,
        id: ChannelModelId,
        public_id: &str,
        upstream_model: &str,
    ) -> Self {
        self.snapshot.models.push(ChannelModel {
            id,
            channel_id,
            public_id: public_id.to_string(),
            upstream_model: upstream_model.to_string(),
            status: EntityStatus::Enabled,
        });
        self
    }

    #[must_use]
    pub fn build(self) -> CatalogSnapshot {
        self.snapshot
    }
}

/// 两个 OpenAI 兼容渠道
///
/// - 渠道 1：优先级 0，端点 10，凭证 100/101，模型绑定 1000（gpt-4o）与 1001（gpt-4o-mini → gpt-4o-mini-2024）
/// - 渠道 2：优先级 1，端点 20，凭证 200，无模型绑定
#[must_use]
pub fn two_channel_catalog() -> CatalogSnapshot {
    CatalogBuilder::new()
        .channel(channel(1, 0), base_url(1))
        .channel(channel(2, 1), base_url(2))
        .api_key(1, 100)
        .api_key(1, 101)
        .api_key(2, 200)
        .model(1, 1000, "gpt-4o", "")
        .model(1, 1001, "gpt-4o-mini", "gpt-4o-mini-2024")
        .build()
}
