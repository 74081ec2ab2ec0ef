//! 基于目录快照的内存配置源

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::ConfigSource;
use crate::config::CatalogSnapshot;
use crate::error::{ProxyError, Result};
use crate::types::{
    Channel, ChannelId, ChannelModel, ChannelModelId, ChannelTestRecord, Credential,
    CredentialKey, Endpoint, EndpointId,
};

#[derive(Debug, Default)]
struct Tables {
    channels: Vec<Channel>,
    endpoints: HashMap<EndpointId, Endpoint>,
    endpoint_by_channel: HashMap<ChannelId, EndpointId>,
    credentials: Vec<Credential>,
    models: Vec<ChannelModel>,
}

/// 内存配置源，主要用于 CLI 与测试
#[derive(Debug, Default)]
pub struct InMemoryConfigSource {
    tables: RwLock<Tables>,
}

impl InMemoryConfigSource {
    #[must_use]
    pub fn new(snapshot: CatalogSnapshot) -> Self {
        let endpoint_by_channel = snapshot
            .endpoints
            .iter()
            .map(|e| (e.channel_id, e.id))
            .collect();
        let endpoints = snapshot.endpoints.into_iter().map(|e| (e.id, e)).collect();
        Self {
            tables: RwLock::new(Tables {
                channels: snapshot.channels,
                endpoints,
                endpoint_by_channel,
                credentials: snapshot.credentials,
                models: snapshot.models,
            }),
        }
    }

    /// 整体替换目录，模拟配置热更新
    pub fn replace(&self, snapshot: CatalogSnapshot) -> Result<()> {
        let fresh = Self::new(snapshot);
        let tables = fresh
            .tables
            .into_inner()
            .map_err(|_| ProxyError::internal("config source lock poisoned"))?;
        *self.write()? = tables;
        Ok(())
    }

    /// 删除渠道及其端点、凭证与模型绑定
    pub fn remove_channel(&self, channel_id: ChannelId) -> Result<()> {
        let mut tables = self.write()?;
        tables.channels.retain(|c| c.id != channel_id);
        tables.models.retain(|m| m.channel_id != channel_id);
        if let Some(endpoint_id) = tables.endpoint_by_channel.remove(&channel_id) {
            tables.endpoints.remove(&endpoint_id);
            tables.credentials.retain(|c| c.endpoint_id != endpoint_id);
        }
        Ok(())
    }

    /// 外部设置凭证冷却（如授权吊销）
    pub fn set_credential_cooldown(
        &self,
        key: CredentialKey,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut tables = self.write()?;
        if let Some(cred) = tables.credentials.iter_mut().find(|c| c.key() == key) {
            cred.cooldown_until = until;
        }
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| ProxyError::internal("config source lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| ProxyError::internal("config source lock poisoned"))
    }
}

#[async_trait]
impl ConfigSource for InMemoryConfigSource {
    async fn list_channels(&self) -> Result<Vec<Channel>> {
        Ok(self.read()?.channels.clone())
    }

    async fn get_channel(&self, id: ChannelId) -> Result<Option<Channel>> {
        Ok(self.read()?.channels.iter().find(|c| c.id == id).cloned())
    }

    async fn get_endpoint_by_channel(&self, channel_id: ChannelId) -> Result<Option<Endpoint>> {
        let tables = self.read()?;
        Ok(tables
            .endpoint_by_channel
            .get(&channel_id)
            .and_then(|id| tables.endpoints.get(id))
            .cloned())
    }

    async fn list_credentials_by_endpoint(
        &self,
        endpoint_id: EndpointId,
    ) -> Result<Vec<Credential>> {
        Ok(self
            .read()?
            .credentials
            .iter()
            .filter(|c| c.endpoint_id == endpoint_id)
            .cloned()
            .collect())
    }

    async fn get_credential(&self, key: CredentialKey) -> Result<Option<Credential>> {
        Ok(self
            .read()?
            .credentials
            .iter()
            .find(|c| c.key() == key)
            .cloned())
    }

    async fn list_enabled_channel_models(
        &self,
        channel_id: ChannelId,
    ) -> Result<Vec<ChannelModel>> {
        Ok(self
            .read()?
            .models
            .iter()
            .filter(|m| m.channel_id == channel_id && m.status.is_enabled())
            .cloned()
            .collect())
    }

    async fn get_channel_model(&self, id: ChannelModelId) -> Result<Option<ChannelModel>> {
        Ok(self.read()?.models.iter().find(|m| m.id == id).cloned())
    }

    async fn update_channel_test(
        &self,
        channel_id: ChannelId,
        ok: bool,
        latency_ms: u64,
        tested_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.write()?;
        let channel = tables
            .channels
            .iter_mut()
            .find(|c| c.id == channel_id)
            .ok_or_else(|| ProxyError::upstream_not_found(format!("channel {channel_id}")))?;
        channel.last_test = Some(ChannelTestRecord {
            ok,
            latency_ms,
            tested_at,
        });
        Ok(())
    }

    async fn touch_credential(&self, key: CredentialKey, used_at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.write()?;
        if let Some(cred) = tables.credentials.iter_mut().find(|c| c.key() == key) {
            cred.last_used_at = Some(used_at);
        }
        Ok(())
    }
}
