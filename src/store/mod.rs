//! # 配置源
//!
//! 只读访问渠道、端点、凭证与模型绑定，以及探测结果的回写。
//! 存储实现不在本 crate 的职责内，这里只定义边界与一个内存实现。

mod memory;

pub use memory::InMemoryConfigSource;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    Channel, ChannelId, ChannelModel, ChannelModelId, Credential, CredentialKey, Endpoint,
    EndpointId,
};

/// 配置源边界
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// 全部渠道（含禁用）
    async fn list_channels(&self) -> Result<Vec<Channel>>;

    async fn get_channel(&self, id: ChannelId) -> Result<Option<Channel>>;

    /// 渠道的唯一端点
    async fn get_endpoint_by_channel(&self, channel_id: ChannelId) -> Result<Option<Endpoint>>;

    /// 端点下的全部凭证（含禁用）
    async fn list_credentials_by_endpoint(&self, endpoint_id: EndpointId)
    -> Result<Vec<Credential>>;

    async fn get_credential(&self, key: CredentialKey) -> Result<Option<Credential>>;

    /// 渠道下启用的模型绑定
    async fn list_enabled_channel_models(&self, channel_id: ChannelId)
    -> Result<Vec<ChannelModel>>;

    async fn get_channel_model(&self, id: ChannelModelId) -> Result<Option<ChannelModel>>;

    /// 持久化最近一次探测结果
    async fn update_channel_test(
        &self,
        channel_id: ChannelId,
        ok: bool,
        latency_ms: u64,
        tested_at: DateTime<Utc>,
    ) -> Result<()>;

    /// 记录凭证最近使用时间，供 OAuth 账号轮换
    async fn touch_credential(&self, key: CredentialKey, used_at: DateTime<Utc>) -> Result<()>;
}
