//! # 上游传输
//!
//! 对上游的一次网络调用被视为不透明操作：给定选择与请求形态，返回状态与流式响应体。

mod http;

pub use http::{HttpTransport, build_upstream_url};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Method;
use std::fmt;

use crate::error::TransportResult;
use crate::types::Selection;

/// 发往上游的请求形态，不含鉴权信息
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// 相对于基础地址的路径，例如 `/v1/responses`
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl UpstreamRequest {
    /// JSON POST 请求
    #[must_use]
    pub fn json_post(path: impl Into<String>, body: &serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Bytes::from(body.to_string()),
        }
    }

    /// 追加或替换请求头（名称大小写不敏感）
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 请求体解析为 JSON，非 JSON 时为 None
    #[must_use]
    pub fn json_body(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// 上游响应体流
pub type BodyStream = BoxStream<'static, TransportResult<Bytes>>;

/// 上游响应，响应体保持流式
pub struct UpstreamResponse {
    /// 已应用端点状态码映射后的状态
    pub status: u16,
    pub content_type: Option<String>,
    /// 上游给出的重试等待（`Retry-After` 秒数）
    pub retry_after_secs: Option<u64>,
    pub body: BodyStream,
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("retry_after_secs", &self.retry_after_secs)
            .finish_non_exhaustive()
    }
}

impl UpstreamResponse {
    /// 由完整响应体构造，用于测试与非流式场景
    #[must_use]
    pub fn from_bytes(status: u16, content_type: Option<&str>, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status,
            content_type: content_type.map(str::to_string),
            retry_after_secs: None,
            body: stream::once(async move { Ok(body) }).boxed(),
        }
    }

    /// 声明为事件流
    #[must_use]
    pub fn is_event_stream(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/event-stream"))
    }

    /// 最多读取 `limit` 字节的响应体前缀
    pub async fn read_capped(self, limit: usize) -> TransportResult<Bytes> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while buf.len() < limit {
            match body.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    let take = chunk.len().min(limit - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                }
                None => break,
            }
        }
        Ok(buf.freeze())
    }
}

/// 上游传输边界
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// 使用选择中的凭证，向选择的基础地址发送请求
    async fn send(
        &self,
        selection: &Selection,
        request: &UpstreamRequest,
    ) -> TransportResult<UpstreamResponse>;
}
