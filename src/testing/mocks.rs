//! # 脚本化的上游传输
//!
//! 按凭证 ID 预设响应，并记录调用顺序。

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::helpers::sse_body;
use crate::error::{TransportError, TransportResult};
use crate::transport::{UpstreamRequest, UpstreamResponse, UpstreamTransport};
use crate::types::{CredentialId, Selection};

/// 预设的上游行为
#[derive(Debug, Clone)]
pub enum Scripted {
    /// 分块返回响应体
    Chunks {
        status: u16,
        content_type: Option<String>,
        chunks: Vec<String>,
    },
    /// 连接失败
    NetworkError,
    /// 延迟后再按内层脚本响应
    Delayed(Duration, Box<Scripted>),
}

impl Scripted {
    /// `text/event-stream` 响应，每个增量一个事件，以 `[DONE]` 结束
    #[must_use]
    pub fn sse(deltas: &[&str]) -> Self {
        Self::Chunks {
            status: 200,
            content_type: Some("text/event-stream".to_string()),
            chunks: vec![sse_body(deltas)],
        }
    }

    /// JSON 状态响应
    #[must_use]
    pub fn status(status: u16, body: &str) -> Self {
        Self::Chunks {
            status,
            content_type: Some("application/json".to_string()),
            chunks: vec![body.to_string()],
        }
    }
}

/// 脚本化传输
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: HashMap<CredentialId, Scripted>,
    calls: Mutex<Vec<(Selection, UpstreamRequest)>>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 为凭证预设响应；未预设的凭证返回传输错误
    #[must_use]
    pub fn on(mut self, credential_id: CredentialId, script: Scripted) -> Self {
        self.scripts.insert(credential_id, script);
        self
    }

    /// 按调用顺序返回凭证 ID
    #[must_use]
    pub fn calls(&self) -> Vec<CredentialId> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(|(s, _)| s.credential_id).collect())
            .unwrap_or_default()
    }

    /// 收到的请求
    #[must_use]
    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl UpstreamTransport for ScriptedTransport {
    async fn send(
        &self,
        selection: &Selection,
        request: &UpstreamRequest,
    ) -> TransportResult<UpstreamResponse> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((selection.clone(), request.clone()));
        }

        let mut script = self
            .scripts
            .get(&selection.credential_id)
            .cloned()
            .ok_or_else(|| TransportError::Body(format!("no script for {selection}")))?;
        while let Scripted::Delayed(delay, inner) = &script {
            let (delay, next) = (*delay, inner.as_ref().clone());
            tokio::time::sleep(delay).await;
            script = next;
        }

        match script {
            Scripted::Chunks {
                status,
                content_type,
                chunks,
            } => Ok(UpstreamResponse {
                status,
                content_type,
                retry_after_secs: None,
                body: stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c)))).boxed(),
            }),
            Scripted::NetworkError => Err(TransportError::Body("connection reset by peer".to_string())),
            Scripted::Delayed(..) => Err(TransportError::Body("unreachable delay".to_string())),
        }
    }
}
