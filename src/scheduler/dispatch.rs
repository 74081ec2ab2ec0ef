//! # 实时流量分发
//!
//! 规划选择列表后交给故障转移执行器逐一尝试，结果按完成顺序回写运行时状态。
//! 预算（整体超时、单次超时、最多尝试数）来自 `[dispatch]` 配置，与探测常量无关。
//! 成功后记录会话绑定与用户亲和；调用方读取响应体后把 token 消耗计入凭证 TPM。

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::deadline::Deadline;
use super::failover::{
    AttemptError, AttemptOutcome, FailoverContext, FailoverOutcome, FailoverPolicy, StatusClass,
    classify_status, run_with_failover,
};
use super::runtime::{FailureSeverity, SessionGuard};
use super::service::{RouteConstraints, SchedulerService};
use crate::config::DispatchConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::store::ConfigSource;
use crate::transport::{UpstreamRequest, UpstreamResponse, UpstreamTransport};
use crate::types::{Selection, TokenCount};
use crate::utils::text::summarize_upstream_error_body;
use crate::{linfo, lwarn};

/// 读取错误响应体的上限
const ERROR_BODY_LIMIT: usize = 16 * 1024;

/// 成功分发的响应
///
/// 持有并发会话占用，响应体读完并丢弃后释放。
#[derive(Debug)]
pub struct DispatchResponse {
    pub request_id: String,
    pub selection: Selection,
    pub used_index: usize,
    pub attempts: usize,
    pub response: UpstreamResponse,
    service: Arc<SchedulerService>,
    _session: SessionGuard,
}

impl DispatchResponse {
    /// 把本次请求的 token 消耗计入所用凭证的 TPM
    pub fn record_usage(&self, tokens: TokenCount) {
        if tokens > 0 {
            self.service
                .record_tokens(self.selection.credential_key(), tokens, Utc::now());
        }
    }

    /// 读取 JSON 响应体（最多 `limit` 字节），按其中的 `usage` 记录 token 消耗
    pub async fn into_json(self, limit: usize) -> Result<Value> {
        let Self {
            selection,
            response,
            service,
            _session: _guard,
            ..
        } = self;
        let body = response.read_capped(limit).await?;
        let value: Value = serde_json::from_slice(&body)?;
        if let Some(tokens) = usage_tokens(&value).filter(|t| *t > 0) {
            service.record_tokens(selection.credential_key(), tokens, Utc::now());
        }
        Ok(value)
    }
}

/// 响应体 `usage` 中的 token 总数
///
/// 优先 `total_tokens`，否则累加输入输出两侧（Responses 与 Chat Completions 两种命名）。
#[must_use]
pub fn usage_tokens(body: &Value) -> Option<TokenCount> {
    let usage = body.get("usage")?;
    let field = |name: &str| usage.get(name).and_then(Value::as_u64);
    if let Some(total) = field("total_tokens") {
        return Some(total);
    }
    let parts: Vec<u64> = ["input_tokens", "output_tokens", "prompt_tokens", "completion_tokens"]
        .into_iter()
        .filter_map(field)
        .collect();
    (!parts.is_empty()).then(|| parts.into_iter().fold(0, u64::saturating_add))
}

/// 单次尝试的失败
#[derive(Debug)]
struct AttemptFailure {
    status: Option<u16>,
    message: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

struct Delivered {
    selection: Selection,
    response: UpstreamResponse,
    session: SessionGuard,
}

/// 实时流量分发器
pub struct Dispatcher {
    service: Arc<SchedulerService>,
    source: Arc<dyn ConfigSource>,
    transport: Arc<dyn UpstreamTransport>,
    config: DispatchConfig,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        service: Arc<SchedulerService>,
        source: Arc<dyn ConfigSource>,
        transport: Arc<dyn UpstreamTransport>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            service,
            source,
            transport,
            config,
        }
    }

    /// 分发一次请求
    ///
    /// 截止时间耗尽返回 `DeadlineExceeded`，与上游失败区分。
    pub async fn dispatch(
        &self,
        request_id: Option<&str>,
        request: UpstreamRequest,
        constraints: &RouteConstraints,
    ) -> Result<DispatchResponse> {
        let request_id = request_id.map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        let deadline = Deadline::after(self.config.total_timeout());
        let selections = self
            .service
            .plan(self.source.as_ref(), constraints, Utc::now())
            .await?;

        let ctx = FailoverContext {
            request_id: &request_id,
            deadline,
        };
        let policy = FailoverPolicy::dispatch(&self.config);
        let run = run_with_failover(ctx, &selections, &policy, |_, selection, sub| {
            self.attempt(&request_id, selection, &request, sub)
        })
        .await;

        match run.outcome {
            FailoverOutcome::Success(delivered) => {
                let now = Utc::now();
                self.service.bind_route(constraints, &delivered.selection, now);
                let key = delivered.selection.credential_key();
                if let Err(err) = self.source.touch_credential(key, now).await {
                    lwarn!(
                        &request_id,
                        LogStage::Scheduling,
                        LogComponent::Dispatcher,
                        "touch_credential_failed",
                        "记录凭证使用时间失败",
                        credential = %key,
                        error = %err
                    );
                }
                linfo!(
                    &request_id,
                    LogStage::Scheduling,
                    LogComponent::Dispatcher,
                    "dispatched",
                    "请求已分发",
                    selection = %delivered.selection,
                    attempts = run.attempts
                );
                Ok(DispatchResponse {
                    request_id,
                    selection: delivered.selection,
                    used_index: run.used_index.unwrap_or_default(),
                    attempts: run.attempts,
                    response: delivered.response,
                    service: Arc::clone(&self.service),
                    _session: delivered.session,
                })
            }
            FailoverOutcome::DeadlineExceeded(last) => Err(ProxyError::deadline_exceeded(
                describe(last.as_ref(), "截止时间已到"),
                run.attempts,
            )),
            FailoverOutcome::Exhausted(None) => Err(ProxyError::upstream_not_available(
                "没有可尝试的选择",
            )),
            FailoverOutcome::Exhausted(Some(last)) => {
                let status = match &last {
                    AttemptError::Failed { error, .. } => error.status,
                    AttemptError::TimedOut { .. } => None,
                };
                Err(ProxyError::bad_gateway(
                    format!("{} 次尝试全部失败，最后一次: {last}", run.attempts),
                    status,
                ))
            }
        }
    }

    async fn attempt(
        &self,
        request_id: &str,
        selection: Selection,
        request: &UpstreamRequest,
        sub: Deadline,
    ) -> AttemptOutcome<Delivered, AttemptFailure> {
        let key = selection.credential_key();
        let session = self.service.begin_session(key);

        let sent = tokio::time::timeout_at(sub.instant(), self.transport.send(&selection, request)).await;
        let now = Utc::now();
        let response = match sent {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                self.service
                    .record_failure(&selection, FailureSeverity::Critical, now);
                return AttemptOutcome::Retryable(AttemptFailure {
                    status: None,
                    message: err.to_string(),
                });
            }
            Err(_) => {
                self.service
                    .record_failure(&selection, FailureSeverity::Major, now);
                return AttemptOutcome::Retryable(AttemptFailure {
                    status: None,
                    message: "上游响应超时".to_string(),
                });
            }
        };

        let status = response.status;
        match classify_status(status) {
            StatusClass::Success => {
                self.service.record_success(&selection, 0, now);
                AttemptOutcome::Success(Delivered {
                    selection,
                    response,
                    session,
                })
            }
            class => {
                let retry_after = response
                    .retry_after_secs
                    .and_then(|secs| i64::try_from(secs).ok())
                    .and_then(TimeDelta::try_seconds)
                    .map(|delta| now + delta);
                let message = match response.read_capped(ERROR_BODY_LIMIT).await {
                    Ok(body) => summarize_upstream_error_body(&body),
                    Err(err) => err.to_string(),
                };
                let failure = AttemptFailure {
                    status: Some(status),
                    message,
                };
                lwarn!(
                    request_id,
                    LogStage::Upstream,
                    LogComponent::Dispatcher,
                    "upstream_status",
                    "上游返回错误状态",
                    selection = %selection,
                    status = status
                );
                self.classify_failure(&selection, class, retry_after, now, failure)
            }
        }
    }

    fn classify_failure(
        &self,
        selection: &Selection,
        class: StatusClass,
        retry_after: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        failure: AttemptFailure,
    ) -> AttemptOutcome<Delivered, AttemptFailure> {
        let status = failure.status.unwrap_or_default();
        match (class, status) {
            (_, 404 | 405) => {
                self.service
                    .record_failure(selection, FailureSeverity::Critical, now);
                AttemptOutcome::Retryable(failure)
            }
            (StatusClass::Retryable, 401..=403 | 429) => {
                self.service
                    .cool_credential(selection.credential_key(), Some(status), retry_after, now);
                self.service
                    .record_failure(selection, FailureSeverity::Minor, now);
                AttemptOutcome::Retryable(failure)
            }
            (StatusClass::Retryable, _) => {
                self.service
                    .record_failure(selection, FailureSeverity::Major, now);
                AttemptOutcome::Retryable(failure)
            }
            _ => AttemptOutcome::Terminal(failure),
        }
    }
}

fn describe(last: Option<&AttemptError<AttemptFailure>>, fallback: &str) -> String {
    last.map_or_else(|| fallback.to_string(), |err| format!("{fallback}: {err}"))
}
