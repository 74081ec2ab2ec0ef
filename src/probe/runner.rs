//! # 渠道探测
//!
//! 对渠道的一个或多个模型发起流式探测：逐模型在可用选择上做故障转移，
//! 汇总为渠道级的健康结论与延迟，并通过配置源持久化。
//!
//! 后台模式下只探测封禁已到期的渠道：认领后探测，通过则解除封禁，否则立即重新封禁。

use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

use super::sampler::{SamplerLimits, sample_stream};
use super::summary::{aggregate, fail_message, ok_message};
use crate::config::ProbeConfig;
use crate::error::{ProbeError, SchedulerError};
use crate::logging::{LogComponent, LogStage};
use crate::scheduler::{
    AttemptError, AttemptOutcome, Deadline, FailoverContext, FailoverOutcome, FailoverPolicy,
    FailureSeverity, SchedulerService, StatusClass, capability_for, classify_status,
    list_selections, run_with_failover,
};
use crate::store::ConfigSource;
use crate::transport::{UpstreamRequest, UpstreamTransport};
use crate::types::{Channel, ChannelId, ChannelModelId, Selection, TestResult};
use crate::utils::text::summarize_upstream_error_body;
use crate::{linfo, lwarn};

/// 错误响应体最多读取的字节数
const ERROR_BODY_LIMIT: usize = 256 * 1024;

/// 待探测的模型
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub public_model: String,
    pub upstream_model: String,
}

/// 单次尝试的失败，携带已测得的结果
#[derive(Debug)]
struct FailedAttempt(TestResult);

impl fmt::Display for FailedAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.error)
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// 渠道探测器
pub struct ChannelProber {
    source: Arc<dyn ConfigSource>,
    transport: Arc<dyn UpstreamTransport>,
    service: Arc<SchedulerService>,
    config: ProbeConfig,
}

impl fmt::Debug for ChannelProber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelProber")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChannelProber {
    #[must_use]
    pub fn new(
        source: Arc<dyn ConfigSource>,
        transport: Arc<dyn UpstreamTransport>,
        service: Arc<SchedulerService>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            source,
            transport,
            service,
            config,
        }
    }

    /// 探测渠道，健康时返回汇总信息
    ///
    /// `model_ids` 为空时探测渠道下所有启用的模型，渠道没有模型时使用该类型的默认模型。
    /// 准备阶段失败（模型、端点或凭证不可用）也会持久化一次失败结果。
    pub async fn run_channel_probe(
        &self,
        channel_id: ChannelId,
        model_ids: Option<Vec<ChannelModelId>>,
    ) -> Result<String, ProbeError> {
        let request_id = format!("probe-{}", uuid::Uuid::new_v4());
        let channel = self
            .source
            .get_channel(channel_id)
            .await
            .map_err(|e| ProbeError::Store(Box::new(e)))?
            .ok_or(SchedulerError::ChannelNotFound { channel_id })?;

        let targets = match self.gather_targets(&channel, model_ids.as_deref()).await {
            Ok(targets) => targets,
            Err(err) => {
                self.persist_preparation_failure(&request_id, channel_id).await;
                return Err(err);
            }
        };

        // 批次截止时间在准备之前开始计时
        let deadline = Deadline::after(self.config.batch_timeout(targets.len()));

        let mut selections = match self.prepare_selections(&channel).await {
            Ok(selections) => selections,
            Err(err) => {
                lwarn!(
                    &request_id,
                    LogStage::Probe,
                    LogComponent::Prober,
                    "probe_preparation_failed",
                    "探测准备失败",
                    channel_id = channel_id,
                    error = %err
                );
                self.persist_preparation_failure(&request_id, channel_id).await;
                return Err(err);
            }
        };

        let policy = FailoverPolicy::probe(self.config.attempt_timeout());
        let ctx = FailoverContext {
            request_id: &request_id,
            deadline,
        };
        let mut results = Vec::with_capacity(targets.len());
        for target in &targets {
            let (result, used_index) = self.probe_model(ctx, &channel, target, &selections, &policy).await;
            if let Some(used) = used_index.filter(|used| *used > 0 && *used < selections.len()) {
                selections.swap(0, used);
            }
            results.push(result);
        }

        let (ok, latency_ms) = aggregate(&results);
        self.source
            .update_channel_test(channel_id, ok, latency_ms, Utc::now())
            .await
            .map_err(|e| ProbeError::Store(Box::new(e)))?;

        linfo!(
            &request_id,
            LogStage::Probe,
            LogComponent::Prober,
            "probe_finished",
            "渠道探测完成",
            channel_id = channel_id,
            ok = ok,
            latency_ms = latency_ms,
            models = results.len()
        );

        if ok {
            Ok(ok_message(&results, latency_ms))
        } else {
            Err(ProbeError::Failed {
                summary: fail_message(&results, latency_ms),
                latency_ms,
                results,
            })
        }
    }

    /// 探测封禁已到期的渠道，最多 `max` 个（0 取默认值），按到期先后
    ///
    /// 已被其他请求认领的渠道跳过；渠道已删除或停用时清除其待探测状态。
    pub async fn run_due_probes(&self, max: usize) -> Vec<(ChannelId, Result<String, ProbeError>)> {
        let now = Utc::now();
        let mut outcomes = Vec::new();
        for channel_id in self.service.probe_due_channels(now, max) {
            if !self.service.claim_probe_due(channel_id, now) {
                continue;
            }
            match self.source.get_channel(channel_id).await {
                Ok(Some(channel)) if channel.is_enabled() => {}
                Ok(_) => {
                    self.service.clear_probe(channel_id, now);
                    continue;
                }
                Err(err) => {
                    self.service.release_probe_claim(channel_id);
                    outcomes.push((channel_id, Err(ProbeError::Store(Box::new(err)))));
                    continue;
                }
            }

            let outcome = self.run_channel_probe(channel_id, None).await;
            match &outcome {
                Ok(_) => self.service.clear_channel_ban(channel_id),
                Err(err) => {
                    let until = self.service.ban_after_failed_probe(channel_id, Utc::now());
                    lwarn!(
                        "system",
                        LogStage::Probe,
                        LogComponent::Prober,
                        "due_probe_failed",
                        "到期渠道探测未通过，重新封禁",
                        channel_id = channel_id,
                        banned_until = %until,
                        error = %err
                    );
                }
            }
            outcomes.push((channel_id, outcome));
        }
        outcomes
    }

    async fn gather_targets(
        &self,
        channel: &Channel,
        model_ids: Option<&[ChannelModelId]>,
    ) -> Result<Vec<ProbeTarget>, ProbeError> {
        if let Some(ids) = model_ids.filter(|ids| !ids.is_empty()) {
            let mut targets = Vec::with_capacity(ids.len());
            for &model_id in ids {
                let model = self
                    .source
                    .get_channel_model(model_id)
                    .await
                    .map_err(|e| ProbeError::Store(Box::new(e)))?
                    .filter(|m| m.channel_id == channel.id)
                    .ok_or(SchedulerError::ModelNotFound {
                        channel_id: channel.id,
                        model_id,
                    })?;
                targets.push(ProbeTarget {
                    public_model: model.public_id.clone(),
                    upstream_model: model.upstream_name().to_string(),
                });
            }
            return Ok(targets);
        }

        let models = self
            .source
            .list_enabled_channel_models(channel.id)
            .await
            .map_err(|e| ProbeError::Store(Box::new(e)))?;
        if models.is_empty() {
            let fallback = self.config.default_models.for_type(channel.channel_type);
            return Ok(vec![ProbeTarget {
                public_model: fallback.to_string(),
                upstream_model: fallback.to_string(),
            }]);
        }
        Ok(models
            .iter()
            .map(|m| ProbeTarget {
                public_model: m.public_id.clone(),
                upstream_model: m.upstream_name().to_string(),
            })
            .collect())
    }

    async fn prepare_selections(&self, channel: &Channel) -> Result<Vec<Selection>, ProbeError> {
        let endpoint = self
            .source
            .get_endpoint_by_channel(channel.id)
            .await
            .map_err(|e| ProbeError::Store(Box::new(e)))?;
        let credentials = match &endpoint {
            Some(ep) => self
                .source
                .list_credentials_by_endpoint(ep.id)
                .await
                .map_err(|e| ProbeError::Store(Box::new(e)))?,
            None => Vec::new(),
        };
        Ok(list_selections(channel, endpoint.as_ref(), &credentials, Utc::now())?)
    }

    async fn persist_preparation_failure(&self, request_id: &str, channel_id: ChannelId) {
        if let Err(err) = self
            .source
            .update_channel_test(channel_id, false, 0, Utc::now())
            .await
        {
            lwarn!(
                request_id,
                LogStage::Probe,
                LogComponent::Prober,
                "persist_failed",
                "探测结果持久化失败",
                channel_id = channel_id,
                error = %err
            );
        }
    }

    async fn probe_model(
        &self,
        ctx: FailoverContext<'_>,
        channel: &Channel,
        target: &ProbeTarget,
        selections: &[Selection],
        policy: &FailoverPolicy,
    ) -> (TestResult, Option<usize>) {
        let request = capability_for(channel.channel_type).build_probe_request(&target.upstream_model, &self.config);
        let request = &request;

        let run = run_with_failover(ctx, selections, policy, |_, selection, sub| async move {
            self.attempt(target, selection, request, sub).await
        })
        .await;

        let result = match run.outcome {
            FailoverOutcome::Success(result) => result,
            FailoverOutcome::Exhausted(last) => failed_result(target, last, None),
            FailoverOutcome::DeadlineExceeded(last) => {
                failed_result(target, last, Some("probe deadline exceeded"))
            }
        };
        (result, run.used_index)
    }

    async fn attempt(
        &self,
        target: &ProbeTarget,
        selection: Selection,
        request: &UpstreamRequest,
        sub: Deadline,
    ) -> AttemptOutcome<TestResult, FailedAttempt> {
        let start = Instant::now();
        let exchange = async {
            let response = match self.transport.send(&selection, request).await {
                Ok(response) => response,
                Err(err) => {
                    self.report(&selection, FailureSeverity::Critical, None);
                    return AttemptOutcome::Retryable(FailedAttempt(TestResult {
                        ttft_ms: elapsed_ms(start),
                        error: format!("request upstream failed: {err}"),
                        ..target.empty_result()
                    }));
                }
            };

            let status = response.status;
            match classify_status(status) {
                StatusClass::Success => {
                    let content_type = response.content_type.clone();
                    let sample = sample_stream(
                        response.body,
                        start,
                        content_type.as_deref(),
                        &SamplerLimits::from(&self.config),
                    )
                    .await;
                    let ttft_ms = sample.ttft_ms.filter(|ms| *ms > 0).unwrap_or_else(|| elapsed_ms(start));
                    if sample.is_usable() {
                        if self.config.report_outcomes {
                            self.service.record_success(&selection, 0, Utc::now());
                        }
                        AttemptOutcome::Success(TestResult {
                            ok: true,
                            ttft_ms,
                            sample: sample.text,
                            ..target.empty_result()
                        })
                    } else {
                        self.report(&selection, FailureSeverity::Major, None);
                        AttemptOutcome::Retryable(FailedAttempt(TestResult {
                            ttft_ms,
                            error: sample.error.unwrap_or_default(),
                            ..target.empty_result()
                        }))
                    }
                }
                class => {
                    let retry_after = response.retry_after_secs;
                    let body = response.read_capped(ERROR_BODY_LIMIT).await.unwrap_or_default();
                    let summary = summarize_upstream_error_body(&body);
                    let error = if summary.is_empty() {
                        format!("status {status}")
                    } else {
                        format!("status {status}: {summary}")
                    };
                    self.report_status(&selection, class, status, retry_after);
                    let failed = FailedAttempt(TestResult {
                        ttft_ms: elapsed_ms(start),
                        error,
                        ..target.empty_result()
                    });
                    if class == StatusClass::Retryable {
                        AttemptOutcome::Retryable(failed)
                    } else {
                        AttemptOutcome::Terminal(failed)
                    }
                }
            }
        };

        match tokio::time::timeout_at(sub.instant(), exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.report(&selection, FailureSeverity::Major, None);
                AttemptOutcome::Retryable(FailedAttempt(TestResult {
                    ttft_ms: elapsed_ms(start),
                    error: "attempt timed out".to_string(),
                    ..target.empty_result()
                }))
            }
        }
    }

    fn report(&self, selection: &Selection, severity: FailureSeverity, cool_status: Option<(u16, Option<u64>)>) {
        if !self.config.report_outcomes {
            return;
        }
        let now = Utc::now();
        if let Some((status, retry_after)) = cool_status {
            let upstream_until = retry_after
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(chrono::TimeDelta::try_seconds)
                .map(|delta| now + delta);
            self.service
                .cool_credential(selection.credential_key(), Some(status), upstream_until, now);
        }
        self.service.record_failure(selection, severity, now);
    }

    fn report_status(&self, selection: &Selection, class: StatusClass, status: u16, retry_after: Option<u64>) {
        match (class, status) {
            (_, 404 | 405) => self.report(selection, FailureSeverity::Critical, None),
            (StatusClass::Retryable, 401..=403 | 429) => {
                self.report(selection, FailureSeverity::Minor, Some((status, retry_after)));
            }
            (StatusClass::Retryable, _) => self.report(selection, FailureSeverity::Major, None),
            _ => {}
        }
    }
}

/// 故障转移失败后的结果，保留最后一次尝试测得的 TTFT
fn failed_result(
    target: &ProbeTarget,
    last: Option<AttemptError<FailedAttempt>>,
    prefix: Option<&str>,
) -> TestResult {
    let mut result = match last {
        Some(AttemptError::Failed { error, .. }) => error.0,
        Some(AttemptError::TimedOut { after }) => TestResult {
            ttft_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
            error: "attempt timed out".to_string(),
            ..target.empty_result()
        },
        None => TestResult {
            error: prefix.unwrap_or("no attempt was made").to_string(),
            ..target.empty_result()
        },
    };
    if let Some(prefix) = prefix.filter(|p| *p != result.error) {
        result.error = format!("{prefix}: {}", result.error);
    }
    result
}

impl ProbeTarget {
    fn empty_result(&self) -> TestResult {
        TestResult {
            public_model: self.public_model.clone(),
            upstream_model: self.upstream_model.clone(),
            ok: false,
            ttft_ms: 0,
            sample: String::new(),
            error: String::new(),
        }
    }
}
