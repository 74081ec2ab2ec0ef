//! # 故障转移执行器
//!
//! 按顺序对选择列表逐一尝试，第一个成功即返回其下标。
//! 每次尝试前检查外层截止时间；每次尝试自身再套一层子截止时间。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use super::deadline::Deadline;
use crate::config::DispatchConfig;
use crate::logging::{LogComponent, LogStage};
use crate::types::Selection;
use crate::{ldebug, lwarn};

/// HTTP 状态分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Retryable,
    Terminal,
}

/// 按状态码分类：凭证级与服务端错误都值得换一个选择再试
#[must_use]
pub const fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        401..=403 | 408 | 429 | 500..=599 => StatusClass::Retryable,
        _ => StatusClass::Terminal,
    }
}

/// 单次尝试的结果，由调用方分类
#[derive(Debug)]
pub enum AttemptOutcome<T, E> {
    Success(T),
    Retryable(E),
    Terminal(E),
}

/// 单次尝试失败的原因
#[derive(Debug)]
pub enum AttemptError<E> {
    Failed { error: E, terminal: bool },
    TimedOut { after: Duration },
}

impl<E: Display> Display for AttemptError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { error, .. } => Display::fmt(error, f),
            Self::TimedOut { after } => write!(f, "attempt timed out after {}ms", after.as_millis()),
        }
    }
}

/// 尝试次数与超时策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverPolicy {
    /// 单次尝试的超时，None 表示只受外层截止时间约束
    pub attempt_timeout: Option<Duration>,
    /// 最多尝试的选择数，None 表示不限
    pub max_attempts: Option<usize>,
    /// 遇到不可重试结果时立即停止
    pub stop_on_terminal: bool,
}

impl FailoverPolicy {
    /// 健康探测：所有失败都继续尝试下一个凭证
    #[must_use]
    pub const fn probe(attempt_timeout: Duration) -> Self {
        Self {
            attempt_timeout: Some(attempt_timeout),
            max_attempts: None,
            stop_on_terminal: false,
        }
    }

    /// 实时流量，预算来自配置
    #[must_use]
    pub const fn dispatch(config: &DispatchConfig) -> Self {
        Self {
            attempt_timeout: Some(config.attempt_timeout()),
            max_attempts: config.attempt_limit(),
            stop_on_terminal: config.stop_on_terminal,
        }
    }
}

/// 一次执行的上下文
#[derive(Debug, Clone, Copy)]
pub struct FailoverContext<'a> {
    pub request_id: &'a str,
    pub deadline: Deadline,
}

/// 执行结果
#[derive(Debug)]
pub enum FailoverOutcome<T, E> {
    Success(T),
    /// 所有选择都失败，携带最后一次失败
    Exhausted(Option<AttemptError<E>>),
    /// 外层截止时间耗尽，与上游失败区分
    DeadlineExceeded(Option<AttemptError<E>>),
}

/// 执行结果与统计
#[derive(Debug)]
pub struct FailoverRun<T, E> {
    pub outcome: FailoverOutcome<T, E>,
    /// 成功选择的下标
    pub used_index: Option<usize>,
    /// 实际发起的尝试次数
    pub attempts: usize,
}

impl<T, E> FailoverRun<T, E> {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, FailoverOutcome::Success(_))
    }
}

/// 按顺序尝试选择直到成功、耗尽或截止时间到达
///
/// `attempt` 接收下标、选择以及本次尝试的截止时间。
pub async fn run_with_failover<T, E, F, Fut>(
    ctx: FailoverContext<'_>,
    selections: &[Selection],
    policy: &FailoverPolicy,
    mut attempt: F,
) -> FailoverRun<T, E>
where
    E: Display,
    F: FnMut(usize, Selection, Deadline) -> Fut,
    Fut: Future<Output = AttemptOutcome<T, E>>,
{
    let limit = policy
        .max_attempts
        .map_or(selections.len(), |max| max.min(selections.len()));
    let mut attempts = 0;
    let mut last_error = None;

    for (index, selection) in selections.iter().take(limit).enumerate() {
        if ctx.deadline.is_expired() {
            return deadline_exceeded(ctx, attempts, last_error);
        }

        let sub = policy
            .attempt_timeout
            .map_or(ctx.deadline, |timeout| ctx.deadline.child(timeout));
        let budget = sub.remaining();
        attempts += 1;

        let result = tokio::time::timeout_at(sub.instant(), attempt(index, selection.clone(), sub)).await;
        let error = match result {
            Ok(AttemptOutcome::Success(value)) => {
                ldebug!(
                    ctx.request_id,
                    LogStage::Failover,
                    LogComponent::Failover,
                    "attempt_succeeded",
                    "选择尝试成功",
                    index = index,
                    attempts = attempts,
                    selection = %selection
                );
                return FailoverRun {
                    outcome: FailoverOutcome::Success(value),
                    used_index: Some(index),
                    attempts,
                };
            }
            Ok(AttemptOutcome::Retryable(error)) => AttemptError::Failed {
                error,
                terminal: false,
            },
            Ok(AttemptOutcome::Terminal(error)) => AttemptError::Failed {
                error,
                terminal: true,
            },
            Err(_) => AttemptError::TimedOut { after: budget },
        };

        lwarn!(
            ctx.request_id,
            LogStage::Failover,
            LogComponent::Failover,
            "attempt_failed",
            "选择尝试失败，尝试下一个",
            index = index,
            selection = %selection,
            error = %error
        );

        let terminal = matches!(error, AttemptError::Failed { terminal: true, .. });
        last_error = Some(error);
        if ctx.deadline.is_expired() {
            return deadline_exceeded(ctx, attempts, last_error);
        }
        if terminal && policy.stop_on_terminal {
            break;
        }
    }

    FailoverRun {
        outcome: FailoverOutcome::Exhausted(last_error),
        used_index: None,
        attempts,
    }
}

fn deadline_exceeded<T, E>(
    ctx: FailoverContext<'_>,
    attempts: usize,
    last_error: Option<AttemptError<E>>,
) -> FailoverRun<T, E> {
    lwarn!(
        ctx.request_id,
        LogStage::Failover,
        LogComponent::Failover,
        "deadline_exceeded",
        "截止时间已到，停止故障转移",
        attempts = attempts
    );
    FailoverRun {
        outcome: FailoverOutcome::DeadlineExceeded(last_error),
        used_index: None,
        attempts,
    }
}
