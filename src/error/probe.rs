use thiserror::Error;

use super::{ProxyError, SchedulerError};
use crate::types::TestResult;

/// 渠道探测错误
///
/// 单次尝试的失败不会出现在这里，它们被汇总进 `Failed`。
#[derive(Debug, Error)]
pub enum ProbeError {
    /// 找不到渠道、端点或没有可用凭证
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// 读写配置源失败
    #[error("配置源访问失败: {0}")]
    Store(#[source] Box<ProxyError>),

    /// 所有或部分模型探测失败，文本为汇总信息
    #[error("{summary}")]
    Failed {
        summary: String,
        latency_ms: u64,
        results: Vec<TestResult>,
    },
}
