//! # 调度模块
//!
//! 可用凭证解析、运行时状态、置顶环、故障转移与实时分发，
//! 以及封禁到期后的认领、会话绑定和用户亲和。
//! 所有共享状态由 [`SchedulerService`] 持有，进程启动时构造一次后以 `Arc` 传递。

pub mod deadline;
pub mod dispatch;
pub mod eligibility;
pub mod failover;
pub mod pinning;
pub mod runtime;
pub mod service;
pub mod window;

pub use deadline::Deadline;
pub use dispatch::{DispatchResponse, Dispatcher, usage_tokens};
pub use eligibility::{ChannelCapability, capability_for, list_selections};
pub use failover::{
    AttemptError, AttemptOutcome, FailoverContext, FailoverOutcome, FailoverPolicy, FailoverRun,
    StatusClass, classify_status, run_with_failover,
};
pub use pinning::{PinController, PinReason, PinnedChannelInfo, PointerHook};
pub use runtime::{
    DEFAULT_PROBE_DUE_LIMIT, FailureOutcome, FailureSeverity, RuntimeChannelStats,
    RuntimeCredentialStats, RuntimeStateTracker, SessionGuard,
};
pub use service::{RouteConstraints, SchedulerService};

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// 将 `std` 时长加到时间戳上，溢出时饱和
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
