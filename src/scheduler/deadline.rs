//! # 截止时间

use std::time::Duration;
use tokio::time::Instant;

/// 超出 `Instant` 表示范围时使用的远期偏移，约 30 年
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// 一次分发或探测的截止时间
///
/// 基于 `tokio::time::Instant`，测试中可用暂停时钟推进。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// 从现在起 `timeout` 之后，溢出时饱和到远期
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        let at = now
            .checked_add(timeout)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        Self { at }
    }

    #[must_use]
    pub const fn at(at: Instant) -> Self {
        Self { at }
    }

    #[must_use]
    pub const fn instant(self) -> Instant {
        self.at
    }

    #[must_use]
    pub fn is_expired(self) -> bool {
        Instant::now() >= self.at
    }

    #[must_use]
    pub fn remaining(self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// 嵌套在当前截止时间内的子截止时间
    #[must_use]
    pub fn child(self, timeout: Duration) -> Self {
        self.min(Self::after(timeout))
    }
}
