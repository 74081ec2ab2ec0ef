//! # 滑动窗口计数
//!
//! 60 个一秒桶组成的一分钟窗口。每个桶是一个原子量，高 32 位存桶所属的秒，
//! 低 32 位存计数；轮换与累加在同一次原子更新内完成，读取不阻塞写入。

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

const BUCKETS: usize = 60;
const COUNT_MASK: u64 = u32::MAX as u64;

fn epoch_of(second: i64) -> u64 {
    // 1970 年之前的时间戳按 0 处理
    u64::from(u32::try_from(second).unwrap_or(0))
}

const fn pack(epoch: u64, count: u64) -> u64 {
    (epoch << 32) | (count & COUNT_MASK)
}

const fn unpack(state: u64) -> (u64, u64) {
    (state >> 32, state & COUNT_MASK)
}

/// 一分钟滑动窗口
#[derive(Debug)]
pub struct SlidingWindow {
    buckets: [AtomicU64; BUCKETS],
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl SlidingWindow {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(epoch: u64) -> usize {
        usize::try_from(epoch % BUCKETS as u64).unwrap_or_default()
    }

    /// 在 `now` 所在的秒桶累加，单桶计数饱和于 `u32::MAX`
    pub fn add(&self, now: DateTime<Utc>, amount: u64) {
        if amount == 0 {
            return;
        }
        let epoch = epoch_of(now.timestamp());
        let bucket = &self.buckets[Self::slot(epoch)];
        let _ = bucket.fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
            let (current, count) = unpack(state);
            let base = if current == epoch { count } else { 0 };
            Some(pack(epoch, base.saturating_add(amount).min(COUNT_MASK)))
        });
    }

    /// 最近 60 秒内的总和
    #[must_use]
    pub fn total(&self, now: DateTime<Utc>) -> u64 {
        let epoch = epoch_of(now.timestamp());
        self.buckets
            .iter()
            .map(|bucket| unpack(bucket.load(Ordering::Acquire)))
            .filter(|(at, count)| *count > 0 && *at <= epoch && epoch - *at < BUCKETS as u64)
            .map(|(_, count)| count)
            .sum()
    }
}
