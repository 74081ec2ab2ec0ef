//! # 置顶环
//!
//! 按优先级排好的渠道环与一个可移动的指针，用于粘性路由。
//! 指针可以被管理员手动置顶，渠道被封禁时自动前移，
//! 指向已删除渠道时回到环首。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{SchedulerError, SchedulerResult};
use crate::linfo;
use crate::logging::{LogComponent, LogStage};
use crate::types::{Channel, ChannelId};

/// 指针最近一次移动的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PinReason {
    Manual,
    Ban,
    Invalid,
}

impl PinReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Ban => "ban",
            Self::Invalid => "invalid",
        }
    }
}

/// 指针快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinnedChannelInfo {
    pub channel_id: ChannelId,
    pub moved_at: DateTime<Utc>,
    pub reason: PinReason,
}

/// 指针移动回调，在锁释放后调用
pub type PointerHook = Arc<dyn Fn(&PinnedChannelInfo) + Send + Sync>;

#[derive(Debug, Default)]
struct PinState {
    ring: Vec<ChannelId>,
    built: bool,
    pointer: Option<PinnedChannelInfo>,
}

impl PinState {
    fn contains(&self, id: ChannelId) -> bool {
        self.ring.contains(&id)
    }

    fn move_to(&mut self, id: ChannelId, reason: PinReason, now: DateTime<Utc>) -> PinnedChannelInfo {
        let info = PinnedChannelInfo {
            channel_id: id,
            moved_at: now,
            reason,
        };
        self.pointer = Some(info.clone());
        info
    }

    /// 指针不在环中时回到环首
    fn correct_invalid(&mut self, now: DateTime<Utc>) -> Option<PinnedChannelInfo> {
        let first = *self.ring.first()?;
        match &self.pointer {
            Some(p) if self.contains(p.channel_id) => None,
            _ => Some(self.move_to(first, PinReason::Invalid, now)),
        }
    }

    /// 从 `from` 之后按环序找第一个未封禁的成员
    fn next_unbanned(&self, from: ChannelId, is_banned: &dyn Fn(ChannelId) -> bool) -> Option<ChannelId> {
        let start = self.ring.iter().position(|id| *id == from)?;
        let len = self.ring.len();
        (1..len)
            .map(|offset| self.ring[(start + offset) % len])
            .find(|id| !is_banned(*id))
    }
}

/// 置顶环控制器
#[derive(Default)]
pub struct PinController {
    state: RwLock<PinState>,
    hook: RwLock<Option<PointerHook>>,
}

impl std::fmt::Debug for PinController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("PinController")
            .field("ring", &state.ring)
            .field("pointer", &state.pointer)
            .finish_non_exhaustive()
    }
}

impl PinController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置指针移动回调
    pub fn set_pointer_hook(&self, hook: PointerHook) {
        *self.hook.write().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    fn notify(&self, info: Option<PinnedChannelInfo>) -> Option<PinnedChannelInfo> {
        let info = info?;
        linfo!(
            "system",
            LogStage::Pinning,
            LogComponent::PinController,
            "pointer_moved",
            "置顶指针已移动",
            channel_id = info.channel_id,
            reason = info.reason.as_str()
        );
        let hook = self
            .hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(&info);
        }
        Some(info)
    }

    /// 用启用的渠道重建环：优先级升序、推广优先、ID 升序
    ///
    /// 候选为空时返回 `EmptyRing`，原有环保持不变。
    pub fn refresh_ring(&self, candidates: &[Channel], now: DateTime<Utc>) -> SchedulerResult<Vec<ChannelId>> {
        let mut enabled: Vec<&Channel> = candidates.iter().filter(|c| c.is_enabled()).collect();
        if enabled.is_empty() {
            return Err(SchedulerError::EmptyRing);
        }
        enabled.sort_by_key(|c| (c.priority, !c.promotion, c.id));
        let ring: Vec<ChannelId> = enabled.iter().map(|c| c.id).collect();

        let moved = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.ring.clone_from(&ring);
            state.built = true;
            state.correct_invalid(now)
        };
        self.notify(moved);
        Ok(ring)
    }

    /// 手动置顶；不在环中时不做任何事
    pub fn pin_channel(&self, channel_id: ChannelId, now: DateTime<Utc>) -> bool {
        let moved = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if !state.contains(channel_id) {
                return false;
            }
            state.move_to(channel_id, PinReason::Manual, now)
        };
        self.notify(Some(moved));
        true
    }

    /// 渠道被封禁：若它正是指针，前移到下一个未封禁成员
    ///
    /// 全部成员都被封禁时指针保持不动。
    pub fn on_channel_banned(
        &self,
        channel_id: ChannelId,
        now: DateTime<Utc>,
        is_banned: &dyn Fn(ChannelId) -> bool,
    ) -> Option<PinnedChannelInfo> {
        let moved = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.pointer.as_ref().map(|p| p.channel_id) != Some(channel_id) {
                return None;
            }
            let next = state.next_unbanned(channel_id, is_banned)?;
            Some(state.move_to(next, PinReason::Ban, now))
        };
        self.notify(moved)
    }

    /// 当前指针，读取时顺带修正失效或已封禁的指针
    pub fn pinned_channel(
        &self,
        now: DateTime<Utc>,
        is_banned: &dyn Fn(ChannelId) -> bool,
    ) -> Option<ChannelId> {
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            let pointer = state.pointer.as_ref()?.channel_id;
            if state.contains(pointer) && !is_banned(pointer) {
                return Some(pointer);
            }
        }

        let moved = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            match state.correct_invalid(now) {
                Some(info) => Some(info),
                None => {
                    let current = state.pointer.as_ref()?.channel_id;
                    if is_banned(current) {
                        state
                            .next_unbanned(current, is_banned)
                            .map(|next| state.move_to(next, PinReason::Ban, now))
                    } else {
                        None
                    }
                }
            }
        };
        self.notify(moved);

        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.pointer.as_ref().map(|p| p.channel_id)
    }

    /// 只读快照；尚未建环时为 None
    #[must_use]
    pub fn info(&self) -> Option<PinnedChannelInfo> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if !state.built {
            return None;
        }
        state.pointer.clone()
    }

    #[must_use]
    pub fn ring(&self) -> Vec<ChannelId> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ring
            .clone()
    }

    #[must_use]
    pub fn is_pointer(&self, channel_id: ChannelId) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .pointer
            .as_ref()
            .is_some_and(|p| p.channel_id == channel_id)
    }

    #[must_use]
    pub fn is_built(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).built
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn channels(ids: &[ChannelId]) -> Vec<Channel> {
        ids.iter().map(|id| fixtures::channel(*id, 0)).collect()
    }

    const fn never_banned(_: ChannelId) -> bool {
        false
    }

    #[test]
    fn ring_orders_by_priority_then_promotion_then_id() {
        let pins = PinController::new();
        let mut candidates = vec![
            fixtures::channel(5, 1),
            fixtures::channel(4, 0),
            fixtures::channel(3, 0),
            fixtures::channel(2, 1),
        ];
        candidates[3].promotion = true;
        candidates[1].status = crate::types::EntityStatus::Disabled;

        let ring = pins.refresh_ring(&candidates, Utc::now()).unwrap();
        assert_eq!(ring, vec![3, 2, 5]);
    }

    #[test]
    fn empty_candidates_fail_loudly() {
        let pins = PinController::new();
        assert_eq!(pins.refresh_ring(&[], Utc::now()), Err(SchedulerError::EmptyRing));
        assert!(pins.info().is_none());
    }

    #[test]
    fn first_build_points_at_ring_head() {
        let pins = PinController::new();
        assert!(pins.info().is_none());
        pins.refresh_ring(&channels(&[2, 1]), Utc::now()).unwrap();

        let info = pins.info().unwrap();
        assert_eq!(info.channel_id, 1);
        assert_eq!(info.reason, PinReason::Invalid);
    }

    #[test]
    fn pin_outside_ring_is_noop() {
        let pins = PinController::new();
        let now = Utc::now();
        pins.refresh_ring(&channels(&[1, 2, 3]), now).unwrap();

        assert!(!pins.pin_channel(9, now));
        assert!(pins.pin_channel(3, now));
        let info = pins.info().unwrap();
        assert_eq!((info.channel_id, info.reason), (3, PinReason::Manual));
    }

    #[test]
    fn self_heals_after_pointer_channel_removed() {
        let pins = PinController::new();
        let now = Utc::now();
        pins.refresh_ring(&channels(&[1, 2, 3]), now).unwrap();
        pins.pin_channel(2, now);

        pins.refresh_ring(&channels(&[1, 3]), now).unwrap();
        let info = pins.info().unwrap();
        assert!([1, 3].contains(&info.channel_id));
        assert_eq!(info.reason, PinReason::Invalid);
        assert_eq!(pins.pinned_channel(now, &never_banned), Some(info.channel_id));
    }

    #[test]
    fn ban_advances_past_banned_members_and_wraps() {
        let pins = PinController::new();
        let now = Utc::now();
        pins.refresh_ring(&channels(&[1, 2, 3]), now).unwrap();
        pins.pin_channel(2, now);

        let info = pins.on_channel_banned(2, now, &|id| id == 2 || id == 3).unwrap();
        assert_eq!((info.channel_id, info.reason), (1, PinReason::Ban));

        // 非指针渠道被封禁不影响指针
        assert!(pins.on_channel_banned(3, now, &|_| true).is_none());
        // 全部封禁时保持不动
        assert!(pins.on_channel_banned(1, now, &|_| true).is_none());
        assert!(pins.is_pointer(1));
    }

    #[test]
    fn read_lazily_rotates_banned_pointer() {
        let pins = PinController::new();
        let now = Utc::now();
        pins.refresh_ring(&channels(&[1, 2]), now).unwrap();

        assert_eq!(pins.pinned_channel(now, &|id| id == 1), Some(2));
        assert_eq!(pins.info().unwrap().reason, PinReason::Ban);
    }

    #[test]
    fn hook_sees_every_move() {
        let pins = PinController::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        pins.set_pointer_hook(Arc::new(move |info: &PinnedChannelInfo| {
            sink.lock().unwrap().push((info.channel_id, info.reason));
        }));

        let now = Utc::now();
        pins.refresh_ring(&channels(&[1, 2]), now).unwrap();
        pins.pin_channel(2, now);
        pins.on_channel_banned(2, now, &|id| id == 2);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (1, PinReason::Invalid),
                (2, PinReason::Manual),
                (1, PinReason::Ban)
            ]
        );
    }
}
