//! # 运行时状态
//!
//! 按渠道与凭证维护失败分、封禁、冷却与 RPM/TPM/并发计数。
//! 每个键一条记录，互不争用；锁只在方法内部短暂持有。
//!
//! 封禁到期的渠道进入待探测状态，由一个请求（或后台探测）认领后验证；
//! 会话路由绑定与用户渠道亲和也在这里按 TTL 维护。

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use super::add_duration;
use super::window::SlidingWindow;
use crate::config::SchedulerConfig;
use crate::logging::{LogComponent, LogStage};
use crate::types::{ChannelId, CredentialKey, CredentialLimits, Selection, TokenCount, UserId};
use crate::{ldebug, linfo, lwarn};

/// `list_probe_due` 的默认条数
pub const DEFAULT_PROBE_DUE_LIMIT: usize = 20;

/// 失败严重度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSeverity {
    /// 凭证级问题，换凭证即可
    Minor,
    /// 上游异常
    Major,
    /// 端点不可达或配置错误，立即封禁
    Critical,
}

/// 一次失败记录后的渠道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub fail_score: u32,
    pub ban_streak: u32,
    pub banned_until: Option<DateTime<Utc>>,
    /// 本次失败触发（或延长）了封禁
    pub ban_triggered: bool,
}

/// 渠道运行时快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeChannelStats {
    pub channel_id: ChannelId,
    pub fail_score: u32,
    pub ban_streak: u32,
    pub banned_until: Option<DateTime<Utc>>,
    pub forced_until: Option<DateTime<Utc>>,
    pub probe_due: bool,
    pub probe_claimed: bool,
    pub pinned: bool,
}

/// 凭证运行时快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeCredentialStats {
    pub key: CredentialKey,
    pub rpm: u64,
    pub tpm: u64,
    pub sessions: u32,
    pub fail_score: u32,
    pub cooling_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ChannelState {
    fail_score: u32,
    ban_streak: u32,
    banned_until: Option<DateTime<Utc>>,
    forced_until: Option<DateTime<Utc>>,
    probe_due_at: Option<DateTime<Utc>>,
    probe_claimed_until: Option<DateTime<Utc>>,
}

impl ChannelState {
    fn is_banned(&self, now: DateTime<Utc>) -> bool {
        self.banned_until.is_some_and(|until| until > now)
    }

    /// 封禁到期则解除封禁，以到期时间标记待探测并清除旧认领
    fn expire_ban(&mut self, now: DateTime<Utc>) -> bool {
        match self.banned_until {
            Some(until) if until <= now => {
                self.banned_until = None;
                self.probe_due_at = Some(until);
                self.probe_claimed_until = None;
                true
            }
            _ => false,
        }
    }

    /// 待探测时间，包含尚未清扫的到期封禁
    fn due_since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.probe_due_at
            .or_else(|| self.banned_until.filter(|until| *until <= now))
    }

    fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.probe_claimed_until.is_some_and(|until| until > now)
    }

    fn reset_probe(&mut self) {
        self.probe_due_at = None;
        self.probe_claimed_until = None;
    }
}

#[derive(Debug, Clone)]
struct RouteBinding {
    selection: Selection,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Affinity {
    channel_id: ChannelId,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CredentialHealth {
    fail_score: u32,
    cooling_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct CredentialState {
    rpm: SlidingWindow,
    tpm: SlidingWindow,
    sessions: AtomicU32,
    health: Mutex<CredentialHealth>,
}

impl CredentialState {
    fn with_health<R>(&self, f: impl FnOnce(&mut CredentialHealth) -> R) -> R {
        let mut guard = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

/// 并发会话占用，释放时自动减计数
#[derive(Debug)]
pub struct SessionGuard {
    state: Arc<CredentialState>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // 不会低于 0
        let _ = self
            .state
            .sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// 运行时状态跟踪器
#[derive(Debug)]
pub struct RuntimeStateTracker {
    config: SchedulerConfig,
    channels: DashMap<ChannelId, ChannelState>,
    credentials: DashMap<CredentialKey, Arc<CredentialState>>,
    bindings: DashMap<(UserId, String), RouteBinding>,
    affinity: DashMap<UserId, Affinity>,
    last_success: RwLock<Option<(Selection, DateTime<Utc>)>>,
}

impl RuntimeStateTracker {
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            channels: DashMap::new(),
            credentials: DashMap::new(),
            bindings: DashMap::new(),
            affinity: DashMap::new(),
            last_success: RwLock::new(None),
        }
    }

    fn credential(&self, key: CredentialKey) -> Arc<CredentialState> {
        if let Some(state) = self.credentials.get(&key) {
            return Arc::clone(state.value());
        }
        Arc::clone(self.credentials.entry(key).or_default().value())
    }

    const fn weight(&self, severity: FailureSeverity) -> u32 {
        match severity {
            FailureSeverity::Minor => self.config.severity_weights.minor,
            FailureSeverity::Major => self.config.severity_weights.major,
            FailureSeverity::Critical => self.config.failure_threshold,
        }
    }

    /// 后台探测失败后的封禁时长
    #[must_use]
    pub const fn probe_failure_ban(&self) -> Duration {
        self.config.probe_failure_ban()
    }

    /// 第 `streak` 次封禁的时长：`base * 2^streak`，不超过上限
    #[must_use]
    pub fn ban_backoff(&self, streak: u32) -> Duration {
        let factor = 2_u32.saturating_pow(streak.min(16));
        self.config
            .ban_base()
            .saturating_mul(factor)
            .min(self.config.ban_cap())
    }

    /// 成功：失败分减半，刷新计数，记录最近成功
    pub fn record_success(&self, selection: &Selection, tokens: TokenCount, now: DateTime<Utc>) {
        {
            let mut channel = self.channels.entry(selection.channel_id).or_default();
            channel.expire_ban(now);
            channel.fail_score /= 2;
            channel.reset_probe();
        }

        let credential = self.credential(selection.credential_key());
        credential.rpm.add(now, 1);
        credential.tpm.add(now, tokens);
        credential.with_health(|health| {
            health.fail_score /= 2;
            health.cooling_until = None;
        });

        let mut last = self
            .last_success
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *last = Some((selection.clone(), now));
    }

    /// 补记一次请求的 token 消耗
    pub fn record_tokens(&self, key: CredentialKey, tokens: TokenCount, now: DateTime<Utc>) {
        self.credential(key).tpm.add(now, tokens);
    }

    /// 失败：按严重度加分，越过阈值时封禁渠道
    pub fn record_failure(
        &self,
        selection: &Selection,
        severity: FailureSeverity,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        let weight = self.weight(severity);

        let credential = self.credential(selection.credential_key());
        credential.rpm.add(now, 1);
        credential.with_health(|health| {
            health.fail_score = health.fail_score.saturating_add(weight);
        });

        let outcome = {
            let mut channel = self.channels.entry(selection.channel_id).or_default();
            channel.fail_score = channel.fail_score.saturating_add(weight);

            let mut ban_triggered = false;
            if channel.fail_score >= self.config.failure_threshold {
                let backoff = self.ban_backoff(channel.ban_streak);
                let start = channel.banned_until.filter(|until| *until > now).unwrap_or(now);
                let ceiling = add_duration(now, self.config.ban_cap());
                channel.banned_until = Some(add_duration(start, backoff).min(ceiling));
                channel.ban_streak = (channel.ban_streak + 1).min(self.config.ban_streak_cap);
                channel.probe_due_at = None;
                ban_triggered = true;
            }
            // 认领者的结果已出，其他请求可以再次认领
            channel.probe_claimed_until = None;

            FailureOutcome {
                fail_score: channel.fail_score,
                ban_streak: channel.ban_streak,
                banned_until: channel.banned_until,
                ban_triggered,
            }
        };

        if outcome.ban_triggered {
            lwarn!(
                "system",
                LogStage::Scheduling,
                LogComponent::RuntimeTracker,
                "channel_banned",
                "渠道失败分越过阈值，进入封禁",
                channel_id = selection.channel_id,
                fail_score = outcome.fail_score,
                ban_streak = outcome.ban_streak,
                banned_until = ?outcome.banned_until,
                severity = ?severity
            );
        }
        outcome
    }

    /// 管理员解除封禁，同时清零失败分与连续封禁计数
    pub fn clear_ban(&self, channel_id: ChannelId) {
        if let Some(mut channel) = self.channels.get_mut(&channel_id) {
            channel.banned_until = None;
            channel.ban_streak = 0;
            channel.fail_score = 0;
            channel.reset_probe();
        }
        linfo!(
            "system",
            LogStage::Scheduling,
            LogComponent::RuntimeTracker,
            "ban_cleared",
            "渠道封禁已解除",
            channel_id = channel_id
        );
    }

    /// 临时强制渠道为最高优先级，返回到期时间；不会解除封禁
    pub fn force_channel_for(
        &self,
        channel_id: ChannelId,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let until = add_duration(now, duration);
        self.channels.entry(channel_id).or_default().forced_until = Some(until);
        until
    }

    /// 仍在强制期内时返回到期时间
    #[must_use]
    pub fn forced_until(&self, channel_id: ChannelId, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.channels
            .get(&channel_id)
            .and_then(|c| c.forced_until)
            .filter(|until| *until > now)
    }

    #[must_use]
    pub fn is_banned(&self, channel_id: ChannelId, now: DateTime<Utc>) -> bool {
        self.channels
            .get(&channel_id)
            .is_some_and(|c| c.is_banned(now))
    }

    #[must_use]
    pub fn channel_fail_score(&self, channel_id: ChannelId) -> u32 {
        self.channels.get(&channel_id).map_or(0, |c| c.fail_score)
    }

    /// 立即封禁渠道一段时间，已有更晚的封禁时保留；清除待探测状态
    pub fn ban_channel_for(
        &self,
        channel_id: ChannelId,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let until = {
            let mut channel = self.channels.entry(channel_id).or_default();
            let until = add_duration(now, duration).max(channel.banned_until.unwrap_or(now));
            channel.banned_until = Some(until);
            channel.reset_probe();
            until
        };
        lwarn!(
            "system",
            LogStage::Probe,
            LogComponent::RuntimeTracker,
            "channel_banned",
            "渠道被立即封禁",
            channel_id = channel_id,
            banned_until = %until
        );
        until
    }

    /// 渠道封禁已到期、尚未验证
    #[must_use]
    pub fn is_probe_pending(&self, channel_id: ChannelId, now: DateTime<Utc>) -> bool {
        self.channels
            .get(&channel_id)
            .is_some_and(|c| c.due_since(now).is_some())
    }

    /// 封禁到期后认领一次探测，认领在 TTL 内有效，防止重复探测
    pub fn claim_probe_due(&self, channel_id: ChannelId, now: DateTime<Utc>) -> bool {
        let Some(mut channel) = self.channels.get_mut(&channel_id) else {
            return false;
        };
        channel.expire_ban(now);
        if channel.probe_due_at.is_none() || channel.is_claimed(now) {
            return false;
        }
        channel.probe_claimed_until = Some(add_duration(now, self.config.probe_claim_ttl()));
        true
    }

    /// 放弃认领，渠道仍待探测
    pub fn release_probe_claim(&self, channel_id: ChannelId) {
        if let Some(mut channel) = self.channels.get_mut(&channel_id) {
            channel.probe_claimed_until = None;
        }
    }

    /// 清除待探测状态与认领，未到期的封禁保留
    pub fn clear_probe(&self, channel_id: ChannelId, now: DateTime<Utc>) {
        if let Some(mut channel) = self.channels.get_mut(&channel_id) {
            channel.expire_ban(now);
            channel.reset_probe();
        }
    }

    /// 按到期先后列出待探测且未被认领的渠道，`limit` 为 0 时取默认值
    #[must_use]
    pub fn list_probe_due(&self, now: DateTime<Utc>, limit: usize) -> Vec<ChannelId> {
        let limit = if limit == 0 { DEFAULT_PROBE_DUE_LIMIT } else { limit };
        let mut due: Vec<(DateTime<Utc>, ChannelId)> = self
            .channels
            .iter()
            .filter(|entry| !entry.is_claimed(now))
            .filter_map(|entry| entry.due_since(now).map(|at| (at, *entry.key())))
            .collect();
        due.sort_unstable();
        due.into_iter().take(limit).map(|(_, id)| id).collect()
    }

    /// 清扫到期封禁，并丢弃过期的会话绑定与用户亲和；返回本次转为待探测的渠道
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<ChannelId> {
        let mut expired: Vec<ChannelId> = self
            .channels
            .iter_mut()
            .filter_map(|mut entry| entry.expire_ban(now).then(|| *entry.key()))
            .collect();
        expired.sort_unstable();

        let bindings = self.bindings.len();
        self.bindings.retain(|_, binding| binding.expires_at > now);
        let affinity = self.affinity.len();
        self.affinity.retain(|_, entry| entry.expires_at > now);

        ldebug!(
            "system",
            LogStage::Probe,
            LogComponent::RuntimeTracker,
            "runtime_swept",
            "运行时状态清扫完成",
            expired_bans = expired.len(),
            bindings_pruned = bindings.saturating_sub(self.bindings.len()),
            affinity_pruned = affinity.saturating_sub(self.affinity.len())
        );
        expired
    }

    // ---- 会话绑定与用户亲和 ----

    /// 未过期的会话路由绑定
    #[must_use]
    pub fn route_binding(&self, user_id: UserId, route_key: &str, now: DateTime<Utc>) -> Option<Selection> {
        let key = (user_id, route_key.to_string());
        let binding = self.bindings.get(&key).map(|b| b.value().clone())?;
        if binding.expires_at > now {
            return Some(binding.selection);
        }
        self.bindings.remove_if(&key, |_, b| b.expires_at <= now);
        None
    }

    /// 绑定会话路由，返回到期时间
    pub fn bind_route(
        &self,
        user_id: UserId,
        route_key: &str,
        selection: &Selection,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let expires_at = add_duration(now, self.config.binding_ttl());
        self.bindings.insert(
            (user_id, route_key.to_string()),
            RouteBinding {
                selection: selection.clone(),
                expires_at,
            },
        );
        expires_at
    }

    pub fn unbind_route(&self, user_id: UserId, route_key: &str) {
        self.bindings.remove(&(user_id, route_key.to_string()));
    }

    /// 记录用户最近成功使用的渠道
    pub fn set_affinity(&self, user_id: UserId, channel_id: ChannelId, now: DateTime<Utc>) {
        self.affinity.insert(
            user_id,
            Affinity {
                channel_id,
                expires_at: add_duration(now, self.config.affinity_ttl()),
            },
        );
    }

    #[must_use]
    pub fn affinity(&self, user_id: UserId, now: DateTime<Utc>) -> Option<ChannelId> {
        self.affinity
            .get(&user_id)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.channel_id)
    }

    // ---- 目录同步 ----

    /// 丢弃目录中已不存在的渠道与凭证的状态，返回删除的 (渠道, 凭证) 条数
    pub fn retain_known(
        &self,
        channels: &HashSet<ChannelId>,
        credentials: &HashSet<CredentialKey>,
    ) -> (usize, usize) {
        let (channel_count, credential_count) = (self.channels.len(), self.credentials.len());
        self.channels.retain(|id, _| channels.contains(id));
        self.credentials.retain(|key, _| credentials.contains(key));
        self.bindings.retain(|_, b| {
            channels.contains(&b.selection.channel_id)
                && credentials.contains(&b.selection.credential_key())
        });
        self.affinity.retain(|_, entry| channels.contains(&entry.channel_id));
        (
            channel_count.saturating_sub(self.channels.len()),
            credential_count.saturating_sub(self.credentials.len()),
        )
    }

    /// 当前跟踪的 (渠道, 凭证) 条数
    #[must_use]
    pub fn tracked(&self) -> (usize, usize) {
        (self.channels.len(), self.credentials.len())
    }

    /// 设置凭证冷却，已有更晚的冷却时保留
    pub fn cool_credential(&self, key: CredentialKey, until: DateTime<Utc>) {
        self.credential(key).with_health(|health| {
            health.cooling_until = Some(health.cooling_until.map_or(until, |cur| cur.max(until)));
        });
    }

    /// 可重试失败后的冷却截止时间：429 翻倍，上游给出更晚的时间时以上游为准
    #[must_use]
    pub fn cooldown_for(
        &self,
        status: Option<u16>,
        upstream_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let mut base = self.config.credential_cooldown();
        if status == Some(429) {
            base = base.saturating_mul(2);
        }
        let local = add_duration(now, base);
        upstream_until.map_or(local, |up| up.max(local))
    }

    #[must_use]
    pub fn credential_cooling_until(
        &self,
        key: CredentialKey,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.credentials
            .get(&key)
            .and_then(|c| c.with_health(|h| h.cooling_until))
            .filter(|until| *until > now)
    }

    /// 凭证未冷却且未触及限额
    #[must_use]
    pub fn credential_available(
        &self,
        key: CredentialKey,
        limits: &CredentialLimits,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(state) = self.credentials.get(&key).map(|s| Arc::clone(s.value())) else {
            return true;
        };
        if state.with_health(|h| h.cooling_until).is_some_and(|until| until > now) {
            return false;
        }
        let under = |limit: Option<u64>, current: u64| limit.is_none_or(|max| current < max);
        under(limits.max_rpm, state.rpm.total(now))
            && under(limits.max_tpm, state.tpm.total(now))
            && under(
                limits.max_sessions.map(u64::from),
                u64::from(state.sessions.load(Ordering::Acquire)),
            )
    }

    /// 凭证当前 RPM
    #[must_use]
    pub fn credential_rpm(&self, key: CredentialKey, now: DateTime<Utc>) -> u64 {
        self.credentials.get(&key).map_or(0, |c| c.rpm.total(now))
    }

    /// 占用一个并发会话
    #[must_use]
    pub fn begin_session(&self, key: CredentialKey) -> SessionGuard {
        let state = self.credential(key);
        state.sessions.fetch_add(1, Ordering::AcqRel);
        SessionGuard { state }
    }

    #[must_use]
    pub fn channel_stats(&self, channel_id: ChannelId, now: DateTime<Utc>) -> RuntimeChannelStats {
        let (fail_score, ban_streak, banned_until, forced_until, probe_due, probe_claimed) =
            self.channels.get(&channel_id).map_or_else(
                || (0, 0, None, None, false, false),
                |c| {
                    (
                        c.fail_score,
                        c.ban_streak,
                        c.banned_until.filter(|until| *until > now),
                        c.forced_until.filter(|until| *until > now),
                        c.due_since(now).is_some(),
                        c.is_claimed(now),
                    )
                },
            );
        RuntimeChannelStats {
            channel_id,
            fail_score,
            ban_streak,
            banned_until,
            forced_until,
            probe_due,
            probe_claimed,
            pinned: false,
        }
    }

    #[must_use]
    pub fn credential_stats(&self, key: CredentialKey, now: DateTime<Utc>) -> RuntimeCredentialStats {
        let state = self.credentials.get(&key).map(|s| Arc::clone(s.value()));
        let Some(state) = state else {
            return RuntimeCredentialStats {
                key,
                rpm: 0,
                tpm: 0,
                sessions: 0,
                fail_score: 0,
                cooling_until: None,
            };
        };
        let (fail_score, cooling_until) = state.with_health(|h| (h.fail_score, h.cooling_until));
        RuntimeCredentialStats {
            key,
            rpm: state.rpm.total(now),
            tpm: state.tpm.total(now),
            sessions: state.sessions.load(Ordering::Acquire),
            fail_score,
            cooling_until: cooling_until.filter(|until| *until > now),
        }
    }

    #[must_use]
    pub fn last_success(&self) -> Option<(Selection, DateTime<Utc>)> {
        self.last_success
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;

    fn tracker() -> RuntimeStateTracker {
        RuntimeStateTracker::new(SchedulerConfig::default())
    }

    #[test]
    fn score_is_monotonic_until_success() {
        let tracker = tracker();
        let sel = fixtures::selection(1, 100);
        let now = Utc::now();

        let mut last = 0;
        for _ in 0..6 {
            let out = tracker.record_failure(&sel, FailureSeverity::Minor, now);
            assert!(out.fail_score >= last);
            last = out.fail_score;
        }
        tracker.record_success(&sel, 10, now);
        assert!(tracker.channel_fail_score(1) < last);
    }

    #[test]
    fn crossing_threshold_bans_with_growing_backoff() {
        let tracker = tracker();
        let sel = fixtures::selection(1, 100);
        let now = Utc::now();

        let first = tracker.record_failure(&sel, FailureSeverity::Major, now);
        assert!(!first.ban_triggered);

        let banned = tracker.record_failure(&sel, FailureSeverity::Major, now);
        assert!(banned.ban_triggered);
        assert_eq!(banned.ban_streak, 1);
        assert_eq!(banned.banned_until, Some(now + TimeDelta::seconds(15)));
        assert!(tracker.is_banned(1, now));

        // 封禁期间再次触发：连续封禁计数递增，封禁时间顺延
        let again = tracker.record_failure(&sel, FailureSeverity::Minor, now);
        assert!(again.ban_triggered);
        assert_eq!(again.ban_streak, 2);
        assert_eq!(again.banned_until, Some(now + TimeDelta::seconds(15 + 30)));
    }

    #[test]
    fn backoff_is_capped() {
        let tracker = tracker();
        assert_eq!(tracker.ban_backoff(0), Duration::from_secs(15));
        assert_eq!(tracker.ban_backoff(2), Duration::from_secs(60));
        assert_eq!(tracker.ban_backoff(30), Duration::from_secs(600));
    }

    #[test]
    fn ban_never_extends_past_cap_from_now() {
        let tracker = tracker();
        let sel = fixtures::selection(1, 100);
        let now = Utc::now();
        for _ in 0..30 {
            tracker.record_failure(&sel, FailureSeverity::Critical, now);
        }
        let stats = tracker.channel_stats(1, now);
        assert_eq!(stats.banned_until, Some(now + TimeDelta::seconds(600)));
        assert_eq!(stats.ban_streak, 20);
    }

    #[test]
    fn clear_ban_resets_streak_and_score() {
        let tracker = tracker();
        let sel = fixtures::selection(1, 100);
        let now = Utc::now();
        tracker.record_failure(&sel, FailureSeverity::Critical, now);
        assert!(tracker.is_banned(1, now));

        tracker.clear_ban(1);
        let stats = tracker.channel_stats(1, now);
        assert_eq!(stats.banned_until, None);
        assert_eq!(stats.ban_streak, 0);
        assert_eq!(stats.fail_score, 0);
    }

    #[test]
    fn ban_expires_into_probe_due_once_per_claim() {
        let tracker = tracker();
        let sel = fixtures::selection(1, 100);
        let now = Utc::now();
        tracker.record_failure(&sel, FailureSeverity::Critical, now);

        assert!(!tracker.claim_probe_due(1, now));
        let later = now + TimeDelta::seconds(16);
        assert!(!tracker.is_banned(1, later));
        assert!(tracker.claim_probe_due(1, later));
        assert!(!tracker.claim_probe_due(1, later + TimeDelta::seconds(5)));
        assert!(tracker.claim_probe_due(1, later + TimeDelta::seconds(31)));

        tracker.record_success(&sel, 0, later + TimeDelta::seconds(32));
        assert!(!tracker.claim_probe_due(1, later + TimeDelta::seconds(90)));
    }

    #[test]
    fn failed_claimant_releases_claim_but_channel_stays_due() {
        let tracker = tracker();
        let sel = fixtures::selection(1, 100);
        let now = Utc::now();
        tracker.record_failure(&sel, FailureSeverity::Critical, now);

        let later = now + TimeDelta::seconds(16);
        assert!(tracker.is_probe_pending(1, later));
        assert!(tracker.claim_probe_due(1, later));
        assert!(tracker.channel_stats(1, later).probe_claimed);

        // 严重失败再次封禁，待探测状态随之清除
        tracker.record_failure(&sel, FailureSeverity::Critical, later);
        assert!(tracker.is_banned(1, later));
        assert!(!tracker.is_probe_pending(1, later));

        let after = later + TimeDelta::seconds(31);
        assert!(tracker.claim_probe_due(1, after));
        tracker.release_probe_claim(1);
        assert!(tracker.is_probe_pending(1, after));
        assert!(tracker.claim_probe_due(1, after));
    }

    #[test]
    fn due_channels_are_listed_oldest_first_without_claimed_ones() {
        let tracker = tracker();
        let now = Utc::now();
        tracker.ban_channel_for(3, Duration::from_secs(10), now);
        tracker.ban_channel_for(1, Duration::from_secs(30), now);
        tracker.ban_channel_for(2, Duration::from_secs(20), now);
        tracker.ban_channel_for(4, Duration::from_secs(300), now);

        let later = now + TimeDelta::seconds(40);
        assert_eq!(tracker.list_probe_due(later, 0), vec![3, 2, 1]);
        assert_eq!(tracker.list_probe_due(later, 2), vec![3, 2]);

        assert!(tracker.claim_probe_due(3, later));
        assert_eq!(tracker.list_probe_due(later, 0), vec![2, 1]);

        tracker.clear_probe(2, later);
        assert_eq!(tracker.list_probe_due(later, 0), vec![1]);
    }

    #[test]
    fn sweep_turns_expired_bans_into_due_and_drops_stale_routes() {
        let tracker = tracker();
        let sel = fixtures::selection(1, 100);
        let now = Utc::now();
        tracker.ban_channel_for(1, Duration::from_secs(30), now);
        tracker.ban_channel_for(2, Duration::from_secs(300), now);
        tracker.bind_route(7, "session-a", &sel, now);
        tracker.set_affinity(7, 1, now);

        let later = now + TimeDelta::seconds(60);
        assert_eq!(tracker.sweep(later), vec![1]);
        assert_eq!(tracker.channel_stats(1, later).banned_until, None);
        assert!(tracker.is_probe_pending(1, later));
        assert!(tracker.is_banned(2, later));
        assert_eq!(tracker.route_binding(7, "session-a", later), Some(sel.clone()));

        let much_later = now + TimeDelta::hours(2);
        tracker.sweep(much_later);
        assert_eq!(tracker.route_binding(7, "session-a", much_later), None);
        assert_eq!(tracker.affinity(7, much_later), None);
    }

    #[test]
    fn immediate_ban_keeps_a_later_existing_ban() {
        let tracker = tracker();
        let now = Utc::now();
        let long = tracker.ban_channel_for(1, Duration::from_secs(300), now);
        assert_eq!(tracker.ban_channel_for(1, Duration::from_secs(30), now), long);
        assert!(!tracker.is_probe_pending(1, now));
    }

    #[test]
    fn route_binding_and_affinity_expire() {
        let tracker = tracker();
        let sel = fixtures::selection(2, 200);
        let now = Utc::now();

        let until = tracker.bind_route(9, "conv", &sel, now);
        assert_eq!(until, now + TimeDelta::hours(1));
        assert_eq!(tracker.route_binding(9, "conv", now), Some(sel.clone()));
        assert_eq!(tracker.route_binding(9, "other", now), None);
        assert_eq!(tracker.route_binding(9, "conv", until), None);

        tracker.set_affinity(9, 2, now);
        assert_eq!(tracker.affinity(9, now + TimeDelta::minutes(29)), Some(2));
        assert_eq!(tracker.affinity(9, now + TimeDelta::minutes(30)), None);

        tracker.bind_route(9, "conv", &sel, now);
        tracker.unbind_route(9, "conv");
        assert_eq!(tracker.route_binding(9, "conv", now), None);
    }

    #[test]
    fn retain_known_drops_removed_channels_and_credentials() {
        let tracker = tracker();
        let kept = fixtures::selection(1, 100);
        let gone = fixtures::selection(2, 200);
        let now = Utc::now();
        tracker.record_failure(&kept, FailureSeverity::Minor, now);
        tracker.record_failure(&gone, FailureSeverity::Minor, now);
        tracker.bind_route(1, "a", &gone, now);
        tracker.set_affinity(1, 2, now);
        assert_eq!(tracker.tracked(), (2, 2));

        let channels = HashSet::from([1]);
        let credentials = HashSet::from([kept.credential_key()]);
        assert_eq!(tracker.retain_known(&channels, &credentials), (1, 1));
        assert_eq!(tracker.tracked(), (1, 1));
        assert_eq!(tracker.channel_fail_score(2), 0);
        assert_eq!(tracker.channel_fail_score(1), 1);
        assert_eq!(tracker.route_binding(1, "a", now), None);
        assert_eq!(tracker.affinity(1, now), None);
    }

    #[test]
    fn force_does_not_clear_ban() {
        let tracker = tracker();
        let sel = fixtures::selection(1, 100);
        let now = Utc::now();
        tracker.record_failure(&sel, FailureSeverity::Critical, now);

        let until = tracker.force_channel_for(1, Duration::from_secs(300), now);
        assert_eq!(until, now + TimeDelta::seconds(300));
        assert_eq!(tracker.forced_until(1, now), Some(until));
        assert!(tracker.is_banned(1, now));
        assert_eq!(tracker.forced_until(1, until), None);
    }

    #[test]
    fn credential_cooling_and_limits() {
        let tracker = tracker();
        let key = fixtures::selection(1, 100).credential_key();
        let now = Utc::now();

        let until = tracker.cooldown_for(Some(429), None, now);
        assert_eq!(until, now + TimeDelta::seconds(60));
        let upstream = now + TimeDelta::seconds(600);
        assert_eq!(tracker.cooldown_for(Some(500), Some(upstream), now), upstream);

        tracker.cool_credential(key, until);
        assert!(!tracker.credential_available(key, &CredentialLimits::default(), now));
        assert!(tracker.credential_available(key, &CredentialLimits::default(), until));

        let limits = CredentialLimits {
            max_sessions: Some(1),
            ..CredentialLimits::default()
        };
        let guard = tracker.begin_session(key);
        assert!(!tracker.credential_available(key, &limits, until));
        drop(guard);
        assert!(tracker.credential_available(key, &limits, until));
    }

    #[test]
    fn success_updates_counters_and_last_success() {
        let tracker = tracker();
        let sel = fixtures::selection(2, 200);
        let now = Utc::now();
        tracker.record_success(&sel, 120, now);
        tracker.record_tokens(sel.credential_key(), 30, now);

        let stats = tracker.credential_stats(sel.credential_key(), now);
        assert_eq!(stats.rpm, 1);
        assert_eq!(stats.tpm, 150);
        assert_eq!(tracker.last_success(), Some((sel, now)));
    }
}
