//! # 调度服务
//!
//! 持有运行时状态与置顶环，进程启动时构造一次，以 `Arc` 注入各组件。
//! 对外提供运行时查询、管理员操作与实时流量的选择规划。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::time::Duration;

use super::eligibility::list_eligible;
use super::pinning::{PinController, PinnedChannelInfo, PointerHook};
use super::runtime::{
    FailureOutcome, FailureSeverity, RuntimeChannelStats, RuntimeCredentialStats,
    RuntimeStateTracker, SessionGuard,
};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError, SchedulerResult};
use crate::logging::{LogComponent, LogStage};
use crate::store::ConfigSource;
use crate::types::{
    Channel, ChannelId, ChannelType, Credential, CredentialKey, Selection, TokenCount, UserId,
};
use crate::{ldebug, linfo};

/// 路由约束，均为可选
///
/// `user_id` 启用用户亲和；同时给出 `route_key` 时启用会话绑定。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteConstraints {
    pub channel_type: Option<ChannelType>,
    pub channel_id: Option<ChannelId>,
    pub group: Option<String>,
    pub user_id: Option<UserId>,
    pub route_key: Option<String>,
}

impl RouteConstraints {
    fn admits(&self, channel: &Channel) -> bool {
        self.channel_type.is_none_or(|t| t == channel.channel_type)
            && self.channel_id.is_none_or(|id| id == channel.id)
            && self.group.as_deref().is_none_or(|g| channel.in_group(g))
    }
}

/// 调度服务
#[derive(Debug)]
pub struct SchedulerService {
    tracker: RuntimeStateTracker,
    pins: PinController,
}

impl SchedulerService {
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            tracker: RuntimeStateTracker::new(config),
            pins: PinController::new(),
        }
    }

    /// 注册指针移动回调
    #[must_use]
    pub fn with_pointer_hook(self, hook: PointerHook) -> Self {
        self.pins.set_pointer_hook(hook);
        self
    }

    pub fn record_success(&self, selection: &Selection, tokens: TokenCount, now: DateTime<Utc>) {
        self.tracker.record_success(selection, tokens, now);
    }

    pub fn record_tokens(&self, key: CredentialKey, tokens: TokenCount, now: DateTime<Utc>) {
        self.tracker.record_tokens(key, tokens, now);
    }

    /// 记录失败；指针渠道因此被封禁时轮转指针
    pub fn record_failure(
        &self,
        selection: &Selection,
        severity: FailureSeverity,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        let outcome = self.tracker.record_failure(selection, severity, now);
        if outcome.ban_triggered && self.pins.is_pointer(selection.channel_id) {
            self.pins
                .on_channel_banned(selection.channel_id, now, &|id| self.tracker.is_banned(id, now));
        }
        outcome
    }

    /// 凭证冷却，返回截止时间
    pub fn cool_credential(
        &self,
        key: CredentialKey,
        status: Option<u16>,
        upstream_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let until = self.tracker.cooldown_for(status, upstream_until, now);
        self.tracker.cool_credential(key, until);
        until
    }

    #[must_use]
    pub fn begin_session(&self, key: CredentialKey) -> SessionGuard {
        self.tracker.begin_session(key)
    }

    pub fn claim_probe_due(&self, channel_id: ChannelId, now: DateTime<Utc>) -> bool {
        self.tracker.claim_probe_due(channel_id, now)
    }

    pub fn release_probe_claim(&self, channel_id: ChannelId) {
        self.tracker.release_probe_claim(channel_id);
    }

    pub fn clear_probe(&self, channel_id: ChannelId, now: DateTime<Utc>) {
        self.tracker.clear_probe(channel_id, now);
    }

    /// 立即封禁渠道；指针渠道因此被封禁时轮转指针
    pub fn ban_channel_for(
        &self,
        channel_id: ChannelId,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let until = self.tracker.ban_channel_for(channel_id, duration, now);
        if self.pins.is_pointer(channel_id) {
            self.pins
                .on_channel_banned(channel_id, now, &|id| self.tracker.is_banned(id, now));
        }
        until
    }

    /// 后台探测未通过：按配置时长立即封禁
    pub fn ban_after_failed_probe(&self, channel_id: ChannelId, now: DateTime<Utc>) -> DateTime<Utc> {
        self.ban_channel_for(channel_id, self.tracker.probe_failure_ban(), now)
    }

    /// 清扫到期封禁，返回待探测的渠道（按到期先后，`limit` 为 0 时取默认值）
    pub fn probe_due_channels(&self, now: DateTime<Utc>, limit: usize) -> Vec<ChannelId> {
        self.tracker.sweep(now);
        self.tracker.list_probe_due(now, limit)
    }

    /// 成功分发后记录会话绑定与用户亲和
    pub fn bind_route(&self, constraints: &RouteConstraints, selection: &Selection, now: DateTime<Utc>) {
        let Some(user_id) = constraints.user_id else {
            return;
        };
        if let Some(route_key) = constraints.route_key.as_deref() {
            self.tracker.bind_route(user_id, route_key, selection, now);
        }
        self.tracker.set_affinity(user_id, selection.channel_id, now);
    }

    #[must_use]
    pub fn route_binding(&self, user_id: UserId, route_key: &str, now: DateTime<Utc>) -> Option<Selection> {
        self.tracker.route_binding(user_id, route_key, now)
    }

    /// 当前跟踪的 (渠道, 凭证) 条数
    #[must_use]
    pub fn tracked(&self) -> (usize, usize) {
        self.tracker.tracked()
    }

    #[must_use]
    pub fn is_banned(&self, channel_id: ChannelId, now: DateTime<Utc>) -> bool {
        self.tracker.is_banned(channel_id, now)
    }

    // ---- 运行时查询 ----

    #[must_use]
    pub fn runtime_channel_stats(&self, channel_id: ChannelId, now: DateTime<Utc>) -> RuntimeChannelStats {
        let mut stats = self.tracker.channel_stats(channel_id, now);
        stats.pinned = self.pins.is_pointer(channel_id);
        stats
    }

    #[must_use]
    pub fn runtime_credential_stats(
        &self,
        key: CredentialKey,
        now: DateTime<Utc>,
    ) -> RuntimeCredentialStats {
        self.tracker.credential_stats(key, now)
    }

    /// 当前置顶渠道，读取时修正失效或被封禁的指针
    pub fn pinned_channel(&self, now: DateTime<Utc>) -> Option<ChannelId> {
        self.pins
            .pinned_channel(now, &|id| self.tracker.is_banned(id, now))
    }

    #[must_use]
    pub fn pinned_channel_info(&self) -> Option<PinnedChannelInfo> {
        self.pins.info()
    }

    #[must_use]
    pub fn last_success(&self) -> Option<(Selection, DateTime<Utc>)> {
        self.tracker.last_success()
    }

    // ---- 管理员操作 ----

    pub fn pin_channel(&self, channel_id: ChannelId, now: DateTime<Utc>) -> bool {
        self.pins.pin_channel(channel_id, now)
    }

    pub fn clear_channel_ban(&self, channel_id: ChannelId) {
        self.tracker.clear_ban(channel_id);
    }

    pub fn force_channel_for(
        &self,
        channel_id: ChannelId,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let until = self.tracker.force_channel_for(channel_id, duration, now);
        linfo!(
            "system",
            LogStage::Scheduling,
            LogComponent::Scheduler,
            "channel_forced",
            "渠道临时强制为最高优先级",
            channel_id = channel_id,
            forced_until = %until
        );
        until
    }

    pub fn refresh_pinned_ring(
        &self,
        candidates: &[Channel],
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<ChannelId>> {
        self.pins.refresh_ring(candidates, now)
    }

    /// 与配置源同步：丢弃已删除渠道与凭证的运行时状态并重建置顶环
    ///
    /// 环无法建立（没有启用的渠道）时只记录日志。
    pub async fn sync_catalog(&self, source: &dyn ConfigSource, now: DateTime<Utc>) -> Result<Vec<Channel>> {
        let channels = source.list_channels().await?;
        self.prune_runtime(source, &channels).await?;
        if let Err(err) = self.pins.refresh_ring(&channels, now) {
            ldebug!(
                "system",
                LogStage::Pinning,
                LogComponent::Scheduler,
                "ring_not_built",
                "置顶环未能建立",
                error = %err
            );
        }
        Ok(channels)
    }

    async fn prune_runtime(&self, source: &dyn ConfigSource, channels: &[Channel]) -> Result<()> {
        let mut credentials = HashSet::new();
        for channel in channels {
            if let Some(endpoint) = source.get_endpoint_by_channel(channel.id).await? {
                let listed = source.list_credentials_by_endpoint(endpoint.id).await?;
                credentials.extend(listed.iter().map(Credential::key));
            }
        }
        let ids: HashSet<ChannelId> = channels.iter().map(|c| c.id).collect();
        let (channels_pruned, credentials_pruned) = self.tracker.retain_known(&ids, &credentials);
        if channels_pruned + credentials_pruned > 0 {
            linfo!(
                "system",
                LogStage::Configuration,
                LogComponent::Scheduler,
                "runtime_pruned",
                "已丢弃不在目录中的运行时状态",
                channels = channels_pruned,
                credentials = credentials_pruned
            );
        }
        Ok(())
    }

    /// 管理员置顶：同步目录、重建环、置顶并解除封禁
    pub async fn admin_pin(
        &self,
        source: &dyn ConfigSource,
        channel_id: ChannelId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let channels = source.list_channels().await?;
        if !channels.iter().any(|c| c.id == channel_id) {
            return Err(SchedulerError::ChannelNotFound { channel_id }.into());
        }
        self.prune_runtime(source, &channels).await?;
        self.pins.refresh_ring(&channels, now)?;
        let pinned = self.pins.pin_channel(channel_id, now);
        if pinned {
            self.tracker.clear_ban(channel_id);
        }
        Ok(pinned)
    }

    // ---- 选择规划 ----

    /// 渠道排序：强制（到期晚者优先）、待探测、指针、推广、优先级、失败分、ID
    ///
    /// 被封禁的渠道除非处于强制期，否则不参与。
    #[must_use]
    pub fn order_channels(&self, channels: Vec<Channel>, now: DateTime<Utc>) -> Vec<Channel> {
        self.order_channels_for(channels, None, now)
    }

    /// 同 [`Self::order_channels`]，亲和渠道排在推广之后、优先级之前
    #[must_use]
    pub fn order_channels_for(
        &self,
        channels: Vec<Channel>,
        affinity: Option<ChannelId>,
        now: DateTime<Utc>,
    ) -> Vec<Channel> {
        let pointer = self.pinned_channel(now);
        let mut ordered: Vec<(Option<DateTime<Utc>>, Channel)> = channels
            .into_iter()
            .map(|c| (self.tracker.forced_until(c.id, now), c))
            .filter(|(forced, c)| forced.is_some() || !self.tracker.is_banned(c.id, now))
            .collect();

        ordered.sort_by_cached_key(|(forced, c)| {
            (
                forced.is_none(),
                Reverse(*forced),
                !self.tracker.is_probe_pending(c.id, now),
                pointer != Some(c.id),
                !c.promotion,
                affinity != Some(c.id),
                c.priority,
                self.tracker.channel_fail_score(c.id),
                c.id,
            )
        });
        ordered.into_iter().map(|(_, c)| c).collect()
    }

    /// 为实时流量规划有序的选择列表
    ///
    /// 过滤冷却中与触及限额的凭证；OAuth 凭证按最久未用优先，其余按当前 RPM。
    /// 待探测的渠道只有认领成功的请求会尝试，没有可用选择时立即放弃认领。
    /// 仍然可用的会话绑定排在最前。
    pub async fn plan(
        &self,
        source: &dyn ConfigSource,
        constraints: &RouteConstraints,
        now: DateTime<Utc>,
    ) -> Result<Vec<Selection>> {
        let channels = source.list_channels().await?;
        if !self.pins.is_built() {
            if let Err(err) = self.pins.refresh_ring(&channels, now) {
                ldebug!(
                    "system",
                    LogStage::Pinning,
                    LogComponent::Scheduler,
                    "ring_not_built",
                    "置顶环未能建立",
                    error = %err
                );
            }
        }

        let mut claimed = HashSet::new();
        let bound = self.bound_selection(source, constraints, now, &mut claimed).await?;
        let affinity = constraints
            .user_id
            .and_then(|user_id| self.tracker.affinity(user_id, now))
            .filter(|id| self.tracker.channel_fail_score(*id) == 0);

        let candidates = channels
            .into_iter()
            .filter(|c| c.is_enabled() && constraints.admits(c))
            .collect();

        let mut plan: Vec<Selection> = bound.iter().cloned().collect();
        for channel in self.order_channels_for(candidates, affinity, now) {
            let claimant = self.tracker.is_probe_pending(channel.id, now);
            if claimant && !claimed.contains(&channel.id) {
                if !self.tracker.claim_probe_due(channel.id, now) {
                    ldebug!(
                        "system",
                        LogStage::Eligibility,
                        LogComponent::Scheduler,
                        "probe_due_skipped",
                        "渠道待探测且已被认领，跳过",
                        channel_id = channel.id
                    );
                    continue;
                }
                claimed.insert(channel.id);
            }

            let eligible = self.available_selections(source, &channel, now).await?;
            if eligible.is_empty() && claimant {
                self.tracker.release_probe_claim(channel.id);
                claimed.remove(&channel.id);
            }
            plan.extend(eligible.into_iter().filter(|s| bound.as_ref() != Some(s)));
        }

        if plan.is_empty() {
            return Err(SchedulerError::NoRoutableChannel.into());
        }
        Ok(plan)
    }

    /// 渠道当前可用的选择，已排序
    async fn available_selections(
        &self,
        source: &dyn ConfigSource,
        channel: &Channel,
        now: DateTime<Utc>,
    ) -> Result<Vec<Selection>> {
        let endpoint = source.get_endpoint_by_channel(channel.id).await?;
        let credentials = match &endpoint {
            Some(ep) => source.list_credentials_by_endpoint(ep.id).await?,
            None => Vec::new(),
        };

        let mut eligible = match list_eligible(channel, endpoint.as_ref(), &credentials, now) {
            Ok(pairs) => pairs,
            Err(err) => {
                ldebug!(
                    "system",
                    LogStage::Eligibility,
                    LogComponent::Scheduler,
                    "channel_skipped",
                    "渠道没有可用选择，跳过",
                    channel_id = channel.id,
                    error = %err
                );
                return Ok(Vec::new());
            }
        };
        eligible.retain(|(_, cred)| self.tracker.credential_available(cred.key(), &cred.limits, now));

        if channel.channel_type == ChannelType::CodexOauth {
            eligible.sort_by_cached_key(|(_, cred)| {
                (
                    cred.last_used_at,
                    self.tracker.credential_rpm(cred.key(), now),
                    Reverse(cred.id),
                )
            });
        } else {
            eligible.sort_by_cached_key(|(_, cred)| {
                (self.tracker.credential_rpm(cred.key(), now), cred.id)
            });
        }
        Ok(eligible.into_iter().map(|(selection, _)| selection).collect())
    }

    /// 仍然可用的会话绑定；失效的绑定被清除
    ///
    /// 绑定的渠道须满足约束、未封禁且失败分为 0，凭证须仍可用；
    /// 渠道待探测时须认领成功。
    async fn bound_selection(
        &self,
        source: &dyn ConfigSource,
        constraints: &RouteConstraints,
        now: DateTime<Utc>,
        claimed: &mut HashSet<ChannelId>,
    ) -> Result<Option<Selection>> {
        let (Some(user_id), Some(route_key)) = (constraints.user_id, constraints.route_key.as_deref())
        else {
            return Ok(None);
        };
        let Some(selection) = self.tracker.route_binding(user_id, route_key, now) else {
            return Ok(None);
        };

        let channel = source
            .get_channel(selection.channel_id)
            .await?
            .filter(|c| c.is_enabled() && constraints.admits(c))
            .filter(|c| !self.tracker.is_banned(c.id, now) && self.tracker.channel_fail_score(c.id) == 0);
        let mut usable = match &channel {
            Some(channel) => self
                .available_selections(source, channel, now)
                .await?
                .contains(&selection),
            None => false,
        };
        if usable && self.tracker.is_probe_pending(selection.channel_id, now) {
            usable = self.tracker.claim_probe_due(selection.channel_id, now);
            if usable {
                claimed.insert(selection.channel_id);
            }
        }

        if usable {
            return Ok(Some(selection));
        }
        self.tracker.unbind_route(user_id, route_key);
        ldebug!(
            "system",
            LogStage::Eligibility,
            LogComponent::Scheduler,
            "binding_dropped",
            "会话绑定已失效",
            user_id = user_id,
            selection = %selection
        );
        Ok(None)
    }
}
