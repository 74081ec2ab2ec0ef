//! # 日志配置模块
//!
//! 基于 `tracing` 的结构化日志：统一的阶段/组件标签与带请求 ID 的日志宏

use std::env;
use std::fmt;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 日志阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStage {
    /// 进程启动
    Startup,
    /// 配置加载与校验
    Configuration,
    /// 调度排序
    Scheduling,
    /// 可用凭证解析
    Eligibility,
    /// 故障转移
    Failover,
    /// 健康探测
    Probe,
    /// 置顶指针
    Pinning,
    /// 上游请求
    Upstream,
    /// 进程关闭
    Shutdown,
}

impl LogStage {
    /// 稳定的字符串名称
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Configuration => "configuration",
            Self::Scheduling => "scheduling",
            Self::Eligibility => "eligibility",
            Self::Failover => "failover",
            Self::Probe => "probe",
            Self::Pinning => "pinning",
            Self::Upstream => "upstream",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for LogStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 日志组件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogComponent {
    /// 主程序
    Main,
    /// 配置
    Config,
    /// 调度服务
    Scheduler,
    /// 运行时状态
    RuntimeTracker,
    /// 置顶控制器
    PinController,
    /// 故障转移执行器
    Failover,
    /// 实时流量分发
    Dispatcher,
    /// 渠道探测
    Prober,
    /// 流式采样
    Sampler,
    /// 上游传输
    Transport,
    /// 配置源
    Store,
}

impl LogComponent {
    /// 稳定的字符串名称
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Config => "config",
            Self::Scheduler => "scheduler",
            Self::RuntimeTracker => "runtime_tracker",
            Self::PinController => "pin_controller",
            Self::Failover => "failover",
            Self::Dispatcher => "dispatcher",
            Self::Prober => "prober",
            Self::Sampler => "sampler",
            Self::Transport => "transport",
            Self::Store => "store",
        }
    }
}

impl fmt::Display for LogComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 生成 `linfo!` 一类宏的内部实现
#[doc(hidden)]
#[macro_export]
macro_rules! __structured_log {
    ($level:ident, $request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr) => {
        ::tracing::$level!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation,
            "{}",
            $message
        )
    };
    ($level:ident, $request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr, $($fields:tt)+) => {
        ::tracing::$level!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation,
            $($fields)+,
            "{}",
            $message
        )
    };
}

/// 结构化 INFO 日志
#[macro_export]
macro_rules! linfo {
    ($($args:tt)+) => {
        $crate::__structured_log!(info, $($args)+)
    };
}

/// 结构化 DEBUG 日志
#[macro_export]
macro_rules! ldebug {
    ($($args:tt)+) => {
        $crate::__structured_log!(debug, $($args)+)
    };
}

/// 结构化 WARN 日志
#[macro_export]
macro_rules! lwarn {
    ($($args:tt)+) => {
        $crate::__structured_log!(warn, $($args)+)
    };
}

/// 结构化 ERROR 日志
#[macro_export]
macro_rules! lerror {
    ($($args:tt)+) => {
        $crate::__structured_log!(error, $($args)+)
    };
}

/// 初始化日志系统
///
/// `RUST_LOG` 优先；否则使用配置中的级别，并打开本 crate 的 debug 日志。
pub fn init_logging(log_level: Option<&str>, json: bool) {
    let level = log_level.unwrap_or("info");
    let default_filter = format!("{level},upstream_scheduler=debug,hyper=warn,reqwest=warn");
    let log_filter = env::var("RUST_LOG").unwrap_or(default_filter);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(
                tracing_fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .compact(),
            )
            .try_init()
    };

    // 测试中可能被重复初始化
    if result.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
