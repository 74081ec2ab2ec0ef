//! 常用错误类型与 `Context` 的集中导入

pub use super::{
    ConfigError, Context, ProbeError, ProxyError, Result, SchedulerError, SchedulerResult,
    TransportError, TransportResult,
};
