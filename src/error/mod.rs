//! # 错误处理
//!
//! 各层使用各自的领域错误（调度、传输、探测、配置），
//! 在对外边界统一转换为 [`ProxyError`]。

pub mod config;
pub mod network;
pub mod prelude;
pub mod probe;
pub mod scheduler;
pub mod types;

pub use config::ConfigError;
pub use network::TransportError;
pub use probe::ProbeError;
pub use scheduler::SchedulerError;
pub use types::ProxyError;

/// crate 级结果类型
pub type Result<T> = std::result::Result<T, ProxyError>;

/// 选择与调度层的结果类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// 上游传输层的结果类型
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// 为错误附加一段说明，转换为 [`ProxyError::Context`]
pub trait Context<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: std::fmt::Display;

    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: std::fmt::Display;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    E: Into<ProxyError>,
{
    fn context<C>(self, context: C) -> Result<T>
    where
        C: std::fmt::Display,
    {
        self.with_context(|| context)
    }

    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: std::fmt::Display,
    {
        self.map_err(|error| ProxyError::Context {
            context: context().to_string(),
            source: Box::new(error.into()),
        })
    }
}

#[cfg(test)]
mod tests;
