//! # Upstream Scheduler Library
//!
//! LLM 网关的上游调度核心：渠道与凭证选择、故障转移、置顶环与流式健康探测。

pub mod config;
pub mod error;
pub mod logging;
pub mod probe;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod types;
pub mod utils;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{ProbeError, ProxyError, Result, SchedulerError};
pub use probe::ChannelProber;
pub use scheduler::{Dispatcher, RouteConstraints, SchedulerService};
pub use store::{ConfigSource, InMemoryConfigSource};
pub use transport::{HttpTransport, UpstreamTransport};
