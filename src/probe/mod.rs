//! # 健康探测
//!
//! 对渠道发起流式探测，采样首段输出并汇总为渠道健康状态。

pub mod runner;
pub mod sampler;
pub mod summary;

pub use runner::{ChannelProber, ProbeTarget};
pub use sampler::{SamplerLimits, StreamSample, sample_stream};
pub use summary::{aggregate, fail_message, ok_message};
