//! # 领域类型
//!
//! 渠道、端点、凭证、模型绑定与一次性的调度选择

pub mod domain;
pub use domain::*;
