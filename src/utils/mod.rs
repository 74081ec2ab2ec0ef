//! # 通用工具

pub mod sse;
pub mod text;
