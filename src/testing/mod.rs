//! # 测试支持
//!
//! 目录 fixtures、脚本化的上游传输与测试辅助函数。
//! 单元测试直接使用；下游 crate 通过 `testing` feature 引入。

pub mod fixtures;
pub mod helpers;
pub mod mocks;

pub use fixtures::{CatalogBuilder, channel, selection, two_channel_catalog};
pub use helpers::{init_test_logging, mount_sse, sse_body, write_config};
pub use mocks::{Scripted, ScriptedTransport};
