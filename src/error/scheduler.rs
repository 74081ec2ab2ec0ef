use thiserror::Error;

/// 选择与调度阶段的配置类错误，不会被重试
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("渠道 {channel_id} 没有可用的凭证")]
    NoEligibleSelection { channel_id: i64 },

    #[error("找不到ID为 {channel_id} 的渠道")]
    ChannelNotFound { channel_id: i64 },

    #[error("渠道 {channel_id} 未配置端点")]
    EndpointNotFound { channel_id: i64 },

    #[error("模型绑定 {model_id} 不属于渠道 {channel_id}")]
    ModelNotFound { channel_id: i64, model_id: i64 },

    #[error("置顶环的候选渠道为空")]
    EmptyRing,

    #[error("没有满足约束的可路由渠道")]
    NoRoutableChannel,

    #[error("不支持的渠道类型: {channel_type}")]
    UnsupportedChannelType { channel_type: String },
}
