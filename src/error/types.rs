//! # 错误类型定义

use thiserror::Error;

use super::{ConfigError, ProbeError, SchedulerError, TransportError};

/// 应用主要错误类型
#[derive(Debug, Error)]
pub enum ProxyError {
    /// 配置相关错误
    #[error("配置错误: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 上游传输失败
    #[error("网络错误: {0}")]
    Transport(#[source] TransportError),

    /// 系统内部错误
    #[error("内部错误: {message}")]
    Internal { message: String },

    /// IO相关错误
    #[error("IO错误: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// 序列化/反序列化错误
    #[error("序列化错误: {message}")]
    Serialization {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    /// 上游渠道、端点或模型未找到
    #[error("上游服务器未找到: {message}")]
    UpstreamNotFound {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 上游没有可用的选择
    #[error("上游服务器不可用: {message}")]
    UpstreamNotAvailable {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 上游返回错误状态
    #[error("网关错误: {message}")]
    BadGateway { message: String, status: Option<u16> },

    /// 截止时间耗尽，与上游失败区分
    #[error("等待超时: {message}")]
    DeadlineExceeded { message: String, attempts: usize },

    /// 渠道探测判定不健康
    #[error("健康检查错误: {0}")]
    HealthCheck(#[source] ProbeError),

    /// 附加上下文的错误
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ProxyError>,
    },
}

impl ProxyError {
    /// 创建配置错误
    pub fn config<T: Into<String>>(message: T) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的配置错误
    pub fn config_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建内部错误
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal { message: message.into() }
    }

    /// 创建上游未找到错误
    pub fn upstream_not_found<T: Into<String>>(message: T) -> Self {
        Self::UpstreamNotFound {
            message: message.into(),
            source: None,
        }
    }

    /// 创建上游不可用错误
    pub fn upstream_not_available<T: Into<String>>(message: T) -> Self {
        Self::UpstreamNotAvailable {
            message: message.into(),
            source: None,
        }
    }

    /// 创建网关错误
    pub fn bad_gateway<T: Into<String>>(message: T, status: Option<u16>) -> Self {
        Self::BadGateway {
            message: message.into(),
            status,
        }
    }

    /// 创建截止时间耗尽错误
    pub fn deadline_exceeded<T: Into<String>>(message: T, attempts: usize) -> Self {
        Self::DeadlineExceeded {
            message: message.into(),
            attempts,
        }
    }

    /// 是否为截止时间耗尽
    #[must_use]
    pub fn is_deadline_exceeded(&self) -> bool {
        match self {
            Self::DeadlineExceeded { .. } => true,
            Self::Context { source, .. } => source.is_deadline_exceeded(),
            _ => false,
        }
    }
}

// 自动转换常见错误类型
impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: "文件操作失败".to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        Self::config_with_source("TOML解析失败", err)
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: "JSON处理失败".to_string(),
            source: err.into(),
        }
    }
}

impl From<ConfigError> for ProxyError {
    fn from(err: ConfigError) -> Self {
        Self::config_with_source(err.to_string(), err)
    }
}

impl From<SchedulerError> for ProxyError {
    fn from(err: SchedulerError) -> Self {
        let message = err.to_string();
        match err {
            SchedulerError::ChannelNotFound { .. }
            | SchedulerError::EndpointNotFound { .. }
            | SchedulerError::ModelNotFound { .. } => {
                Self::UpstreamNotFound {
                    message,
                    source: Some(err.into()),
                }
            }
            SchedulerError::NoEligibleSelection { .. } | SchedulerError::NoRoutableChannel => {
                Self::UpstreamNotAvailable {
                    message,
                    source: Some(err.into()),
                }
            }
            SchedulerError::EmptyRing | SchedulerError::UnsupportedChannelType { .. } => {
                Self::config_with_source(message, err)
            }
        }
    }
}

impl From<TransportError> for ProxyError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidBaseUrl { .. } | TransportError::CredentialNotFound { .. } => {
                Self::config_with_source(err.to_string(), err)
            }
            TransportError::Request(_) | TransportError::Body(_) => Self::Transport(err),
            TransportError::Store(_) => Self::internal(err.to_string()),
        }
    }
}

impl From<ProbeError> for ProxyError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::Scheduler(inner) => inner.into(),
            ProbeError::Store(inner) => *inner,
            ProbeError::Failed { .. } => Self::HealthCheck(err),
        }
    }
}
