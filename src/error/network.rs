use thiserror::Error;

/// 上游传输错误
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("上游请求失败: {0}")]
    Request(#[from] reqwest::Error),

    #[error("无效的上游地址 {base_url}: {reason}")]
    InvalidBaseUrl { base_url: String, reason: String },

    #[error("找不到凭证 {credential}")]
    CredentialNotFound { credential: String },

    #[error("读取上游响应失败: {0}")]
    Body(String),

    #[error("读取配置源失败: {0}")]
    Store(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Body(err.to_string())
    }
}
