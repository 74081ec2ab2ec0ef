use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration parse failed: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration load failed: {0}")]
    Load(String),

    #[error("Invalid configuration field {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    /// 创建字段校验错误
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
