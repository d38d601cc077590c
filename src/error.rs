use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream error: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("api key validation failed: {0}")]
    ApiKey(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
