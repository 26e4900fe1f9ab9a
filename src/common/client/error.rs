use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("网络请求失败: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("无效的请求头: {0}")]
    InvalidHeader(String),

    #[error("HTTP 请求失败，状态码: {status}，URL: {url}")]
    HttpStatus {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("响应解码失败: {0}")]
    Decode(#[from] std::io::Error),

    #[error("请求体不支持重复发送")]
    RequestNotCloneable,
}

impl From<url::ParseError> for ApiError {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidUrl(e.to_string())
    }
}
