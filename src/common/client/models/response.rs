use reqwest::header::HeaderMap;
use reqwest::{StatusCode, Url};

/// 完整读取后的响应信息，供需要状态码、跳转地址或 Cookie 的调用方使用
#[derive(Debug, Clone)]
pub struct ResponseDetails {
    pub status: StatusCode,
    pub url: Url,
    pub redirect_location: Option<String>,
    pub cookies: Vec<String>,
    pub headers: HeaderMap,
    pub body: String,
}

impl ResponseDetails {
    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection()
    }
}
