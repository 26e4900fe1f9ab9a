use reqwest::header::HeaderMap;
use reqwest::{Method, Request, Response, Url};

/// 已构造但尚未读取的请求
///
/// POST 请求在 `send_post` / `send_post_xhr` 之后会持有已收到响应头的响应，
/// 随后由 `drain_to_string` / `drain_to_response` 读取响应体。
#[derive(Debug)]
pub struct WebRequest {
    pub(crate) inner: Request,
    pub(crate) follow_redirects: bool,
    pub(crate) pending: Option<Response>,
}

impl WebRequest {
    pub(crate) fn new(inner: Request, follow_redirects: bool) -> Self {
        Self {
            inner,
            follow_redirects,
            pending: None,
        }
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn url(&self) -> &Url {
        self.inner.url()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn follow_redirects(&self) -> bool {
        self.follow_redirects
    }

    /// 已写入的请求体（仅内存中的请求体）
    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.inner.body().and_then(|body| body.as_bytes())
    }

    /// 是否已经发送并收到响应头
    pub fn is_sent(&self) -> bool {
        self.pending.is_some()
    }
}
