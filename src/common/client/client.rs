use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use chardetng::EncodingDetector;
use encoding_rs::Encoding;
use flate2::read::{GzDecoder, ZlibDecoder};
use reqwest::{
    Client, ClientBuilder, Method, Request, Response, redirect,
    header::{
        ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap,
        HeaderName, HeaderValue, LOCATION, REFERER, SET_COOKIE, USER_AGENT,
    },
};
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};
use url::Url;

use super::error::ApiError;
use super::models::request::WebRequest;
use super::models::response::ResponseDetails;
use crate::common::models::RequestSettings;

use tracing::{debug, warn};

const MAX_REDIRECTS: usize = 10;
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=UTF-8";
const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";
const XHR_ACCEPT: &str = "application/json, text/javascript, */*; q=0.01";

fn x_requested_with() -> HeaderName {
    HeaderName::from_static("x-requested-with")
}

// 统一构造和执行对外请求，所有请求共享同一个 Cookie 存储
#[derive(Debug, Clone)]
pub struct WebRequestFactory {
    follow: Client,
    no_redirect: Client,
    pub cookie_store: Arc<CookieStoreMutex>,
}

impl WebRequestFactory {
    pub fn new(settings: &RequestSettings) -> Result<Self, ApiError> {
        let headers = Self::get_default_headers(settings)?;
        let cookie_store = Arc::new(CookieStoreMutex::new(CookieStore::default()));

        let builder = || {
            ClientBuilder::new()
                .timeout(Duration::from_secs(settings.timeout_secs))
                .cookie_provider(Arc::clone(&cookie_store))
                .default_headers(headers.clone())
        };

        let follow = builder()
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        let no_redirect = builder().redirect(redirect::Policy::none()).build()?;

        Ok(Self {
            follow,
            no_redirect,
            cookie_store,
        })
    }

    pub fn get_default_headers(settings: &RequestSettings) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&settings.accept_language)
                .map_err(|e| ApiError::InvalidHeader(format!("Accept-Language: {}", e)))?,
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&settings.user_agent)
                .map_err(|e| ApiError::InvalidHeader(format!("User-Agent: {}", e)))?,
        );

        Ok(headers)
    }

    // ---------------------------------------------------------------------------------------
    // 构造请求

    pub fn build_get(
        &self,
        url: &str,
        referer: Option<&str>,
        headers: Option<&HashMap<String, String>>,
        allow_redirects: bool,
    ) -> Result<WebRequest, ApiError> {
        Self::build_request(Method::GET, url, referer, headers, allow_redirects, &[])
    }

    pub fn build_get_xhr(
        &self,
        url: &str,
        referer: Option<&str>,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<WebRequest, ApiError> {
        Self::build_request(
            Method::GET,
            url,
            referer,
            headers,
            true,
            &[(x_requested_with(), "XMLHttpRequest"), (ACCEPT, XHR_ACCEPT)],
        )
    }

    pub fn build_post(
        &self,
        url: &str,
        referer: Option<&str>,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<WebRequest, ApiError> {
        Self::build_request(
            Method::POST,
            url,
            referer,
            headers,
            true,
            &[(CONTENT_TYPE, FORM_CONTENT_TYPE)],
        )
    }

    pub fn build_post_xhr(
        &self,
        url: &str,
        referer: Option<&str>,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<WebRequest, ApiError> {
        Self::build_request(
            Method::POST,
            url,
            referer,
            headers,
            true,
            &[
                (x_requested_with(), "XMLHttpRequest"),
                (ACCEPT, XHR_ACCEPT),
                (CONTENT_TYPE, JSON_CONTENT_TYPE),
            ],
        )
    }

    // 调用方传入的请求头覆盖工厂预设的请求头
    fn build_request(
        method: Method,
        url: &str,
        referer: Option<&str>,
        headers: Option<&HashMap<String, String>>,
        follow_redirects: bool,
        preset: &[(HeaderName, &'static str)],
    ) -> Result<WebRequest, ApiError> {
        let url = Url::parse(url)?;
        let mut request = Request::new(method, url);
        let request_headers = request.headers_mut();

        for (name, value) in preset {
            request_headers.insert(name.clone(), HeaderValue::from_static(value));
        }

        if let Some(referer) = referer.filter(|r| !r.is_empty()) {
            let value = HeaderValue::from_str(referer)
                .map_err(|e| ApiError::InvalidHeader(format!("Referer: {}", e)))?;
            request_headers.insert(REFERER, value);
        }

        if let Some(headers) = headers {
            for (name, value) in headers {
                let header_name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| ApiError::InvalidHeader(format!("{}: {}", name, e)))?;
                let header_value = HeaderValue::from_str(value)
                    .map_err(|e| ApiError::InvalidHeader(format!("{}: {}", name, e)))?;
                request_headers.insert(header_name, header_value);
            }
        }

        Ok(WebRequest::new(request, follow_redirects))
    }

    // ---------------------------------------------------------------------------------------
    // 发送请求体

    /// 以表单编码发送参数，返回时响应头已经收到
    pub async fn send_post<I, K, V>(
        &self,
        request: &mut WebRequest,
        parameters: I,
    ) -> Result<(), ApiError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let body = Self::url_encode(parameters);
        self.send_body(request, body).await
    }

    /// 原样发送已经序列化好的请求体（一般是 JSON）
    pub async fn send_post_xhr(
        &self,
        request: &mut WebRequest,
        request_body: &str,
    ) -> Result<(), ApiError> {
        self.send_body(request, request_body.to_string()).await
    }

    async fn send_body(&self, request: &mut WebRequest, body: String) -> Result<(), ApiError> {
        *request.inner.body_mut() = Some(body.into());
        let outgoing = request
            .inner
            .try_clone()
            .ok_or(ApiError::RequestNotCloneable)?;

        let response = self
            .client_for(request.follow_redirects)
            .execute(outgoing)
            .await?;
        debug!("POST {} -> {}", request.url(), response.status());

        request.pending = Some(response);
        Ok(())
    }

    // ---------------------------------------------------------------------------------------
    // 读取响应

    /// 探测远端地址是否可用，不向调用方抛出网络错误
    pub async fn check_reachable(&self, url: &str) -> bool {
        let request = match Self::build_request(Method::HEAD, url, None, None, true, &[]) {
            Ok(request) => request,
            Err(e) => {
                debug!("探测地址无效: {}, 错误: {}", url, e);
                return false;
            }
        };

        match self.execute(request).await {
            Ok(response) => {
                debug!("探测 {} -> {}", url, response.status());
                response.status().is_success()
            }
            Err(e) => {
                debug!("探测 {} 失败: {}", url, e);
                false
            }
        }
    }

    /// 执行请求并读取完整响应体，非成功状态码视为错误
    pub async fn drain_to_string(&self, request: WebRequest) -> Result<String, ApiError> {
        let response = self.execute(request).await?;
        Self::check_response_status(&response)?;

        let content_encoding = Self::content_encoding(response.headers());
        let charset = Self::declared_charset(response.headers());
        let raw_body = response.bytes().await?;
        Self::decode_body(&raw_body, content_encoding.as_deref(), charset.as_deref())
    }

    /// 执行请求并返回状态码、响应头、跳转地址、Cookie 和响应体，任何状态码都会返回
    pub async fn drain_to_response(&self, request: WebRequest) -> Result<ResponseDetails, ApiError> {
        let response = self.execute(request).await?;

        let status = response.status();
        let url = response.url().clone();
        let headers = response.headers().clone();
        let redirect_location = headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let cookies = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();

        let content_encoding = Self::content_encoding(&headers);
        let charset = Self::declared_charset(&headers);
        let raw_body = response.bytes().await?;
        let body = Self::decode_body(&raw_body, content_encoding.as_deref(), charset.as_deref())?;

        Ok(ResponseDetails {
            status,
            url,
            redirect_location,
            cookies,
            headers,
            body,
        })
    }

    /// 根据 Content-Encoding 包装原始字节流，调用方读到的是解压后的内容
    pub fn stream_for_request<'a, R>(raw: R, content_encoding: Option<&str>) -> Box<dyn Read + Send + 'a>
    where
        R: Read + Send + 'a,
    {
        let encoding = content_encoding.map(|e| e.trim().to_ascii_lowercase());
        match encoding.as_deref() {
            Some("gzip") | Some("x-gzip") => Box::new(GzDecoder::new(raw)),
            Some("deflate") => Box::new(ZlibDecoder::new(raw)),
            None | Some("") | Some("identity") => Box::new(raw),
            Some(other) => {
                warn!("未知的内容编码: {}", other);
                Box::new(raw)
            }
        }
    }

    /// 表单编码，保持调用方给出的参数顺序
    pub fn url_encode<I, K, V>(parameters: I) -> String
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in parameters {
            serializer.append_pair(key.as_ref(), value.as_ref());
        }
        serializer.finish()
    }

    /// 当前会话中的 Cookie，格式为 name=value
    pub fn cookies(&self) -> Vec<String> {
        let store = match self.cookie_store.lock() {
            Ok(store) => store,
            Err(poisoned) => poisoned.into_inner(),
        };

        store
            .iter_any()
            .map(|c| format!("{}={}", c.name(), c.value()))
            .collect()
    }

    // ---------------------------------------------------------------------------------------

    fn client_for(&self, follow_redirects: bool) -> &Client {
        if follow_redirects {
            &self.follow
        } else {
            &self.no_redirect
        }
    }

    async fn execute(&self, request: WebRequest) -> Result<Response, ApiError> {
        if let Some(response) = request.pending {
            return Ok(response);
        }

        debug!("发送请求: {} {}", request.inner.method(), request.inner.url());
        let response = self
            .client_for(request.follow_redirects)
            .execute(request.inner)
            .await?;
        Ok(response)
    }

    fn content_encoding(headers: &HeaderMap) -> Option<String> {
        headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    // Content-Type 中声明的 charset，例如 text/html; charset=GBK
    fn declared_charset(headers: &HeaderMap) -> Option<String> {
        let content_type = headers.get(CONTENT_TYPE)?.to_str().ok()?;
        content_type
            .split(';')
            .skip(1)
            .filter_map(|param| param.split_once('='))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("charset"))
            .map(|(_, value)| value.trim().trim_matches('"').to_string())
            .filter(|value| !value.is_empty())
    }

    fn decode_body(
        raw: &[u8],
        content_encoding: Option<&str>,
        charset: Option<&str>,
    ) -> Result<String, ApiError> {
        let mut decompressed = Vec::new();
        Self::stream_for_request(raw, content_encoding).read_to_end(&mut decompressed)?;

        // 服务器声明的编码优先
        let declared = charset.and_then(|label| {
            let encoding = Encoding::for_label(label.as_bytes());
            if encoding.is_none() {
                warn!("无法识别的字符集: {}", label);
            }
            encoding
        });

        let encoding = match declared {
            Some(encoding) => encoding,
            None => {
                if let Ok(text) = std::str::from_utf8(&decompressed) {
                    return Ok(text.to_string());
                }

                // 非 UTF-8 时自动探测编码
                let mut detector = EncodingDetector::new();
                detector.feed(&decompressed, true);
                detector.guess(None, true)
            }
        };
        let (decoded, _, had_errors) = encoding.decode(&decompressed);
        if had_errors {
            warn!("文本解码过程中发现错误，可能存在字符丢失");
        }
        debug!("响应编码: {}", encoding.name());

        Ok(decoded.into_owned())
    }

    // 检查响应状态
    fn check_response_status(response: &Response) -> Result<(), ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        warn!("❌ 非成功状态码: {}, URL: {}", status, response.url());
        Err(ApiError::HttpStatus {
            status,
            url: response.url().to_string(),
        })
    }
}
