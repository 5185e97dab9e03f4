//! HTTP 交换模型
//!
//! 一次请求/响应循环（Exchange）与底层连接是两个概念：
//! HTTP/1.1 keep-alive 连接上顺序承载多个交换，HTTP/2、HTTP/3
//! 的每条多路复用流各是一个独立交换。
//!
//! 交换生命周期单向推进，任何状态不会被重入；非法迁移按契约违规
//! 快速失败。

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, DATE, EXPECT, SERVER};
use hyper::{Method, StatusCode, Uri, Version};

use crate::error::{RatError, RatResult};
use crate::server::content::{ContentSink, SourceReader};

/// Server 响应头标识
pub(crate) const SERVER_TOKEN: &str = concat!("RAT-HttpCore/", env!("CARGO_PKG_VERSION"));

/// 连接建立时协商出的应用协议；协商一次，之后不可变
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiatedProtocol {
    Http11,
    H2,
    H3,
}

impl NegotiatedProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiatedProtocol::Http11 => "http/1.1",
            NegotiatedProtocol::H2 => "h2",
            NegotiatedProtocol::H3 => "h3",
        }
    }

    /// 是否为多路复用协议（每流一个交换，连接续用由编解码层管理）
    pub fn is_multiplexed(&self) -> bool {
        !matches!(self, NegotiatedProtocol::Http11)
    }
}

/// 解码后的请求头（只读视图）
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
    pub protocol: NegotiatedProtocol,
}

/// 由应用填充的响应头
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    /// 补齐 Date / Server 头（已有值不覆盖）
    pub(crate) fn stamp(&mut self) {
        if !self.headers.contains_key(DATE) {
            let now = httpdate::fmt_http_date(SystemTime::now());
            if let Ok(value) = HeaderValue::from_str(&now) {
                self.headers.insert(DATE, value);
            }
        }
        if !self.headers.contains_key(SERVER) {
            self.headers
                .insert(SERVER, HeaderValue::from_static(SERVER_TOKEN));
        }
    }
}

impl Default for ResponseHead {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

/// 交换状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// 连接上暂无在途交换
    Idle,
    /// 已收到请求头，正在判定 Expect 语义
    ExpectationCheck,
    /// 处理器已被调用，请求体转交源
    Active,
    /// 期望判定失败，后续请求体只丢弃不转发
    DrainingIgnored,
    /// 响应头已写出，响应体排水中
    Responding,
    /// 双向均完成或出错终止
    Closed,
}

/// 单向推进的交换状态机
#[derive(Debug)]
pub struct ExchangeLifecycle {
    state: ExchangeState,
}

impl ExchangeLifecycle {
    pub fn new() -> Self {
        Self {
            state: ExchangeState::Idle,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// 推进状态；任何状态不可重入，非法迁移是契约违规
    pub fn advance(&mut self, next: ExchangeState) -> RatResult<()> {
        use ExchangeState::*;
        let legal = matches!(
            (self.state, next),
            (Idle, ExpectationCheck)
                | (ExpectationCheck, Active)
                | (ExpectationCheck, DrainingIgnored)
                | (Active, Responding)
                | (Responding, Closed)
                | (DrainingIgnored, Closed)
                // 错误路径允许从任何未完结状态直达 Closed
                | (Idle, Closed)
                | (ExpectationCheck, Closed)
                | (Active, Closed)
        );
        if !legal {
            return Err(RatError::ContractViolation(format!(
                "交换状态机非法迁移: {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

impl Default for ExchangeLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Expect 请求头的判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// 未声明期望
    None,
    /// 100-continue，受支持
    Continue,
    /// 其他期望值，一律按 417 处理
    Unsupported,
}

/// 解析请求的 Expect 头
pub fn check_expectation(headers: &HeaderMap) -> Expectation {
    match headers.get(EXPECT) {
        None => Expectation::None,
        Some(value) => match value.to_str() {
            Ok(s) if s.trim().eq_ignore_ascii_case("100-continue") => Expectation::Continue,
            _ => Expectation::Unsupported,
        },
    }
}

/// keep-alive 判定
///
/// HTTP/1.0 需显式 `Connection: keep-alive`；HTTP/1.1 默认保持，
/// 除非请求声明 `Connection: close` 或本次交换被强制关闭
/// （响应头已发出后处理器出错、生产者 release(close=true) 等）。
pub fn keep_alive_allowed(version: Version, headers: &HeaderMap, forced_close: bool) -> bool {
    if forced_close {
        return false;
    }
    let connection = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let mut tokens = connection.split(',').map(|t| t.trim());
    match version {
        Version::HTTP_10 => tokens.any(|t| t.eq_ignore_ascii_case("keep-alive")),
        _ => !tokens.any(|t| t.eq_ignore_ascii_case("close")),
    }
}

/// 一次 HTTP 交换的上下文，交给应用处理器
///
/// 处理器在完成前填充响应头；流式响应通过 [`ContentSink::source`]
/// 附加生产者，小响应直接用 [`respond`](Self::respond)。
pub struct HttpContext {
    request: RequestHead,
    body: tokio::sync::Mutex<SourceReader>,
    response: Mutex<ResponseHead>,
    fixed_body: Mutex<Option<Bytes>>,
    sink: ContentSink,
}

impl HttpContext {
    pub(crate) fn new(request: RequestHead, body: SourceReader, sink: ContentSink) -> Arc<Self> {
        Arc::new(Self {
            request,
            body: tokio::sync::Mutex::new(body),
            response: Mutex::new(ResponseHead::default()),
            fixed_body: Mutex::new(None),
            sink,
        })
    }

    /// 请求头视图
    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    pub fn method(&self) -> &Method {
        &self.request.method
    }

    pub fn uri(&self) -> &Uri {
        &self.request.uri
    }

    pub fn path(&self) -> &str {
        self.request.uri.path()
    }

    pub fn version(&self) -> Version {
        self.request.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.request.headers
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.request.remote_addr
    }

    pub fn protocol(&self) -> NegotiatedProtocol {
        self.request.protocol
    }

    /// 请求体读取端（手动读模式，读取节奏即背压信号）
    pub fn body(&self) -> &tokio::sync::Mutex<SourceReader> {
        &self.body
    }

    /// 响应体下沉（流式响应时附加生产者）
    pub fn sink(&self) -> ContentSink {
        self.sink.clone()
    }

    /// 设置响应状态码
    pub fn set_status(&self, status: StatusCode) {
        if let Ok(mut head) = self.response.lock() {
            head.status = status;
        }
    }

    /// 写入响应头字段
    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        if let Ok(mut head) = self.response.lock() {
            head.headers.insert(name, value);
        }
    }

    /// 一次性响应：设置状态、Content-Type 与完整响应体
    pub fn respond(&self, status: StatusCode, content_type: &str, body: Bytes) {
        self.set_status(status);
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.insert_header(hyper::header::CONTENT_TYPE, value);
        }
        if let Ok(mut fixed) = self.fixed_body.lock() {
            *fixed = Some(body);
        }
    }

    pub(crate) fn take_response_head(&self) -> ResponseHead {
        match self.response.lock() {
            Ok(mut head) => std::mem::take(&mut *head),
            Err(_) => ResponseHead::default(),
        }
    }

    pub(crate) fn take_fixed_body(&self) -> Option<Bytes> {
        match self.fixed_body.lock() {
            Ok(mut fixed) => fixed.take(),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_normal_path() {
        let mut lc = ExchangeLifecycle::new();
        lc.advance(ExchangeState::ExpectationCheck).unwrap();
        lc.advance(ExchangeState::Active).unwrap();
        lc.advance(ExchangeState::Responding).unwrap();
        lc.advance(ExchangeState::Closed).unwrap();
        assert_eq!(lc.state(), ExchangeState::Closed);
    }

    #[test]
    fn test_lifecycle_rejects_revisit_and_illegal_jump() {
        let mut lc = ExchangeLifecycle::new();
        lc.advance(ExchangeState::ExpectationCheck).unwrap();
        lc.advance(ExchangeState::Active).unwrap();
        // 不可回退
        assert!(lc.advance(ExchangeState::ExpectationCheck).is_err());
        // 不可跳过 Active -> DrainingIgnored
        assert!(lc.advance(ExchangeState::DrainingIgnored).is_err());
        lc.advance(ExchangeState::Closed).unwrap();
        // 终态后不可再迁移
        assert!(lc.advance(ExchangeState::Idle).is_err());
        assert!(lc.advance(ExchangeState::Closed).is_err());
    }

    #[test]
    fn test_lifecycle_draining_path() {
        let mut lc = ExchangeLifecycle::new();
        lc.advance(ExchangeState::ExpectationCheck).unwrap();
        lc.advance(ExchangeState::DrainingIgnored).unwrap();
        assert!(lc.advance(ExchangeState::Responding).is_err());
        lc.advance(ExchangeState::Closed).unwrap();
    }

    #[test]
    fn test_check_expectation() {
        let mut headers = HeaderMap::new();
        assert_eq!(check_expectation(&headers), Expectation::None);

        headers.insert(EXPECT, HeaderValue::from_static("100-continue"));
        assert_eq!(check_expectation(&headers), Expectation::Continue);

        headers.insert(EXPECT, HeaderValue::from_static("100-CONTINUE"));
        assert_eq!(check_expectation(&headers), Expectation::Continue);

        headers.insert(EXPECT, HeaderValue::from_static("203-checkpoint"));
        assert_eq!(check_expectation(&headers), Expectation::Unsupported);
    }

    #[test]
    fn test_keep_alive_decision() {
        let empty = HeaderMap::new();
        assert!(keep_alive_allowed(Version::HTTP_11, &empty, false));
        assert!(!keep_alive_allowed(Version::HTTP_10, &empty, false));
        assert!(!keep_alive_allowed(Version::HTTP_11, &empty, true));

        let mut close = HeaderMap::new();
        close.insert(CONNECTION, HeaderValue::from_static("close"));
        assert!(!keep_alive_allowed(Version::HTTP_11, &close, false));

        let mut ka = HeaderMap::new();
        ka.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(keep_alive_allowed(Version::HTTP_10, &ka, false));

        let mut multi = HeaderMap::new();
        multi.insert(CONNECTION, HeaderValue::from_static("Upgrade, Close"));
        assert!(!keep_alive_allowed(Version::HTTP_11, &multi, false));
    }

    #[test]
    fn test_response_head_stamp() {
        let mut head = ResponseHead::new(StatusCode::OK);
        head.stamp();
        assert!(head.headers.contains_key(DATE));
        assert_eq!(
            head.headers.get(SERVER).and_then(|v| v.to_str().ok()),
            Some(SERVER_TOKEN)
        );

        // 已有 Server 值不被覆盖
        let mut custom = ResponseHead::new(StatusCode::OK);
        custom
            .headers
            .insert(SERVER, HeaderValue::from_static("upstream"));
        custom.stamp();
        assert_eq!(
            custom.headers.get(SERVER).and_then(|v| v.to_str().ok()),
            Some("upstream")
        );
    }
}
