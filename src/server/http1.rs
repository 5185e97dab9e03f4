//! HTTP/1.1 连接驱动
//!
//! 明文与 TLS 回落路径共用：hyper http1 编解码 + 每请求一个
//! 上下文适配流程。HTTP/1.1 同一连接上交换严格串行（编解码层
//! 在上一响应完成前不会解码下一请求头），流水线请求天然不会
//! 产生并发交换。
//!
//! 流式响应通过容量为 1 的通道交给编解码层：hyper 取走一块即
//! 表示传输重新可写，排水循环据此回拉生产者。

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderValue, CONNECTION};
use hyper::service::service_fn;
use hyper::{Request, Response, Version};
use hyper_util::rt::TokioIo;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

use async_trait::async_trait;

use crate::error::{RatError, RatResult};
use crate::server::adapter::{
    expectation_failed_head, internal_error_head, invoke_handler, BodyPlan,
};
use crate::server::alt_svc::ServiceKind;
use crate::server::content::{
    pump_response_body, ContentSink, ContentSource, SinkWriter,
};
use crate::server::exchange::{
    check_expectation, keep_alive_allowed, Expectation, ExchangeLifecycle, ExchangeState,
    HttpContext, NegotiatedProtocol, RequestHead, ResponseHead,
};
use crate::server::h2c_upgrade;
use crate::server::pipeline::PipelineDeps;
use crate::server::is_quiet_disconnect;
use crate::utils::logger::{debug, warn};

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub(crate) type HttpBody = BoxBody<Bytes, BoxError>;

pub(crate) fn empty_body() -> HttpBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

pub(crate) fn full_body(body: Bytes) -> HttpBody {
    Full::new(body).map_err(|never| match never {}).boxed()
}

fn head_to_response(head: ResponseHead, body: HttpBody) -> Response<HttpBody> {
    let mut response = Response::new(body);
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    response
}

/// 驱动一条 HTTP/1.1 连接直至关闭
pub(crate) async fn serve_http1_connection<S>(
    stream: S,
    remote_addr: SocketAddr,
    deps: PipelineDeps,
    kind: ServiceKind,
) -> RatResult<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    debug!("🌐 [HTTP/1.1] 连接开始: {} ({})", remote_addr, kind.as_str());

    let (close_tx, mut close_rx) = watch::channel(false);
    let close_tx = Arc::new(close_tx);

    let io = TokioIo::new(stream);
    let service_deps = deps.clone();
    let service_close = close_tx.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let deps = service_deps.clone();
        let close_tx = service_close.clone();
        async move {
            match handle_http1_exchange(req, remote_addr, deps, kind, close_tx).await {
                Ok(response) => Ok::<_, Infallible>(response),
                Err(e) => {
                    warn!("⚠️ [HTTP/1.1] 交换处理失败: {} ({})", remote_addr, e);
                    let (head, body) = internal_error_head(&e);
                    Ok(head_to_response(head, full_body(body)))
                }
            }
        }
    });

    let conn = hyper::server::conn::http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);

    let result = loop {
        tokio::select! {
            result = conn.as_mut() => break result,
            changed = close_rx.changed() => match changed {
                Ok(()) => {
                    if *close_rx.borrow_and_update() {
                        debug!("🔌 [HTTP/1.1] 交换要求放弃 keep-alive，优雅停机: {}", remote_addr);
                        conn.as_mut().graceful_shutdown();
                    }
                }
                // 发送端全部退出，不会再有关闭请求
                Err(_) => break conn.as_mut().await,
            },
        }
    };

    if let Err(e) = result {
        let msg = e.to_string();
        if is_quiet_disconnect(&msg) {
            debug!("🔌 [HTTP/1.1] 客户端断开连接: {} ({})", remote_addr, msg);
        } else {
            return Err(RatError::ProtocolError(format!(
                "HTTP/1.1 连接处理失败: {}",
                msg
            )));
        }
    }
    debug!("🔌 [HTTP/1.1] 连接关闭: {}", remote_addr);
    Ok(())
}

/// 单次 HTTP/1.1 交换的适配流程
async fn handle_http1_exchange(
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    deps: PipelineDeps,
    kind: ServiceKind,
    close_tx: Arc<watch::Sender<bool>>,
) -> RatResult<Response<HttpBody>> {
    let mut lifecycle = ExchangeLifecycle::new();
    lifecycle.advance(ExchangeState::ExpectationCheck)?;

    // h2c 升级只在明文路径注册；TLS 路径的协议选择由 ALPN 完成
    if kind == ServiceKind::Http && h2c_upgrade::is_h2c_upgrade(req.headers()) {
        return Ok(h2c_upgrade::start_h2c_upgrade(req, remote_addr, deps));
    }

    match check_expectation(req.headers()) {
        Expectation::Unsupported => {
            lifecycle.advance(ExchangeState::DrainingIgnored)?;
            warn!(
                "🚫 [HTTP/1.1] 不支持的 Expect 值，返回 417 并丢弃请求体: {}",
                remote_addr
            );
            // 后续请求体只丢弃，不转发给任何源
            tokio::spawn(discard_body(req.into_body()));
            lifecycle.advance(ExchangeState::Closed)?;
            let (head, body) = expectation_failed_head();
            return Ok(head_to_response(head, full_body(body)));
        }
        Expectation::Continue => {
            // hyper 在首次拉取请求体时写出 100 Continue；
            // 下方的中继任务先于处理器拉体，应用代码不会跑在续传头之前
            debug!("⏳ [HTTP/1.1] Expect: 100-continue: {}", remote_addr);
        }
        Expectation::None => {}
    }
    lifecycle.advance(ExchangeState::Active)?;

    let (parts, incoming) = req.into_parts();
    let version = parts.version;
    let request_head = RequestHead {
        method: parts.method,
        uri: parts.uri,
        version,
        headers: parts.headers,
        remote_addr: Some(remote_addr),
        protocol: NegotiatedProtocol::Http11,
    };

    let (source, reader) = ContentSource::channel();
    let (sink, mut sink_rx) = ContentSink::channel();
    let ctx = HttpContext::new(request_head, reader, sink.clone());

    // 请求体中继：deliver 挂起即停止向编解码层拉取（手动读模式）
    tokio::spawn(relay_incoming(incoming, source));

    match invoke_handler(&deps.handler, &ctx, &deps.alt_svc, kind).await {
        Ok((mut head, plan)) => {
            lifecycle.advance(ExchangeState::Responding)?;
            let keep_alive = keep_alive_allowed(version, ctx.headers(), false);
            apply_connection_header(&mut head, version, keep_alive);

            match plan {
                BodyPlan::Empty => {
                    sink.close();
                    lifecycle.advance(ExchangeState::Closed)?;
                    Ok(head_to_response(head, empty_body()))
                }
                BodyPlan::Fixed(body) => {
                    sink.close();
                    lifecycle.advance(ExchangeState::Closed)?;
                    Ok(head_to_response(head, full_body(body)))
                }
                BodyPlan::Streamed => {
                    // 容量 1：hyper 消费一块即代表可写，排水循环回拉生产者
                    let (body_tx, body_rx) = mpsc::channel::<Result<Frame<Bytes>, BoxError>>(1);
                    let stream_body = StreamBody::new(ReceiverStream::new(body_rx));

                    tokio::spawn(async move {
                        let mut writer = Http1SinkWriter { tx: Some(body_tx) };
                        match pump_response_body(&sink, &mut sink_rx, &mut writer).await {
                            Ok(close) => {
                                let _ = lifecycle.advance(ExchangeState::Closed);
                                if close {
                                    let _ = close_tx.send(true);
                                }
                            }
                            Err(e) => {
                                warn!("⚠️ [HTTP/1.1] 响应体排水失败，关闭连接: {}", e);
                                writer.fail(e).await;
                                sink.close();
                                let _ = lifecycle.advance(ExchangeState::Closed);
                                let _ = close_tx.send(true);
                            }
                        }
                    });
                    Ok(head_to_response(head, stream_body.boxed()))
                }
            }
        }
        Err(e) => {
            // 响应头尚未写出：合成 500；连接续用按请求头判定
            sink.close();
            let (mut head, body) = internal_error_head(&e);
            let keep_alive = keep_alive_allowed(version, ctx.headers(), false);
            apply_connection_header(&mut head, version, keep_alive);
            lifecycle.advance(ExchangeState::Closed)?;
            Ok(head_to_response(head, full_body(body)))
        }
    }
}

fn apply_connection_header(head: &mut ResponseHead, version: Version, keep_alive: bool) {
    if keep_alive {
        // HTTP/1.0 的续用需显式声明
        if version == Version::HTTP_10 {
            head.headers
                .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }
    } else {
        head.headers
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
}

/// 入站中继：把编解码层的请求体帧转交源，消费者释放后转为丢弃
async fn relay_incoming(mut body: Incoming, source: Arc<ContentSource>) {
    let mut discarding = false;
    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    if data.is_empty() || discarding {
                        continue;
                    }
                    if source.deliver(data).await.is_err() {
                        // 消费者提前释放：继续读完并丢弃，保住 keep-alive
                        discarding = true;
                    }
                }
            }
            Some(Err(e)) => {
                source.abort(RatError::ProtocolError(format!("读取请求体失败: {}", e)));
                return;
            }
            None => {
                source.finish();
                return;
            }
        }
    }
}

/// 丢弃整个请求体（期望判定失败后的忽略模式）
async fn discard_body(mut body: Incoming) {
    while let Some(frame) = body.frame().await {
        if frame.is_err() {
            break;
        }
    }
}

/// HTTP/1.1 写出端：通道被 hyper 消费即表示传输可写
struct Http1SinkWriter {
    tx: Option<mpsc::Sender<Result<Frame<Bytes>, BoxError>>>,
}

#[async_trait]
impl SinkWriter for Http1SinkWriter {
    async fn write_chunk(&mut self, chunk: Bytes) -> RatResult<()> {
        let tx = self.tx.as_ref().ok_or_else(|| {
            RatError::ConnectionClosed("响应体通道已结束".to_string())
        })?;
        tx.send(Ok(Frame::data(chunk)))
            .await
            .map_err(|_| RatError::ConnectionClosed("客户端中止了响应体".to_string()))
    }

    async fn finish(&mut self) -> RatResult<()> {
        // 丢掉发送端即宣告响应体结束
        self.tx.take();
        Ok(())
    }
}

impl Http1SinkWriter {
    /// 以错误终止响应体，hyper 将中断而不是正常收尾该连接
    async fn fail(&mut self, err: RatError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err.into())).await;
        }
    }
}
