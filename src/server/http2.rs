//! HTTP/2 连接驱动
//!
//! 直接驱动 h2 帧编解码：连接级 accept 循环把每条多路复用流
//! 分派为一个独立的上下文适配流程（每流一个交换，流间无顺序
//! 保证）。
//!
//! 背压落在真实的流量窗口上：
//! - 入站窗口额度在 `deliver` 完成后才归还，消费者滞后时窗口
//!   收紧，对端被迫放慢；
//! - 出站每块数据先 `reserve_capacity` 等窗口授予，授予到达即
//!   "传输可写"，排水循环据此回拉生产者。

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::poll_fn;
use h2::server::SendResponse;
use h2::{RecvStream, SendStream};
use hyper::{Request, Response, Version};

use crate::error::{RatError, RatResult};
use crate::server::adapter::{
    expectation_failed_head, internal_error_head, invoke_handler, BodyPlan,
};
use crate::server::alt_svc::ServiceKind;
use crate::server::content::{
    pump_response_body, ContentSink, ContentSource, SinkWriter,
};
use crate::server::exchange::{
    check_expectation, Expectation, ExchangeLifecycle, ExchangeState, HttpContext,
    NegotiatedProtocol, RequestHead, ResponseHead,
};
use crate::server::pipeline::PipelineDeps;
use crate::utils::logger::{debug, error, info, warn};

/// 驱动一条 HTTP/2 连接：握手 + 每流分派
pub(crate) async fn serve_h2_connection<S>(
    io: S,
    remote_addr: SocketAddr,
    deps: PipelineDeps,
    kind: ServiceKind,
) -> RatResult<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut builder = h2::server::Builder::default();
    builder.max_frame_size(deps.tuning.http2.max_frame_size);
    builder.max_concurrent_streams(deps.tuning.http2.max_concurrent_streams);
    builder.initial_window_size(deps.tuning.http2.initial_window_size);

    let mut connection = builder
        .handshake(io)
        .await
        .map_err(|e| RatError::ProtocolError(format!("HTTP/2 握手失败: {}", e)))?;

    info!("🚀 [HTTP/2] 连接已建立: {} ({})", remote_addr, kind.as_str());

    while let Some(request_result) = connection.accept().await {
        match request_result {
            Ok((request, respond)) => {
                let deps = deps.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        handle_h2_stream(request, respond, remote_addr, deps, kind).await
                    {
                        if e.is_client_disconnect() {
                            debug!("🔌 [HTTP/2] 流终止: {} ({})", remote_addr, e);
                        } else {
                            error!("❌ [HTTP/2] 流处理失败: {} ({})", remote_addr, e);
                        }
                    }
                });
            }
            Err(e) => {
                if e.is_io() || e.is_go_away() {
                    debug!("🔌 [HTTP/2] 连接终止: {} ({})", remote_addr, e);
                } else {
                    error!("❌ [HTTP/2] 接受流失败: {} ({})", remote_addr, e);
                }
                break;
            }
        }
    }

    debug!("🔌 [HTTP/2] 连接关闭: {}", remote_addr);
    Ok(())
}

/// 单条 HTTP/2 流的适配流程（每流一个交换）
async fn handle_h2_stream(
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    remote_addr: SocketAddr,
    deps: PipelineDeps,
    kind: ServiceKind,
) -> RatResult<()> {
    let mut lifecycle = ExchangeLifecycle::new();
    lifecycle.advance(ExchangeState::ExpectationCheck)?;

    let (parts, mut recv_stream) = request.into_parts();
    debug!(
        "📥 [HTTP/2] 请求头: {} {} from {}",
        parts.method,
        parts.uri.path(),
        remote_addr
    );

    if check_expectation(&parts.headers) == Expectation::Unsupported {
        lifecycle.advance(ExchangeState::DrainingIgnored)?;
        warn!(
            "🚫 [HTTP/2] 不支持的 Expect 值，返回 417 并丢弃请求体: {}",
            remote_addr
        );
        let (head, body) = expectation_failed_head();
        send_fixed_response(&mut respond, head, body)?;
        discard_recv_stream(&mut recv_stream).await;
        lifecycle.advance(ExchangeState::Closed)?;
        return Ok(());
    }
    // Expect: 100-continue 在 HTTP/2 上不写续传头，客户端照常发送请求体
    lifecycle.advance(ExchangeState::Active)?;

    let request_head = RequestHead {
        method: parts.method,
        uri: parts.uri,
        version: Version::HTTP_2,
        headers: parts.headers,
        remote_addr: Some(remote_addr),
        protocol: NegotiatedProtocol::H2,
    };

    let (source, reader) = ContentSource::channel();
    let (sink, mut sink_rx) = ContentSink::channel();
    let ctx = HttpContext::new(request_head, reader, sink.clone());

    // 入站中继：窗口额度在 deliver 完成后归还
    if recv_stream.is_end_stream() {
        source.finish();
    } else {
        tokio::spawn(relay_recv_stream(recv_stream, source));
    }

    match invoke_handler(&deps.handler, &ctx, &deps.alt_svc, kind).await {
        Ok((head, plan)) => {
            lifecycle.advance(ExchangeState::Responding)?;
            match plan {
                BodyPlan::Empty => {
                    sink.close();
                    let response = head_to_h2_response(head);
                    respond.send_response(response, true).map_err(h2_send_err)?;
                }
                BodyPlan::Fixed(body) => {
                    sink.close();
                    send_fixed_response(&mut respond, head, body)?;
                }
                BodyPlan::Streamed => {
                    let response = head_to_h2_response(head);
                    let send_stream =
                        respond.send_response(response, false).map_err(h2_send_err)?;
                    let mut writer = H2SinkWriter { send: send_stream };
                    if let Err(e) = pump_response_body(&sink, &mut sink_rx, &mut writer).await
                    {
                        warn!("⚠️ [HTTP/2] 响应体排水失败，复位流: {}", e);
                        writer.send.send_reset(h2::Reason::INTERNAL_ERROR);
                        sink.close();
                    }
                    // release(close=true) 在多路复用协议上以流结束体现，
                    // 连接级关闭由编解码层/空闲策略决定
                }
            }
            lifecycle.advance(ExchangeState::Closed)?;
            Ok(())
        }
        Err(e) => {
            // 响应头尚未写出：合成 500
            sink.close();
            let (head, body) = internal_error_head(&e);
            send_fixed_response(&mut respond, head, body)?;
            lifecycle.advance(ExchangeState::Closed)?;
            Ok(())
        }
    }
}

fn head_to_h2_response(head: ResponseHead) -> Response<()> {
    let mut response = Response::new(());
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    response
}

/// 写出完整响应（头 + 一块数据 + 结束标志）
fn send_fixed_response(
    respond: &mut SendResponse<Bytes>,
    head: ResponseHead,
    body: Bytes,
) -> RatResult<()> {
    let response = head_to_h2_response(head);
    let mut send_stream = respond.send_response(response, false).map_err(h2_send_err)?;
    send_stream.send_data(body, true).map_err(h2_send_err)
}

/// 入站中继：读帧 → 交付源 → 归还窗口额度
async fn relay_recv_stream(mut recv: RecvStream, source: Arc<ContentSource>) {
    let mut discarding = false;
    while let Some(chunk) = recv.data().await {
        match chunk {
            Ok(data) => {
                let len = data.len();
                if !data.is_empty() && !discarding {
                    if source.deliver(data).await.is_err() {
                        // 消费者提前释放：余下内容只丢弃
                        discarding = true;
                    }
                }
                if len > 0 {
                    if let Err(e) = recv.flow_control().release_capacity(len) {
                        debug!("⚠️ [HTTP/2] 归还窗口额度失败: {}", e);
                        break;
                    }
                }
            }
            Err(e) => {
                source.abort(RatError::ProtocolError(format!(
                    "读取 HTTP/2 请求体失败: {}",
                    e
                )));
                return;
            }
        }
    }
    source.finish();
}

/// 丢弃整个入站流（期望判定失败后的忽略模式），窗口照常归还
async fn discard_recv_stream(recv: &mut RecvStream) {
    while let Some(chunk) = recv.data().await {
        match chunk {
            Ok(data) => {
                if recv.flow_control().release_capacity(data.len()).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

/// HTTP/2 写出端：窗口授予即传输可写
struct H2SinkWriter {
    send: SendStream<Bytes>,
}

#[async_trait]
impl SinkWriter for H2SinkWriter {
    async fn write_chunk(&mut self, mut chunk: Bytes) -> RatResult<()> {
        while !chunk.is_empty() {
            self.send.reserve_capacity(chunk.len());
            let granted = poll_fn(|cx| self.send.poll_capacity(cx))
                .await
                .ok_or_else(|| {
                    RatError::ConnectionClosed("HTTP/2 流已关闭".to_string())
                })?
                .map_err(|e| {
                    RatError::ConnectionClosed(format!("等待 HTTP/2 发送窗口失败: {}", e))
                })?;
            let frame = chunk.split_to(granted.min(chunk.len()));
            self.send.send_data(frame, false).map_err(h2_send_err)?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> RatResult<()> {
        self.send.send_data(Bytes::new(), true).map_err(h2_send_err)
    }
}

fn h2_send_err(e: h2::Error) -> RatError {
    if e.is_io() || e.is_reset() {
        RatError::ConnectionClosed(format!("HTTP/2 流写出中断: {}", e))
    } else {
        RatError::ProtocolError(format!("HTTP/2 写出失败: {}", e))
    }
}
