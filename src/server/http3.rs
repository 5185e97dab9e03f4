//! HTTP/3 (QUIC) 连接驱动
//!
//! quinn 端点接受 QUIC 连接，h3 编解码把每条双向流解析为请求，
//! 每条流分派一个独立的上下文适配流程。连接级限额（空闲超时、
//! 数据窗口、并发流数）在端点装配时已写入传输配置。
//!
//! 地址验证默认宽松（适合可信部署）；`require_retry` 开启后对
//! 未验证来源先发 Retry 包再接受。

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use h3::quic;
use h3::server::RequestStream;
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

/// 驱动 QUIC 端点的接受循环
pub(crate) async fn serve_h3_endpoint(
    endpoint: quinn::Endpoint,
    deps: PipelineDeps,
) -> RatResult<()> {
    while let Some(incoming) = endpoint.accept().await {
        let deps = deps.clone();
        tokio::spawn(async move {
            let remote_addr = incoming.remote_address();

            if deps.tuning.quic.require_retry && !incoming.remote_address_validated() {
                debug!("🔁 [HTTP/3] 要求地址验证，发送 Retry: {}", remote_addr);
                let _ = incoming.retry();
                return;
            }

            match incoming.await {
                Ok(connection) => {
                    if let Err(e) = serve_h3_connection(connection, deps).await {
                        if e.is_client_disconnect() {
                            debug!("🔌 [HTTP/3] 连接终止: {} ({})", remote_addr, e);
                        } else {
                            error!("❌ [HTTP/3] 连接处理失败: {} ({})", remote_addr, e);
                        }
                    }
                }
                // 初始包损坏/握手失败只丢弃该连接，监听循环不受影响
                Err(e) => debug!("🚫 [HTTP/3] QUIC 握手失败，丢弃连接: {} ({})", remote_addr, e),
            }
        });
    }
    Ok(())
}

/// 驱动一条 QUIC 连接上的 HTTP/3 编解码
async fn serve_h3_connection(connection: quinn::Connection, deps: PipelineDeps) -> RatResult<()> {
    let remote_addr = connection.remote_address();
    let mut h3_conn: h3::server::Connection<h3_quinn::Connection, Bytes> =
        h3::server::Connection::new(h3_quinn::Connection::new(connection))
            .await
            .map_err(|e| RatError::ProtocolError(format!("HTTP/3 连接初始化失败: {}", e)))?;

    info!("🚀 [HTTP/3] 连接已建立: {}", remote_addr);

    loop {
        match h3_conn.accept().await {
            Ok(Some(resolver)) => {
                let deps = deps.clone();
                tokio::spawn(async move {
                    match resolver.resolve_request().await {
                        Ok((request, stream)) => {
                            if let Err(e) =
                                handle_h3_stream(request, stream, remote_addr, deps).await
                            {
                                if e.is_client_disconnect() {
                                    debug!("🔌 [HTTP/3] 流终止: {} ({})", remote_addr, e);
                                } else {
                                    error!("❌ [HTTP/3] 流处理失败: {} ({})", remote_addr, e);
                                }
                            }
                        }
                        Err(e) => debug!("🚫 [HTTP/3] 解析请求头失败: {} ({})", remote_addr, e),
                    }
                });
            }
            Ok(None) => break,
            Err(e) => {
                debug!("🔌 [HTTP/3] 连接终止: {} ({})", remote_addr, e);
                break;
            }
        }
    }

    debug!("🔌 [HTTP/3] 连接关闭: {}", remote_addr);
    Ok(())
}

/// 单条 HTTP/3 请求流的适配流程（每流一个交换）
async fn handle_h3_stream<S>(
    request: Request<()>,
    stream: RequestStream<S, Bytes>,
    remote_addr: SocketAddr,
    deps: PipelineDeps,
) -> RatResult<()>
where
    S: quic::BidiStream<Bytes> + Send + 'static,
    S::SendStream: Send + 'static,
    S::RecvStream: Send + 'static,
{
    let mut lifecycle = ExchangeLifecycle::new();
    lifecycle.advance(ExchangeState::ExpectationCheck)?;

    let (parts, _) = request.into_parts();
    debug!(
        "📥 [HTTP/3] 请求头: {} {} from {}",
        parts.method,
        parts.uri.path(),
        remote_addr
    );

    let (mut send, mut recv) = stream.split();

    if check_expectation(&parts.headers) == Expectation::Unsupported {
        lifecycle.advance(ExchangeState::DrainingIgnored)?;
        warn!(
            "🚫 [HTTP/3] 不支持的 Expect 值，返回 417 并丢弃请求体: {}",
            remote_addr
        );
        let (head, body) = expectation_failed_head();
        let mut writer = H3SinkWriter { send };
        writer.send_head(head).await?;
        writer.write_chunk(body).await?;
        writer.finish().await?;
        discard_h3_body(&mut recv).await;
        lifecycle.advance(ExchangeState::Closed)?;
        return Ok(());
    }
    // Expect: 100-continue 在 HTTP/3 上不写续传头，客户端照常发送请求体
    lifecycle.advance(ExchangeState::Active)?;

    let request_head = RequestHead {
        method: parts.method,
        uri: parts.uri,
        version: Version::HTTP_3,
        headers: parts.headers,
        remote_addr: Some(remote_addr),
        protocol: NegotiatedProtocol::H3,
    };

    let (source, reader) = ContentSource::channel();
    let (sink, mut sink_rx) = ContentSink::channel();
    let ctx = HttpContext::new(request_head, reader, sink.clone());

    tokio::spawn(relay_h3_body(recv, source));

    let mut writer = H3SinkWriter { send };
    match invoke_handler(&deps.handler, &ctx, &deps.alt_svc, ServiceKind::Http3).await {
        Ok((head, plan)) => {
            lifecycle.advance(ExchangeState::Responding)?;
            writer.send_head(head).await?;
            match plan {
                BodyPlan::Empty => {
                    sink.close();
                    writer.finish().await?;
                }
                BodyPlan::Fixed(body) => {
                    sink.close();
                    writer.write_chunk(body).await?;
                    writer.finish().await?;
                }
                BodyPlan::Streamed => {
                    if let Err(e) = pump_response_body(&sink, &mut sink_rx, &mut writer).await
                    {
                        warn!("⚠️ [HTTP/3] 响应体排水失败，终止流: {}", e);
                        sink.close();
                        return Err(e);
                    }
                }
            }
            lifecycle.advance(ExchangeState::Closed)?;
            Ok(())
        }
        Err(e) => {
            // 响应头尚未写出：合成 500
            sink.close();
            let (head, body) = internal_error_head(&e);
            writer.send_head(head).await?;
            writer.write_chunk(body).await?;
            writer.finish().await?;
            lifecycle.advance(ExchangeState::Closed)?;
            Ok(())
        }
    }
}

/// 入站中继：读数据帧 → 交付源；QUIC 流量窗口由编解码层随消费恢复
async fn relay_h3_body<R>(mut recv: RequestStream<R, Bytes>, source: Arc<ContentSource>)
where
    R: quic::RecvStream,
{
    let mut discarding = false;
    loop {
        match recv.recv_data().await {
            Ok(Some(mut buf)) => {
                let chunk = buf.copy_to_bytes(buf.remaining());
                if chunk.is_empty() || discarding {
                    continue;
                }
                if source.deliver(chunk).await.is_err() {
                    // 消费者提前释放：余下内容只丢弃
                    discarding = true;
                }
            }
            Ok(None) => {
                source.finish();
                return;
            }
            Err(e) => {
                source.abort(RatError::ProtocolError(format!(
                    "读取 HTTP/3 请求体失败: {}",
                    e
                )));
                return;
            }
        }
    }
}

/// 丢弃整个入站流（期望判定失败后的忽略模式）
async fn discard_h3_body<R>(recv: &mut RequestStream<R, Bytes>)
where
    R: quic::RecvStream,
{
    loop {
        match recv.recv_data().await {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return,
        }
    }
}

/// HTTP/3 写出端：send_data 完成即传输重新可写
struct H3SinkWriter<S>
where
    S: quic::SendStream<Bytes>,
{
    send: RequestStream<S, Bytes>,
}

impl<S> H3SinkWriter<S>
where
    S: quic::SendStream<Bytes>,
{
    async fn send_head(&mut self, head: ResponseHead) -> RatResult<()> {
        let mut response = Response::new(());
        *response.status_mut() = head.status;
        *response.headers_mut() = head.headers;
        self.send
            .send_response(response)
            .await
            .map_err(|e| RatError::ConnectionClosed(format!("写出 HTTP/3 响应头失败: {}", e)))
    }
}

#[async_trait]
impl<S> SinkWriter for H3SinkWriter<S>
where
    S: quic::SendStream<Bytes> + Send,
{
    async fn write_chunk(&mut self, chunk: Bytes) -> RatResult<()> {
        self.send
            .send_data(chunk)
            .await
            .map_err(|e| RatError::ConnectionClosed(format!("写出 HTTP/3 数据失败: {}", e)))
    }

    async fn finish(&mut self) -> RatResult<()> {
        self.send
            .finish()
            .await
            .map_err(|e| RatError::ConnectionClosed(format!("结束 HTTP/3 流失败: {}", e)))
    }
}
