//! HTTP/1.1 端到端交换测试
//!
//! 在回环套接字上用原始报文驱动明文管道，覆盖：keep-alive 串行
//! 交换、不支持的 Expect 值（417 + 丢弃请求体 + 连接续用）、
//! 100-continue、流式响应体顺序以及处理器失败的合成 500。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use rat_httpcore::server::{
    AltSvcRegistry, ContentProducer, HttpContext, HttpHandler, PipelineDeps, PipelineRecipe,
    ProtocolTuning, SinkHandle, StatusCode,
};
use rat_httpcore::{RatError, RatResult};

/// 按路径分派的测试处理器
struct TestHandler;

#[async_trait::async_trait]
impl HttpHandler for TestHandler {
    async fn handle(&self, ctx: Arc<HttpContext>) -> RatResult<()> {
        match ctx.path() {
            "/ping" => {
                ctx.respond(StatusCode::OK, "text/plain", Bytes::from_static(b"pong"));
                Ok(())
            }
            "/echo" => {
                let body = ctx.body().lock().await.read_to_end(1024 * 1024).await?;
                ctx.respond(StatusCode::OK, "application/octet-stream", body);
                Ok(())
            }
            "/stream" => {
                ctx.set_status(StatusCode::OK);
                ctx.sink().source(Arc::new(ScriptedProducer::new(vec![
                    "alpha", "beta", "gamma",
                ])))?;
                Ok(())
            }
            "/boom" => Err(RatError::HandlerError("预期中的失败".to_string())),
            other => {
                ctx.respond(
                    StatusCode::NOT_FOUND,
                    "text/plain",
                    Bytes::from(format!("未知路径: {}", other)),
                );
                Ok(())
            }
        }
    }
}

/// 每次拉取推送一块预置数据的生产者
struct ScriptedProducer {
    chunks: Mutex<Vec<Bytes>>,
}

impl ScriptedProducer {
    fn new(chunks: Vec<&'static str>) -> Self {
        Self {
            chunks: Mutex::new(chunks.into_iter().map(Bytes::from).collect()),
        }
    }
}

impl ContentProducer for ScriptedProducer {
    fn pull(&self, handle: SinkHandle) {
        let next = self.chunks.lock().ok().and_then(|mut chunks| {
            if chunks.is_empty() {
                None
            } else {
                Some(chunks.remove(0))
            }
        });
        match next {
            Some(chunk) => handle.push(chunk).expect("测试生产者推送失败"),
            None => handle.release(false),
        }
    }
}

/// 启动只接受一条连接的明文管道，返回客户端套接字
async fn connect_pipeline() -> TcpStream {
    connect_pipeline_with(Arc::new(AltSvcRegistry::new(true, 86400))).await
}

async fn connect_pipeline_with(alt_svc: Arc<AltSvcRegistry>) -> TcpStream {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("绑定失败");
    let addr = listener.local_addr().expect("取地址失败");

    tokio::spawn(async move {
        if let Ok((stream, remote_addr)) = listener.accept().await {
            let deps = PipelineDeps {
                handler: Arc::new(TestHandler),
                alt_svc,
                tuning: Arc::new(ProtocolTuning {
                    http2: Default::default(),
                    quic: Default::default(),
                }),
            };
            let _ = PipelineRecipe::Cleartext
                .assemble_tcp(stream, remote_addr, deps)
                .await;
        }
    });

    TcpStream::connect(addr).await.expect("连接失败")
}

/// 原始 HTTP/1.1 响应读取器（支持 Content-Length 与 chunked）
struct ResponseReader {
    buf: Vec<u8>,
}

impl ResponseReader {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    async fn fill(&mut self, stream: &mut TcpStream) -> bool {
        let mut chunk = [0u8; 4096];
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk)).await {
            Ok(Ok(0)) => false,
            Ok(Ok(n)) => {
                self.buf.extend_from_slice(&chunk[..n]);
                true
            }
            _ => false,
        }
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }

    /// 读取一个响应头块（跳到 \r\n\r\n 为止）
    async fn read_head(&mut self, stream: &mut TcpStream) -> String {
        loop {
            if let Some(pos) = Self::find(&self.buf, b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&self.buf[..pos]).to_string();
                self.buf.drain(..pos + 4);
                return head;
            }
            assert!(self.fill(stream).await, "等待响应头时连接关闭");
        }
    }

    async fn read_exact_body(&mut self, stream: &mut TcpStream, len: usize) -> Vec<u8> {
        while self.buf.len() < len {
            assert!(self.fill(stream).await, "等待响应体时连接关闭");
        }
        let body: Vec<u8> = self.buf.drain(..len).collect();
        body
    }

    /// 解析 chunked 响应体直到 0 块
    async fn read_chunked_body(&mut self, stream: &mut TcpStream) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        loop {
            let line_end = loop {
                if let Some(pos) = Self::find(&self.buf, b"\r\n") {
                    break pos;
                }
                assert!(self.fill(stream).await, "等待块长度时连接关闭");
            };
            let size_line = String::from_utf8_lossy(&self.buf[..line_end]).to_string();
            self.buf.drain(..line_end + 2);
            let size = usize::from_str_radix(size_line.trim(), 16).expect("块长度非法");
            if size == 0 {
                // 终结块后的空行
                while self.buf.len() < 2 {
                    assert!(self.fill(stream).await, "等待终结空行时连接关闭");
                }
                self.buf.drain(..2);
                return chunks;
            }
            while self.buf.len() < size + 2 {
                assert!(self.fill(stream).await, "等待块数据时连接关闭");
            }
            chunks.push(self.buf.drain(..size).collect());
            self.buf.drain(..2);
        }
    }

    /// 按 Content-Length 读取一个完整响应，返回（头, 体）
    async fn read_response(&mut self, stream: &mut TcpStream) -> (String, Vec<u8>) {
        let head = self.read_head(stream).await;
        let lower = head.to_ascii_lowercase();
        let len = lower
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .map(|v| v.trim().parse::<usize>().expect("Content-Length 非法"))
            .unwrap_or(0);
        let body = self.read_exact_body(stream, len).await;
        (head, body)
    }
}

#[tokio::test]
async fn test_keep_alive_serves_sequential_exchanges() {
    let mut client = connect_pipeline().await;
    let mut reader = ResponseReader::new();

    client
        .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .expect("写请求失败");
    let (head, body) = reader.read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "响应头: {}", head);
    assert_eq!(body, b"pong");
    assert!(
        head.to_ascii_lowercase().contains("server: rat-httpcore/"),
        "应打上 Server 标识: {}",
        head
    );

    // 同一连接上的第二个交换（上一交换 Closed 之后才开始）
    client
        .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .expect("写第二个请求失败");
    let (head, body) = reader.read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(body, b"pong");
}

#[tokio::test]
async fn test_unsupported_expect_yields_417_and_keeps_connection() {
    let mut client = connect_pipeline().await;
    let mut reader = ResponseReader::new();

    client
        .write_all(
            b"POST /echo HTTP/1.1\r\nHost: localhost\r\nExpect: 203-checkpoint\r\nContent-Length: 7\r\n\r\nignored",
        )
        .await
        .expect("写请求失败");
    let (head, body) = reader.read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 417"), "响应头: {}", head);
    assert_eq!(body, b"417 Expectation Failed");

    // 请求体被丢弃而非转发，连接仍可服务下一个交换
    client
        .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .expect("写后续请求失败");
    let (head, body) = reader.read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(body, b"pong");
}

#[tokio::test]
async fn test_expect_continue_then_echo() {
    let mut client = connect_pipeline().await;
    let mut reader = ResponseReader::new();

    client
        .write_all(
            b"POST /echo HTTP/1.1\r\nHost: localhost\r\nExpect: 100-continue\r\nContent-Length: 6\r\n\r\n",
        )
        .await
        .expect("写请求头失败");

    // 编解码层在应用拉体时写出 100 Continue
    let interim = reader.read_head(&mut client).await;
    assert!(
        interim.starts_with("HTTP/1.1 100"),
        "应先收到续传头: {}",
        interim
    );

    client.write_all(b"abcdef").await.expect("写请求体失败");
    let (head, body) = reader.read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "响应头: {}", head);
    assert_eq!(body, b"abcdef");
}

#[tokio::test]
async fn test_streamed_response_preserves_push_order() {
    let mut client = connect_pipeline().await;
    let mut reader = ResponseReader::new();

    client
        .write_all(b"GET /stream HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .expect("写请求失败");

    let head = reader.read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "响应头: {}", head);
    let lower = head.to_ascii_lowercase();
    assert!(
        lower.contains("transfer-encoding: chunked"),
        "流式响应应为 chunked: {}",
        head
    );

    let chunks = reader.read_chunked_body(&mut client).await;
    let joined: Vec<u8> = chunks.concat();
    assert_eq!(
        joined, b"alphabetagamma",
        "响应体字节序必须与 push 顺序一致"
    );
}

#[tokio::test]
async fn test_handler_failure_yields_500_then_recovers() {
    let mut client = connect_pipeline().await;
    let mut reader = ResponseReader::new();

    client
        .write_all(b"GET /boom HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .expect("写请求失败");
    let (head, body) = reader.read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 500"), "响应头: {}", head);
    assert_eq!(body, b"500 Internal Server Error");

    // 响应头写出前的失败不强制断连
    client
        .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .expect("写后续请求失败");
    let (head, _) = reader.read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"));
}

#[tokio::test]
async fn test_connection_close_is_honored() {
    let mut client = connect_pipeline().await;
    let mut reader = ResponseReader::new();

    client
        .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("写请求失败");
    let (head, body) = reader.read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    assert!(head.to_ascii_lowercase().contains("connection: close"));
    assert_eq!(body, b"pong");

    // 对端应随后关闭连接
    let mut probe = [0u8; 1];
    let eof = tokio::time::timeout(Duration::from_secs(5), client.read(&mut probe)).await;
    assert!(matches!(eof, Ok(Ok(0))), "连接应在响应后关闭");
}

#[tokio::test]
async fn test_published_alt_svc_is_injected_into_responses() {
    use rat_httpcore::server::{BoundService, ServiceKind};

    let registry = Arc::new(AltSvcRegistry::new(true, 86400));
    registry.publish(&[
        BoundService {
            kind: ServiceKind::Http,
            configured_host: "localhost".to_string(),
            bound_addr: "127.0.0.1:8080".parse().expect("测试地址非法"),
        },
        BoundService {
            kind: ServiceKind::Http3,
            configured_host: "localhost".to_string(),
            bound_addr: "127.0.0.1:9443".parse().expect("测试地址非法"),
        },
    ]);

    let mut client = connect_pipeline_with(registry).await;
    let mut reader = ResponseReader::new();

    client
        .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .expect("写请求失败");
    let (head, _) = reader.read_response(&mut client).await;
    assert!(
        head.to_ascii_lowercase()
            .contains("alt-svc: h3=\":9443\"; ma=86400"),
        "已发布的通告应注入响应头: {}",
        head
    );
}

#[tokio::test]
async fn test_h2c_upgrade_answers_101_plain_request_does_not() {
    let mut client = connect_pipeline().await;
    let mut reader = ResponseReader::new();

    client
        .write_all(
            b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade, HTTP2-Settings\r\nUpgrade: h2c\r\nHTTP2-Settings: AAMAAABkAAQAAP__\r\n\r\n",
        )
        .await
        .expect("写升级请求失败");

    let head = reader.read_head(&mut client).await;
    assert!(
        head.starts_with("HTTP/1.1 101"),
        "h2c 升级应答复 101: {}",
        head
    );
    assert!(head.to_ascii_lowercase().contains("upgrade: h2c"));
}
