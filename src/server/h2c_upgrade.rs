//! H2C (HTTP/2 over Cleartext) 升级处理
//!
//! 明文路径上检测到 `Upgrade: h2c` 时答复 101，把连接从 HTTP/1.1
//! 编解码切换为 HTTP/2 帧编解码 + 每流分派；没有升级请求的明文
//! 连接始终停留在 HTTP/1.1 路径。

use std::net::SocketAddr;

use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;

use crate::server::alt_svc::ServiceKind;
use crate::server::http1::{empty_body, HttpBody};
use crate::server::pipeline::PipelineDeps;
use crate::utils::logger::{debug, error, info};

/// 请求是否携带 h2c 升级令牌
pub(crate) fn is_h2c_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("h2c"))
        })
        .unwrap_or(false)
}

/// 启动协议升级：返回 101 响应并在升级完成后切换编解码
pub(crate) fn start_h2c_upgrade(
    mut req: Request<Incoming>,
    remote_addr: SocketAddr,
    deps: PipelineDeps,
) -> Response<HttpBody> {
    debug!(
        "🔄 [H2C] 收到升级请求: {} {} from {}",
        req.method(),
        req.uri().path(),
        remote_addr
    );

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                info!(
                    "✅ [H2C] 协议升级成功，切换到 HTTP/2 帧编解码: {}",
                    remote_addr
                );
                let io = TokioIo::new(upgraded);
                if let Err(e) = crate::server::http2::serve_h2_connection(
                    io,
                    remote_addr,
                    deps,
                    ServiceKind::Http,
                )
                .await
                {
                    error!("❌ [H2C] 升级后的 HTTP/2 连接处理失败: {}", e);
                }
            }
            Err(e) => {
                error!("❌ [H2C] 协议升级失败: {}", e);
            }
        }
    });

    // 101 Switching Protocols
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    response
        .headers_mut()
        .insert(UPGRADE, HeaderValue::from_static("h2c"));
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("upgrade"));
    response
}
