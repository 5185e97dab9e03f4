//! 协议协商与管道装配
//!
//! 一条接受的原始连接 + 静态已知的服务配置 → 一条以上下文适配
//! 流程收尾的编解码链。三种装配配方收敛为一个带标签的枚举与
//! 单个装配函数，不做面向传输变体的继承层次；装配依赖显式注入，
//! 不经过任何进程级注册表。
//!
//! 装配本身没有可恢复错误路径：握手/升级失败只关掉肇事连接，
//! 配置不可能（如无证书启用 QUIC）在启动期就已被 validate 拦下。

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::error::{RatError, RatResult};
use crate::server::adapter::HttpHandler;
use crate::server::alt_svc::{AltSvcRegistry, ServiceKind};
use crate::server::config::ProtocolTuning;
use crate::server::http1::serve_http1_connection;
use crate::server::http2::serve_h2_connection;
use crate::server::http3::serve_h3_endpoint;
use crate::utils::logger::{debug, info};

/// 管道装配依赖（显式注入）
#[derive(Clone)]
pub struct PipelineDeps {
    pub handler: Arc<dyn HttpHandler>,
    pub alt_svc: Arc<AltSvcRegistry>,
    pub tuning: Arc<ProtocolTuning>,
}

/// ALPN 协议检查工具
pub struct AlpnProtocol;

impl AlpnProtocol {
    /// 是否协商出 HTTP/2
    pub fn is_http2(protocol: &Option<Vec<u8>>) -> bool {
        matches!(protocol, Some(p) if p == b"h2")
    }

    /// 是否回落 HTTP/1.1（显式协商或未给出 ALPN）
    pub fn is_http11(protocol: &Option<Vec<u8>>) -> bool {
        matches!(protocol, Some(p) if p == b"http/1.1") || protocol.is_none()
    }
}

/// 装配配方：按传输变体携带各自所需的数据
pub enum PipelineRecipe {
    /// 明文 TCP：HTTP/1.1 编解码 + h2c 升级通道
    Cleartext,
    /// TLS TCP：握手完成后按 ALPN 分流（h2 / http\/1.1）
    Tls { acceptor: TlsAcceptor },
    /// QUIC UDP：HTTP/3 端点
    Quic { endpoint: quinn::Endpoint },
}

impl PipelineRecipe {
    /// 装配并驱动一条接受的 TCP 连接
    pub async fn assemble_tcp(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
        deps: PipelineDeps,
    ) -> RatResult<()> {
        match self {
            PipelineRecipe::Cleartext => {
                debug!("🔗 [管道装配] 明文连接，安装 HTTP/1.1 路径: {}", remote_addr);
                serve_http1_connection(stream, remote_addr, deps, ServiceKind::Http).await
            }
            PipelineRecipe::Tls { acceptor } => {
                debug!("🔐 [管道装配] 开始 TLS 握手: {}", remote_addr);
                let tls_stream = acceptor.accept(stream).await.map_err(|e| {
                    RatError::TlsError(format!("TLS 握手失败: {}", e))
                })?;

                // ALPN 只有在握手完成后才可知：此处即协议分流的续延点
                let alpn_protocol = {
                    let (_, conn) = tls_stream.get_ref();
                    conn.alpn_protocol().map(|p| p.to_vec())
                };
                debug!(
                    "🔐 [管道装配] ALPN 协议: {:?} ({})",
                    alpn_protocol.as_ref().map(|p| String::from_utf8_lossy(p).to_string()),
                    remote_addr
                );

                if AlpnProtocol::is_http2(&alpn_protocol) {
                    info!("🚀 [管道装配] ALPN=h2，安装 HTTP/2 帧编解码: {}", remote_addr);
                    serve_h2_connection(tls_stream, remote_addr, deps, ServiceKind::Https).await
                } else {
                    // 未给出 ALPN 或协商 http/1.1 一律回落 HTTP/1.1 路径
                    info!("🌐 [管道装配] 回落 HTTP/1.1 路径: {}", remote_addr);
                    serve_http1_connection(tls_stream, remote_addr, deps, ServiceKind::Https)
                        .await
                }
            }
            PipelineRecipe::Quic { .. } => Err(RatError::InvalidArgument(
                "QUIC 配方不经由 TCP 装配".to_string(),
            )),
        }
    }

    /// 装配并驱动 QUIC 端点的接受循环
    pub async fn assemble_quic(&self, deps: PipelineDeps) -> RatResult<()> {
        match self {
            PipelineRecipe::Quic { endpoint } => serve_h3_endpoint(endpoint.clone(), deps).await,
            _ => Err(RatError::InvalidArgument(
                "TCP 配方不经由 QUIC 装配".to_string(),
            )),
        }
    }
}
