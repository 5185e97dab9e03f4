//! RAT HttpCore 服务器模块
//!
//! 组合根：绑定所有启用的监听器（明文 TCP / TLS TCP / QUIC UDP），
//! 发布 Alt-Svc 通告表，然后在各自的接受循环里为每条连接装配
//! 协议管道。接受循环永不因单条连接的故障而退出。

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;

use crate::error::{RatError, RatResult};
use crate::utils::logger::{debug, error, info};

pub mod config;
pub mod content;
pub mod exchange;
pub mod adapter;
pub mod alt_svc;
pub mod tls;
pub mod pipeline;
pub mod h2c_upgrade;

mod http1;
mod http2;
mod http3;

pub use adapter::HttpHandler;
pub use alt_svc::{AltSvcRegistry, BoundService, ServiceKind};
pub use config::{AltSvcConfig, Http2Tuning, ProtocolTuning, QuicLimits, ServerConfig, TlsFileConfig};
pub use content::{ContentProducer, ContentSink, ContentSource, SinkHandle, SourceReader};
pub use exchange::{
    check_expectation, keep_alive_allowed, Expectation, ExchangeLifecycle, ExchangeState,
    HttpContext, NegotiatedProtocol, RequestHead, ResponseHead,
};
pub use hyper::{Method, StatusCode, Uri, Version};
pub use pipeline::{AlpnProtocol, PipelineDeps, PipelineRecipe};
pub use tls::TlsMaterial;

/// 错误文案是否属于客户端主动断开一类的安静情况
pub(crate) fn is_quiet_disconnect(message: &str) -> bool {
    message.contains("connection closed")
        || message.contains("broken pipe")
        || message.contains("connection reset")
        || message.contains("unexpected end of file")
        || message.contains("IncompleteMessage")
        || message.contains("连接已关闭")
}

/// 启动服务器并运行到 Ctrl+C 或监听循环致命错误
///
/// 流程：校验配置 → 装载 TLS 材料 → 绑定全部启用的监听器
/// （端口 0 在此解析为系统分配端口）→ 发布 Alt-Svc 通告表 →
/// 并行驱动各接受循环。
pub async fn run_server(
    config: ServerConfig,
    handler: Arc<dyn HttpHandler>,
) -> RatResult<()> {
    config.validate()?;
    crate::utils::crypto_provider::ensure_crypto_provider_installed();

    let alt_registry = Arc::new(AltSvcRegistry::new(
        config.alt_svc.enabled,
        config.alt_svc.max_age,
    ));
    let deps = PipelineDeps {
        handler,
        alt_svc: alt_registry.clone(),
        tuning: Arc::new(config.tuning()),
    };

    // HTTPS 与 HTTP/3 共用同一份证书材料，各自派生口味不同的配置
    let material = match &config.tls {
        Some(tls) => Some(TlsMaterial::load(&tls.cert_path, &tls.key_path)?),
        None => None,
    };

    let mut bound: Vec<BoundService> = Vec::new();
    let mut http_listener: Option<TcpListener> = None;
    let mut https_listener: Option<(TcpListener, PipelineRecipe)> = None;
    let mut quic_recipe: Option<PipelineRecipe> = None;

    if let Some(port) = config.http_port {
        let listener = TcpListener::bind((config.host.as_str(), port))
            .await
            .map_err(RatError::IoError)?;
        let addr = listener.local_addr().map_err(RatError::IoError)?;
        bound.push(BoundService {
            kind: ServiceKind::Http,
            configured_host: config.host.clone(),
            bound_addr: addr,
        });
        http_listener = Some(listener);
    }

    if let Some(port) = config.https_port {
        let tls_material = material
            .as_ref()
            .ok_or_else(|| RatError::ConfigError("HTTPS 监听缺少 TLS 材料".to_string()))?;
        let acceptor = tokio_rustls::TlsAcceptor::from(tls_material.http_server_config()?);
        let listener = TcpListener::bind((config.host.as_str(), port))
            .await
            .map_err(RatError::IoError)?;
        let addr = listener.local_addr().map_err(RatError::IoError)?;
        bound.push(BoundService {
            kind: ServiceKind::Https,
            configured_host: config.host.clone(),
            bound_addr: addr,
        });
        https_listener = Some((listener, PipelineRecipe::Tls { acceptor }));
    }

    if let Some(port) = config.h3_port {
        let tls_material = material
            .as_ref()
            .ok_or_else(|| RatError::ConfigError("HTTP/3 监听缺少 TLS 材料".to_string()))?;
        let server_config = tls_material.quic_server_config(&config.quic)?;
        let bind_addr = resolve_bind_addr(&config.host, port).await?;
        let endpoint =
            quinn::Endpoint::server(server_config, bind_addr).map_err(RatError::IoError)?;
        let addr = endpoint.local_addr().map_err(RatError::IoError)?;
        bound.push(BoundService {
            kind: ServiceKind::Http3,
            configured_host: config.host.clone(),
            bound_addr: addr,
        });
        quic_recipe = Some(PipelineRecipe::Quic { endpoint });
    }

    // 多服务绑定已完成：此刻才知道最终端口，发布通告表
    alt_registry.publish(&bound);

    info!("🚀 RAT HttpCore 服务已启动:");
    for service in &bound {
        info!(
            "   📡 {} 监听: {} (配置主机: {})",
            service.kind.as_str(),
            service.bound_addr,
            service.configured_host
        );
    }

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let http_loop = maybe_run(http_listener.map(|listener| {
        tcp_accept_loop(listener, Arc::new(PipelineRecipe::Cleartext), deps.clone())
    }));
    let https_loop = maybe_run(https_listener.map(|(listener, recipe)| {
        tcp_accept_loop(listener, Arc::new(recipe), deps.clone())
    }));
    let h3_loop = maybe_run(
        quic_recipe.map(|recipe| async move { recipe.assemble_quic(deps.clone()).await }),
    );

    tokio::select! {
        result = http_loop => result,
        result = https_loop => result,
        result = h3_loop => result,
        _ = ctrl_c => {
            info!("🛑 [服务端] 收到 Ctrl+C 信号，正在优雅关闭服务器...");
            Ok(())
        }
    }
}

/// 把主机名+端口解析为可绑定的套接字地址（QUIC 端点需要）
async fn resolve_bind_addr(host: &str, port: u16) -> RatResult<std::net::SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(RatError::IoError)?
        .next()
        .ok_or_else(|| RatError::ConfigError(format!("无法解析绑定地址: {}:{}", host, port)))
}

/// 未启用的监听保持挂起，让 select 只等启用的循环
async fn maybe_run<F>(task: Option<F>) -> RatResult<()>
where
    F: Future<Output = RatResult<()>>,
{
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

/// TCP 接受循环：每条连接独立装配，单条故障不影响监听
async fn tcp_accept_loop(
    listener: TcpListener,
    recipe: Arc<PipelineRecipe>,
    deps: PipelineDeps,
) -> RatResult<()> {
    loop {
        let (stream, remote_addr) = listener.accept().await.map_err(RatError::IoError)?;
        let recipe = recipe.clone();
        let deps = deps.clone();

        tokio::spawn(async move {
            if let Err(err) = recipe.assemble_tcp(stream, remote_addr, deps).await {
                let err_str = err.to_string();
                if is_quiet_disconnect(&err_str) {
                    debug!("🔌 [服务端] 客户端断开连接: {} ({})", remote_addr, err_str);
                } else {
                    error!("❌ [服务端] 连接处理失败: {} ({})", remote_addr, err_str);
                }
            }
        });
    }
}
