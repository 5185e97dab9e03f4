//! 服务器配置
//!
//! 纯声明式的监听配置：每个协议监听是否启用、绑定地址、TLS 材料
//! 文件位置以及 HTTP/2 / QUIC 的调优限额。配置错误在启动期致命
//! （validate），不会变成按连接故障。

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{RatError, RatResult};

/// TLS 证书材料文件位置（PEM 格式；HTTPS 与 HTTP/3 共用同一份材料）
#[derive(Debug, Clone, Deserialize)]
pub struct TlsFileConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// HTTP/2 调优
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Http2Tuning {
    /// 最大帧尺寸（字节）
    pub max_frame_size: u32,
    /// 单连接最大并发流数
    pub max_concurrent_streams: u32,
    /// 初始流量窗口（字节）
    pub initial_window_size: u32,
}

impl Default for Http2Tuning {
    fn default() -> Self {
        Self {
            max_frame_size: 1024 * 1024,
            max_concurrent_streams: 256,
            initial_window_size: 1024 * 1024,
        }
    }
}

/// QUIC 连接级限额（策略值，不是协议要求）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuicLimits {
    /// 最大空闲超时（毫秒），超出无条件关闭连接
    pub max_idle_timeout_ms: u64,
    /// 单连接最大并发双向流数
    pub max_concurrent_bidi_streams: u32,
    /// 单连接最大并发单向流数
    pub max_concurrent_uni_streams: u32,
    /// 连接级接收窗口（字节）
    pub receive_window: u32,
    /// 单流接收窗口（字节）
    pub stream_receive_window: u32,
    /// 是否要求地址验证（Retry 包）。默认宽松，适合可信部署；
    /// 公网部署建议开启。
    pub require_retry: bool,
}

impl Default for QuicLimits {
    fn default() -> Self {
        Self {
            max_idle_timeout_ms: 30_000,
            max_concurrent_bidi_streams: 100,
            max_concurrent_uni_streams: 100,
            receive_window: 16 * 1024 * 1024,
            stream_receive_window: 1024 * 1024,
            require_retry: false,
        }
    }
}

/// Alt-Svc 通告偏好
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AltSvcConfig {
    pub enabled: bool,
    /// 通告有效期（秒）
    pub max_age: u64,
}

impl Default for AltSvcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age: 86_400,
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 配置主机名；同时用于绑定与 Alt-Svc 主机名回退通告
    pub host: String,
    /// 明文 HTTP 监听端口（HTTP/1.1 + h2c 升级）
    pub http_port: Option<u16>,
    /// HTTPS 监听端口（ALPN: h2 / http/1.1）
    pub https_port: Option<u16>,
    /// HTTP/3 监听端口（QUIC/UDP）
    pub h3_port: Option<u16>,
    /// TLS 证书材料；启用 HTTPS 或 HTTP/3 时必须提供
    pub tls: Option<TlsFileConfig>,
    pub http2: Http2Tuning,
    pub quic: QuicLimits,
    pub alt_svc: AltSvcConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            http_port: Some(8080),
            https_port: None,
            h3_port: None,
            tls: None,
            http2: Http2Tuning::default(),
            quic: QuicLimits::default(),
            alt_svc: AltSvcConfig::default(),
        }
    }
}

impl ServerConfig {
    /// 以指定主机名创建配置（默认不启用任何监听）
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            http_port: None,
            ..Default::default()
        }
    }

    pub fn http_port(mut self, port: u16) -> Self {
        self.http_port = Some(port);
        self
    }

    pub fn https_port(mut self, port: u16) -> Self {
        self.https_port = Some(port);
        self
    }

    pub fn h3_port(mut self, port: u16) -> Self {
        self.h3_port = Some(port);
        self
    }

    pub fn tls(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.tls = Some(TlsFileConfig {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        });
        self
    }

    pub fn http2(mut self, tuning: Http2Tuning) -> Self {
        self.http2 = tuning;
        self
    }

    pub fn quic(mut self, limits: QuicLimits) -> Self {
        self.quic = limits;
        self
    }

    pub fn alt_svc(mut self, alt_svc: AltSvcConfig) -> Self {
        self.alt_svc = alt_svc;
        self
    }

    /// 从 TOML 文件加载配置
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> RatResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RatError::ConfigError(format!("读取配置文件失败 {}: {}", path.display(), e))
        })?;
        toml::from_str(&text)
            .map_err(|e| RatError::ConfigError(format!("解析配置文件失败 {}: {}", path.display(), e)))
    }

    /// 启动期校验
    ///
    /// 请求了 HTTPS/HTTP/3 却没有 TLS 材料是装配层没有恢复路径的
    /// 错误，在这里致命退出，而不是留到接受连接时。
    pub fn validate(&self) -> RatResult<()> {
        if self.http_port.is_none() && self.https_port.is_none() && self.h3_port.is_none() {
            return Err(RatError::ConfigError(
                "未启用任何监听协议（http/https/h3 端口均为空）".to_string(),
            ));
        }
        if (self.https_port.is_some() || self.h3_port.is_some()) && self.tls.is_none() {
            return Err(RatError::ConfigError(
                "启用了 HTTPS/HTTP/3 但未提供 TLS 证书材料".to_string(),
            ));
        }
        if self.host.is_empty() {
            return Err(RatError::ConfigError("主机名不能为空".to_string()));
        }
        Ok(())
    }

    /// 汇总协议调优参数，供管道装配注入
    pub(crate) fn tuning(&self) -> ProtocolTuning {
        ProtocolTuning {
            http2: self.http2.clone(),
            quic: self.quic.clone(),
        }
    }
}

/// 管道装配使用的协议调优集合
#[derive(Debug, Clone)]
pub struct ProtocolTuning {
    pub http2: Http2Tuning,
    pub quic: QuicLimits,
}
