//! TLS 材料装载
//!
//! 证书供给/轮换不在本 crate 范围内：环境交来一份 PEM 材料，
//! 这里只负责装载并派生两种口味的 rustls 配置——TCP 监听用
//! （ALPN: h2 + http/1.1）与 QUIC 监听用（ALPN: h3）。

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};

use crate::error::{RatError, RatResult};
use crate::server::config::QuicLimits;
use crate::utils::logger::info;

/// ALPN 令牌
pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";
pub const ALPN_H3: &[u8] = b"h3";

/// 装载完成的 TLS 证书材料
pub struct TlsMaterial {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsMaterial {
    /// 从 PEM 文件装载证书链与私钥
    pub fn load(cert_path: &Path, key_path: &Path) -> RatResult<Self> {
        let cert_file = File::open(cert_path).map_err(|e| {
            RatError::ConfigError(format!("打开证书文件失败 {}: {}", cert_path.display(), e))
        })?;
        let mut cert_reader = BufReader::new(cert_file);
        let certs: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RatError::ConfigError(format!("解析证书失败: {}", e)))?;
        if certs.is_empty() {
            return Err(RatError::ConfigError(format!(
                "证书文件为空: {}",
                cert_path.display()
            )));
        }

        let key_file = File::open(key_path).map_err(|e| {
            RatError::ConfigError(format!("打开私钥文件失败 {}: {}", key_path.display(), e))
        })?;
        let mut key_reader = BufReader::new(key_file);
        let key = private_key(&mut key_reader)
            .map_err(|e| RatError::ConfigError(format!("解析私钥失败: {}", e)))?
            .ok_or_else(|| {
                RatError::ConfigError(format!("私钥文件为空: {}", key_path.display()))
            })?;

        info!(
            "🔐 [TLS] 证书材料已装载: {} ({} 张证书)",
            cert_path.display(),
            certs.len()
        );
        Ok(Self { certs, key })
    }

    fn base_config(&self, alpn: Vec<Vec<u8>>) -> RatResult<rustls::ServerConfig> {
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| RatError::TlsError(format!("构建 TLS 配置失败: {}", e)))?;
        config.alpn_protocols = alpn;
        Ok(config)
    }

    /// TCP 监听使用的 rustls 配置（ALPN: h2 + http/1.1）
    pub fn http_server_config(&self) -> RatResult<Arc<rustls::ServerConfig>> {
        let config = self.base_config(vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()])?;
        Ok(Arc::new(config))
    }

    /// QUIC 监听使用的 quinn 服务端配置（ALPN: h3）
    ///
    /// 连接级限额（空闲超时、数据窗口、并发流数）是可调策略值，
    /// 在此一并装入传输配置。
    pub fn quic_server_config(&self, limits: &QuicLimits) -> RatResult<quinn::ServerConfig> {
        let crypto = self.base_config(vec![ALPN_H3.to_vec()])?;
        let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(Arc::new(crypto))
            .map_err(|e| RatError::TlsError(format!("构建 QUIC TLS 配置失败: {}", e)))?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));

        let mut transport = quinn::TransportConfig::default();
        let idle = quinn::IdleTimeout::try_from(Duration::from_millis(limits.max_idle_timeout_ms))
            .map_err(|_| {
                RatError::InvalidArgument("QUIC 空闲超时超出可编码范围".to_string())
            })?;
        transport.max_idle_timeout(Some(idle));
        transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(
            limits.max_concurrent_bidi_streams,
        ));
        transport.max_concurrent_uni_streams(quinn::VarInt::from_u32(
            limits.max_concurrent_uni_streams,
        ));
        transport.receive_window(quinn::VarInt::from_u32(limits.receive_window));
        transport.stream_receive_window(quinn::VarInt::from_u32(limits.stream_receive_window));
        server_config.transport_config(Arc::new(transport));

        Ok(server_config)
    }
}
