//! 错误类型定义
//!
//! 按故障域划分：连接级传输故障只拖垮所在连接，配置错误在启动期致命，
//! 契约违规（如通过失效句柄推送）视为适配层 bug，快速失败。

use thiserror::Error;

/// RAT HttpCore 统一错误类型
#[derive(Debug, Error)]
pub enum RatError {
    /// IO 错误
    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 启动期配置错误（致命，不属于按连接故障）
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// TLS 握手或证书材料错误
    #[error("TLS 错误: {0}")]
    TlsError(String),

    /// 协议编解码或状态机错误（按连接故障）
    #[error("协议错误: {0}")]
    ProtocolError(String),

    /// 对端关闭/复位导致的正常终止
    #[error("连接已关闭: {0}")]
    ConnectionClosed(String),

    /// 应用处理器返回的错误
    #[error("处理器错误: {0}")]
    HandlerError(String),

    /// 编程契约违规（适配层 bug，快速失败而非静默忽略）
    #[error("契约违规: {0}")]
    ContractViolation(String),

    /// 无效参数
    #[error("无效参数: {0}")]
    InvalidArgument(String),
}

/// RAT HttpCore 统一结果类型
pub type RatResult<T> = Result<T, RatError>;

impl RatError {
    /// 是否属于客户端主动断开一类的安静错误（只记 debug 日志）
    pub fn is_client_disconnect(&self) -> bool {
        matches!(self, RatError::ConnectionClosed(_))
    }
}
