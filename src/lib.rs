//! RAT HttpCore 多协议 HTTP 服务核心
//!
//! 把 HTTP/1.1（含 h2c 升级）、HTTP/2（ALPN 协商）与 HTTP/3（QUIC）
//! 汇聚到统一的按连接管道上，并在网络传输与应用侧请求/响应体
//! 生产者-消费者之间协调拉式背压。
//!
//! 本 crate 是服务核心，不包含路由、压缩、缓存等上层设施：
//! 应用处理器（[`server::HttpHandler`]）、TLS 证书材料与监听配置
//! 均由宿主注入。
//!
//! # 示例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rat_httpcore::{RatResult, ServerConfig};
//! use rat_httpcore::server::{HttpContext, HttpHandler};
//!
//! struct Hello;
//!
//! #[async_trait::async_trait]
//! impl HttpHandler for Hello {
//!     async fn handle(&self, ctx: Arc<HttpContext>) -> RatResult<()> {
//!         ctx.respond(rat_httpcore::server::StatusCode::OK, "text/plain", "你好".into());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> RatResult<()> {
//!     let config = ServerConfig::new("127.0.0.1").http_port(8080);
//!     rat_httpcore::run_server(config, Arc::new(Hello)).await
//! }
//! ```

pub mod error;
pub mod utils;
pub mod server;

pub use error::{RatError, RatResult};
pub use server::config::ServerConfig;
pub use server::run_server;

// 便于处理器实现方直接使用的类型
pub use bytes::Bytes;
